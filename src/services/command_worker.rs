//! Device command worker - delivers commands off the detection path
//!
//! The coordinator enqueues commands on an unbounded channel and never waits.
//! A single worker drains the queue in order, one delivery at a time, each
//! bounded by the command timeout. Failures are logged and counted; they are
//! never retried and never reported back to the enqueuing side.

use crate::domain::types::Command;
use crate::infra::metrics::Metrics;
use crate::services::device::{DeviceClient, DeviceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A device command waiting for delivery
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    /// Trip that triggered the command, if any
    pub trip_id: Option<Uuid>,
    /// When the command was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// How a single delivery attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { response: String },
    TimedOut,
    Failed { error: String },
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::TimedOut => "timeout",
            DeliveryOutcome::Failed { .. } => "failed",
        }
    }
}

/// Outcome side channel entry, one per dequeued command
#[derive(Debug, Clone)]
pub struct CommandReport {
    pub command: Command,
    pub trip_id: Option<Uuid>,
    pub outcome: DeliveryOutcome,
    pub latency: Duration,
}

/// Non-blocking handle used to enqueue commands
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    metrics: Arc<Metrics>,
}

impl CommandSender {
    /// Queue a command for delivery; returns false only if the worker is gone
    pub fn enqueue(&self, command: Command, trip_id: Option<Uuid>) -> bool {
        let queued = QueuedCommand { command, trip_id, enqueued_at: Instant::now() };
        match self.tx.send(queued) {
            Ok(()) => {
                self.metrics.record_command_enqueued();
                debug!(command = command.as_str(), "command_enqueued");
                true
            }
            Err(_) => {
                error!(command = command.as_str(), "command_worker_gone");
                false
            }
        }
    }
}

/// Worker that delivers queued commands to the device, strictly one at a time
pub struct CommandWorker {
    device: Arc<dyn DeviceClient>,
    cmd_rx: mpsc::UnboundedReceiver<QueuedCommand>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    report_tx: Option<mpsc::UnboundedSender<CommandReport>>,
}

impl CommandWorker {
    /// Publish a [`CommandReport`] for every processed command
    pub fn with_report_tx(mut self, tx: mpsc::UnboundedSender<CommandReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    /// Run the worker, processing commands until every sender is dropped
    pub async fn run(mut self) {
        info!(timeout_ms = %self.timeout.as_millis(), "command_worker_started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            self.metrics.record_command_dequeued();
            let report = self.deliver(cmd).await;
            if let Some(ref tx) = self.report_tx {
                let _ = tx.send(report);
            }
        }

        info!("command_worker_stopped");
    }

    async fn deliver(&self, cmd: QueuedCommand) -> CommandReport {
        let queue_delay_ms = cmd.enqueued_at.elapsed().as_millis() as u64;
        let path = cmd.command.path();
        let payload = cmd.command.payload();
        let trip_id = cmd.trip_id.map(|id| id.to_string()).unwrap_or_default();

        let start = Instant::now();
        // Outer bound in case the client does not honour its own timeout
        let result =
            match tokio::time::timeout(self.timeout, self.device.put(path, &payload, self.timeout))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DeviceError::Timeout(self.timeout)),
            };
        let latency = start.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let outcome = match result {
            Ok(response) => {
                let response = String::from_utf8_lossy(&response).into_owned();
                self.metrics.record_command_delivered(latency_ms);
                info!(
                    command = cmd.command.as_str(),
                    path = %path,
                    trip_id = %trip_id,
                    queue_delay_ms = %queue_delay_ms,
                    latency_ms = %latency_ms,
                    response = %response,
                    "command_delivered"
                );
                DeliveryOutcome::Delivered { response }
            }
            Err(DeviceError::Timeout(after)) => {
                self.metrics.record_command_timeout();
                warn!(
                    command = cmd.command.as_str(),
                    path = %path,
                    trip_id = %trip_id,
                    timeout_ms = %after.as_millis(),
                    "command_timeout"
                );
                DeliveryOutcome::TimedOut
            }
            Err(e) => {
                self.metrics.record_command_failed();
                error!(
                    command = cmd.command.as_str(),
                    path = %path,
                    trip_id = %trip_id,
                    kind = e.as_str(),
                    error = %e,
                    latency_ms = %latency_ms,
                    "command_failed"
                );
                DeliveryOutcome::Failed { error: e.to_string() }
            }
        };

        CommandReport { command: cmd.command, trip_id: cmd.trip_id, outcome, latency }
    }
}

/// Create a command channel and its worker
///
/// Returns the sender (for the coordinator) and the worker (to be spawned)
pub fn create_command_worker(
    device: Arc<dyn DeviceClient>,
    timeout: Duration,
    metrics: Arc<Metrics>,
) -> (CommandSender, CommandWorker) {
    let (tx, cmd_rx) = mpsc::unbounded_channel();
    let sender = CommandSender { tx, metrics: metrics.clone() };
    let worker = CommandWorker { device, cmd_rx, timeout, metrics, report_tx: None };
    (sender, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Device fake: hangs on paths listed in `hang`, fails on `fail`, else answers "ok"
    #[derive(Default)]
    struct ScriptedDevice {
        hang: Vec<&'static str>,
        fail: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
        active: Mutex<usize>,
        max_active: Mutex<usize>,
    }

    #[async_trait]
    impl DeviceClient for ScriptedDevice {
        async fn put(
            &self,
            path: &str,
            _payload: &[u8],
            _timeout: Duration,
        ) -> Result<Bytes, DeviceError> {
            self.calls.lock().push(path.to_string());
            {
                let mut active = self.active.lock();
                *active += 1;
                let mut max = self.max_active.lock();
                *max = (*max).max(*active);
            }
            let result = if self.hang.iter().any(|p| *p == path) {
                // Ignores its own timeout; only the worker's bound stops it
                std::future::pending::<()>().await;
                unreachable!()
            } else if self.fail.iter().any(|p| *p == path) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(DeviceError::Transport("connection refused".to_string()))
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Bytes::from_static(b"ok"))
            };
            *self.active.lock() -= 1;
            result
        }
    }

    fn spawn_worker(
        device: Arc<ScriptedDevice>,
        timeout: Duration,
    ) -> (CommandSender, mpsc::UnboundedReceiver<CommandReport>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (sender, worker) = create_command_worker(device, timeout, metrics.clone());
        tokio::spawn(worker.with_report_tx(report_tx).run());
        (sender, report_rx, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_enqueue_order() {
        let device = Arc::new(ScriptedDevice::default());
        let (sender, mut reports, metrics) = spawn_worker(device.clone(), Duration::from_secs(5));

        assert!(sender.enqueue(Command::Stop, None));
        assert!(sender.enqueue(Command::Start, None));
        assert!(sender.enqueue(Command::InvertLogic, None));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let report = reports.recv().await.unwrap();
            assert!(matches!(report.outcome, DeliveryOutcome::Delivered { .. }));
            seen.push(report.command);
        }
        assert_eq!(seen, vec![Command::Stop, Command::Start, Command::InvertLogic]);
        assert_eq!(*device.calls.lock(), vec!["stop", "start", "inverterLogica"]);
        assert_eq!(*device.max_active.lock(), 1);
        assert_eq!(metrics.commands_delivered(), 3);
        assert_eq!(metrics.command_queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_block_queue() {
        let device = Arc::new(ScriptedDevice { hang: vec!["stop"], ..Default::default() });
        let (sender, mut reports, metrics) = spawn_worker(device, Duration::from_secs(5));

        // enqueue returns immediately even though the first delivery will hang
        assert!(sender.enqueue(Command::Stop, None));
        assert!(sender.enqueue(Command::Start, None));

        let first = reports.recv().await.unwrap();
        assert_eq!(first.command, Command::Stop);
        assert_eq!(first.outcome, DeliveryOutcome::TimedOut);
        assert!(first.latency >= Duration::from_secs(5));

        let second = reports.recv().await.unwrap();
        assert_eq!(second.command, Command::Start);
        assert!(matches!(second.outcome, DeliveryOutcome::Delivered { .. }));

        assert_eq!(metrics.commands_timed_out(), 1);
        assert_eq!(metrics.commands_delivered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_reported_not_retried() {
        let device = Arc::new(ScriptedDevice { fail: vec!["stop"], ..Default::default() });
        let (sender, mut reports, metrics) = spawn_worker(device.clone(), Duration::from_secs(5));

        sender.enqueue(Command::Stop, Some(Uuid::now_v7()));
        let report = reports.recv().await.unwrap();
        assert!(matches!(report.outcome, DeliveryOutcome::Failed { .. }));
        assert!(report.trip_id.is_some());

        sender.enqueue(Command::Start, None);
        let report = reports.recv().await.unwrap();
        assert!(matches!(report.outcome, DeliveryOutcome::Delivered { .. }));

        assert_eq!(*device.calls.lock(), vec!["stop", "start"]);
        assert_eq!(metrics.commands_failed(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_dropped() {
        let metrics = Arc::new(Metrics::new());
        let device: Arc<dyn DeviceClient> = Arc::new(ScriptedDevice::default());
        let (sender, worker) = create_command_worker(device, Duration::from_secs(1), metrics);
        drop(worker);
        assert!(!sender.enqueue(Command::Stop, None));
    }
}
