//! Operator notifications - best-effort, off the detection path
//!
//! Each `notify` call spawns its own task and returns immediately. Sends are
//! bounded by a semaphore so a stalled chat API cannot pile up unbounded work.
//! The task's return value is the failure channel: the outcome is logged and
//! counted there, and nothing else in the gateway depends on it.

use crate::domain::trip::{NotificationEvent, NotificationKind};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound chat message channel
#[async_trait]
pub trait NotifierClient: Send + Sync {
    /// Send the message template `template_id` to `recipient`
    ///
    /// Returns the provider's message identifier.
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, NotifyError>;
}

/// Notifier that only logs; used when no chat provider is configured
pub struct LogNotifier;

#[async_trait]
impl NotifierClient for LogNotifier {
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, NotifyError> {
        info!(
            template = %template_id,
            recipient = %recipient,
            variables = ?variables,
            "notification_logged"
        );
        Ok("log".to_string())
    }
}

/// Template identifier per notification kind
#[derive(Debug, Clone, Default)]
pub struct NotificationTemplates {
    pub destination_reached: String,
    pub returned_to_origin: String,
}

impl NotificationTemplates {
    pub fn for_kind(&self, kind: NotificationKind) -> &str {
        match kind {
            NotificationKind::DestinationReached => &self.destination_reached,
            NotificationKind::ReturnedToOrigin => &self.returned_to_origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { message_id: String },
    Failed { error: String },
}

/// Fire-and-forget dispatcher for operator notifications
#[derive(Clone)]
pub struct NotificationDispatcher {
    client: Arc<dyn NotifierClient>,
    templates: Arc<NotificationTemplates>,
    recipient: Arc<str>,
    permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    pub fn new(
        client: Arc<dyn NotifierClient>,
        templates: NotificationTemplates,
        recipient: impl Into<String>,
        max_in_flight: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let recipient: String = recipient.into();
        Self {
            client,
            templates: Arc::new(templates),
            recipient: Arc::from(recipient),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            metrics,
        }
    }

    /// Dispatch a notification without waiting for it
    ///
    /// The returned handle may be dropped; the send still runs to completion.
    pub fn notify(&self, event: NotificationEvent) -> JoinHandle<NotifyOutcome> {
        let client = self.client.clone();
        let templates = self.templates.clone();
        let recipient = self.recipient.clone();
        let permits = self.permits.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            // Semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            metrics.notification_started();

            let template = templates.for_kind(event.kind);
            let variables = event.variables();
            match client.send(template, &recipient, &variables).await {
                Ok(message_id) => {
                    metrics.record_notification(true);
                    info!(
                        kind = event.kind.as_str(),
                        trip_id = %event.trip_id,
                        message_id = %message_id,
                        "notification_sent"
                    );
                    NotifyOutcome::Sent { message_id }
                }
                Err(e) => {
                    metrics.record_notification(false);
                    error!(
                        kind = event.kind.as_str(),
                        trip_id = %event.trip_id,
                        error = %e,
                        "notification_failed"
                    );
                    NotifyOutcome::Failed { error: e.to_string() }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trip::new_trip_id;
    use crate::domain::types::Position;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        delay: Option<Duration>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotifierClient for RecordingNotifier {
        async fn send(
            &self,
            template_id: &str,
            recipient: &str,
            _variables: &BTreeMap<String, String>,
        ) -> Result<String, NotifyError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(NotifyError::Transport("dns failure".to_string()));
            }
            self.sent.lock().push((template_id.to_string(), recipient.to_string()));
            Ok(format!("SM{}", self.sent.lock().len()))
        }
    }

    fn templates() -> NotificationTemplates {
        NotificationTemplates {
            destination_reached: "HX-dest".to_string(),
            returned_to_origin: "HX-home".to_string(),
        }
    }

    fn event(kind: NotificationKind) -> NotificationEvent {
        NotificationEvent {
            kind,
            trip_id: new_trip_id(),
            position: Position { x: 1.6, y: 3.0 },
            elapsed: None,
        }
    }

    #[tokio::test]
    async fn test_template_chosen_by_kind() {
        let client = Arc::new(RecordingNotifier::default());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = NotificationDispatcher::new(
            client.clone(),
            templates(),
            "whatsapp:+5500000000",
            2,
            metrics.clone(),
        );

        let a = dispatcher.notify(event(NotificationKind::DestinationReached)).await.unwrap();
        let b = dispatcher.notify(event(NotificationKind::ReturnedToOrigin)).await.unwrap();
        assert!(matches!(a, NotifyOutcome::Sent { .. }));
        assert!(matches!(b, NotifyOutcome::Sent { .. }));

        let sent = client.sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                ("HX-dest".to_string(), "whatsapp:+5500000000".to_string()),
                ("HX-home".to_string(), "whatsapp:+5500000000".to_string()),
            ]
        );
        assert_eq!(metrics.notifications_sent(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_captured_in_outcome() {
        let client = Arc::new(RecordingNotifier { fail: true, ..Default::default() });
        let metrics = Arc::new(Metrics::new());
        let dispatcher =
            NotificationDispatcher::new(client, templates(), "whatsapp:+1", 1, metrics.clone());

        let outcome = dispatcher.notify(event(NotificationKind::DestinationReached)).await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Failed { .. }));
        assert_eq!(metrics.notifications_failed(), 1);
        assert_eq!(metrics.notifications_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_returns_before_send_completes() {
        let client = Arc::new(RecordingNotifier {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let metrics = Arc::new(Metrics::new());
        let dispatcher =
            NotificationDispatcher::new(client.clone(), templates(), "r", 1, metrics.clone());

        let handle = dispatcher.notify(event(NotificationKind::DestinationReached));
        assert!(!handle.is_finished());
        assert!(client.sent.lock().is_empty());

        handle.await.unwrap();
        assert_eq!(client.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let outcome = LogNotifier.send("HX", "r", &BTreeMap::new()).await.unwrap();
        assert_eq!(outcome, "log");
    }
}
