//! Line follower gateway
//!
//! Watches the robot tag's position feed, stops the robot when it reaches the
//! destination and tells the operator over WhatsApp, then does the same once
//! it is back at the origin.
//!
//! Module structure:
//! - `domain/` - Positions, zones, commands, trip state
//! - `io/` - External interfaces (MQTT, CoAP, Twilio, status HTTP)
//! - `services/` - Detection, coordination, command and notification dispatch
//! - `infra/` - Infrastructure (Config, Metrics, Logging)

use clap::Parser;
use follower_gateway::infra::{logging, Config, Metrics};
use follower_gateway::io::{CoapDeviceClient, StatusContext, TwilioNotifier};
use follower_gateway::services::{
    create_command_worker, ArrivalDetector, DeviceClient, LatestPosition, LogNotifier,
    NotificationDispatcher, NotificationTemplates, NotifierClient, TripCoordinator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Line follower gateway - arrival detection, stop commands, operator alerts
#[derive(Parser, Debug)]
#[command(name = "follower-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "follower_gateway_starting");

    let config = Config::load_from_path(&args.config);
    let destination = config.destination_zone();
    let origin = config.origin_zone();

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        device_host = %config.device_host(),
        device_port = %config.device_port(),
        command_timeout_ms = %config.command_timeout().as_millis(),
        poll_interval_ms = %config.poll_interval().as_millis(),
        notify_enabled = %config.notify_enabled(),
        status_port = %config.status_port(),
        "config_loaded"
    );

    for zone in [&destination, &origin] {
        info!(
            zone = zone.kind.as_str(),
            center = %zone.center,
            tolerance = %zone.tolerance,
            "zone_configured"
        );
    }

    if destination.overlaps(&origin) {
        warn!(
            destination = %destination.center,
            origin = %origin.center,
            tolerance = %config.tolerance(),
            "zones_overlap: positions inside both zones only count as destination"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let latest = Arc::new(LatestPosition::new());

    // Device command worker
    let device: Arc<dyn DeviceClient> = Arc::new(CoapDeviceClient::new(config.device_addr()));
    let (commands, worker) = create_command_worker(device, config.command_timeout(), metrics.clone());
    let worker_handle = tokio::spawn(worker.run());

    // Notification channel
    let notifier: Arc<dyn NotifierClient> = if config.notify_enabled() {
        match TwilioNotifier::from_config(&config) {
            Ok(twilio) => {
                info!(url = %twilio.messages_url(), "twilio_notifier_ready");
                Arc::new(twilio)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "twilio_notifier_unavailable: logging only");
                Arc::new(LogNotifier)
            }
        }
    } else {
        Arc::new(LogNotifier)
    };
    let dispatcher = NotificationDispatcher::new(
        notifier,
        NotificationTemplates {
            destination_reached: config.destination_template().to_string(),
            returned_to_origin: config.origin_template().to_string(),
        },
        config.notify_to(),
        config.notify_max_in_flight(),
        metrics.clone(),
    );

    let coordinator = TripCoordinator::new(
        ArrivalDetector::new(destination, origin),
        latest.clone(),
        commands,
        dispatcher,
        metrics.clone(),
    );

    // Position feed
    let mqtt_config = config.clone();
    let mqtt_latest = latest.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = follower_gateway::io::start_position_subscriber(
            &mqtt_config,
            mqtt_latest,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // Status / metrics HTTP server (if port > 0)
    let status_port = config.status_port();
    if status_port > 0 {
        let ctx = StatusContext {
            metrics: metrics.clone(),
            latest: latest.clone(),
            trip: coordinator.subscribe(),
        };
        let status_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                follower_gateway::io::start_status_server(status_port, ctx, status_shutdown).await
            {
                error!(error = %e, "status_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_reporter = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_reporter.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Detection loop runs on this task until shutdown
    coordinator.run(config.poll_interval(), shutdown_rx).await;

    // Coordinator dropped its sender; let the worker finish what is queued
    let drain = config.command_timeout() + Duration::from_secs(1);
    if tokio::time::timeout(drain, worker_handle).await.is_err() {
        warn!("command_worker_drain_timeout");
    }

    metrics.report().log();
    info!("follower_gateway_shutdown_complete");
    Ok(())
}
