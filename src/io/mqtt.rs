//! MQTT position feed - PositionIngest
//!
//! The positioning tag publishes JSON reports like
//! `{"position": {"x": 1.59, "y": 3.02, "z": 0.0, "quality": 84}, ...}`.
//! Only `position.x` and `position.y` are read. Anything that does not yield
//! two finite coordinates is discarded here and never reaches the detector.

use crate::domain::types::Position;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::latest_position::LatestPosition;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a payload was not accepted as a position
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not a location report: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("coordinate {axis} is not a number: {value:?}")]
    NotNumeric { axis: &'static str, value: String },
    #[error("non-finite coordinates ({x}, {y})")]
    NonFinite { x: f64, y: f64 },
}

impl IngestError {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestError::InvalidUtf8(_) => "invalid_utf8",
            IngestError::InvalidJson(_) => "invalid_json",
            IngestError::NotNumeric { .. } => "not_numeric",
            IngestError::NonFinite { .. } => "non_finite",
        }
    }
}

#[derive(Debug, Deserialize)]
struct LocationMessage {
    position: RawPosition,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    x: Coordinate,
    y: Coordinate,
}

/// Some firmware revisions send coordinates as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    fn to_f64(&self, axis: &'static str) -> Result<f64, IngestError> {
        match self {
            Coordinate::Number(v) => Ok(*v),
            Coordinate::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| IngestError::NotNumeric { axis, value: s.clone() }),
        }
    }
}

/// Decode a raw location report into a validated position
pub fn parse_position(payload: &[u8]) -> Result<Position, IngestError> {
    let text = std::str::from_utf8(payload)?;
    let message: LocationMessage = serde_json::from_str(text)?;
    let x = message.position.x.to_f64("x")?;
    let y = message.position.y.to_f64("y")?;
    Position::new(x, y).ok_or(IngestError::NonFinite { x, y })
}

/// Validate one payload and publish it to the latest-position cell
///
/// Malformed payloads are logged and counted; the cell keeps its previous value.
pub fn ingest_payload(
    payload: &[u8],
    latest: &LatestPosition,
    metrics: &Metrics,
) -> Result<Position, IngestError> {
    match parse_position(payload) {
        Ok(position) => {
            latest.store(position);
            metrics.record_position_received();
            Ok(position)
        }
        Err(e) => {
            metrics.record_position_discarded();
            debug!(kind = e.as_str(), error = %e, "position_discarded");
            Err(e)
        }
    }
}

/// Lets one warning through per window; the first is never held back
struct WarnLimiter {
    every: Duration,
    last: Option<Instant>,
}

impl WarnLimiter {
    fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.every => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Subscribe to the position topic and feed the latest-position cell
///
/// Runs until shutdown. Broker errors are logged and the event loop keeps
/// polling, which makes rumqttc reconnect.
pub async fn start_position_subscriber(
    config: &Config,
    latest: Arc<LatestPosition>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(60));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    let topic = config.mqtt_topic().to_string();

    info!(topic = %topic, host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_client_started");

    let mut discard_warn = WarnLimiter::new(Duration::from_secs(5));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    let _ = client.try_disconnect();
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Err(e) = ingest_payload(&publish.payload, &latest, &metrics) {
                            if discard_warn.ready() {
                                warn!(
                                    topic = %publish.topic,
                                    kind = e.as_str(),
                                    error = %e,
                                    "position_discarded"
                                );
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Clean session: subscribe again on every (re)connect
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            error!(error = %e, topic = %topic, "mqtt_subscribe_failed");
                        } else {
                            info!(topic = %topic, "mqtt_connected");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_discard_warnings_rate_limited() {
        let mut limiter = WarnLimiter::new(Duration::from_secs(5));
        assert!(limiter.ready());
        assert!(!limiter.ready());

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(!limiter.ready());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.ready());
        assert!(!limiter.ready());
    }

    #[test]
    fn test_parse_location_report() {
        let payload = br#"{"position":{"x":1.59,"y":3.02,"z":0.0,"quality":84},"superFrameNumber":12}"#;
        let pos = parse_position(payload).unwrap();
        assert_eq!(pos, Position { x: 1.59, y: 3.02 });
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let pos = parse_position(br#"{"position":{"x":"1.5","y":" -0.25 "}}"#).unwrap();
        assert_eq!(pos, Position { x: 1.5, y: -0.25 });
    }

    #[test]
    fn test_non_finite_strings_rejected() {
        for payload in [
            br#"{"position":{"x":"NaN","y":1.0}}"#.as_slice(),
            br#"{"position":{"x":1.0,"y":"inf"}}"#.as_slice(),
            br#"{"position":{"x":"-infinity","y":"nan"}}"#.as_slice(),
        ] {
            assert!(matches!(parse_position(payload), Err(IngestError::NonFinite { .. })));
        }
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            parse_position(br#"{"position":{"x":"abc","y":1.0}}"#),
            Err(IngestError::NotNumeric { axis: "x", .. })
        ));
        // Missing y
        assert!(matches!(
            parse_position(br#"{"position":{"x":"abc"}}"#),
            Err(IngestError::InvalidJson(_))
        ));
        assert!(matches!(parse_position(br#"{"x":1,"y":2}"#), Err(IngestError::InvalidJson(_))));
        assert!(matches!(
            parse_position(br#"{"position":{"x":null,"y":2}}"#),
            Err(IngestError::InvalidJson(_))
        ));
        assert!(matches!(parse_position(b"not json"), Err(IngestError::InvalidJson(_))));
        assert!(matches!(parse_position(&[0xff, 0xfe]), Err(IngestError::InvalidUtf8(_))));
    }

    #[test]
    fn test_malformed_payload_leaves_latest_untouched() {
        let latest = LatestPosition::new();
        let metrics = Metrics::new();

        assert!(ingest_payload(br#"{"position":{"x":"abc"}}"#, &latest, &metrics).is_err());
        assert!(ingest_payload(br#"{"position":{"x":"NaN","y":"NaN"}}"#, &latest, &metrics).is_err());
        assert_eq!(latest.load(), None);

        ingest_payload(br#"{"position":{"x":0.8,"y":1.5}}"#, &latest, &metrics).unwrap();
        assert!(ingest_payload(b"{}", &latest, &metrics).is_err());
        assert_eq!(latest.load(), Some(Position { x: 0.8, y: 1.5 }));

        assert_eq!(metrics.positions_received(), 1);
        assert_eq!(metrics.positions_discarded(), 3);
    }
}
