//! IO modules - external system interfaces
//!
//! - `mqtt` - Position feed subscriber and payload validation
//! - `coap` - CoAP codec and UDP client for the robot controller
//! - `twilio` - WhatsApp template notifications
//! - `status` - Status and Prometheus metrics HTTP endpoint

pub mod coap;
pub mod mqtt;
pub mod status;
pub mod twilio;

pub use coap::CoapDeviceClient;
pub use mqtt::{ingest_payload, parse_position, start_position_subscriber, IngestError};
pub use status::{start_status_server, StatusContext};
pub use twilio::TwilioNotifier;
