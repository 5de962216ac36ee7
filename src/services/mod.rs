//! Services - trip logic and dispatch
//!
//! - `detector` - Arrival detection state machine (pure transition function)
//! - `coordinator` - Owns trip state, wires events to commands and notifications
//! - `command_worker` - Single-consumer device command queue
//! - `device` - Device-control capability
//! - `notifier` - Notification capability and fire-and-forget dispatcher
//! - `latest_position` - Single-slot position handoff

pub mod command_worker;
pub mod coordinator;
pub mod detector;
pub mod device;
pub mod latest_position;
pub mod notifier;

pub use command_worker::{create_command_worker, CommandReport, CommandSender, CommandWorker};
pub use coordinator::TripCoordinator;
pub use detector::ArrivalDetector;
pub use device::{DeviceClient, DeviceError};
pub use latest_position::LatestPosition;
pub use notifier::{
    LogNotifier, NotificationDispatcher, NotificationTemplates, NotifierClient, NotifyError,
};
