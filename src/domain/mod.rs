//! Domain models - positions, zones, commands and trip state
//!
//! - `types` - `Position`, `Zone`, `Command`
//! - `trip` - `TripState`, `TripEvent` and operator notifications

pub mod trip;
pub mod types;

pub use trip::{NotificationEvent, NotificationKind, TripEvent, TripPhase, TripState};
pub use types::{Command, Position, Zone, ZoneKind};
