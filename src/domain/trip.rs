//! Trip state and the events derived from it

use crate::domain::types::Position;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) trip identifier
pub fn new_trip_id() -> Uuid {
    Uuid::now_v7()
}

/// Process-lifetime trip state
///
/// Both `*_notified` flags go false -> true at most once and never reset.
/// `origin_notified` can only be set while `underway` is already true.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TripState {
    pub trip_id: Option<Uuid>,
    pub underway: bool,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub destination_notified: bool,
    pub origin_notified: bool,
}

impl TripState {
    /// Both events have fired; nothing further can happen this run
    pub fn is_complete(&self) -> bool {
        self.destination_notified && self.origin_notified
    }

    pub fn phase(&self) -> TripPhase {
        if self.origin_notified {
            TripPhase::Returned
        } else if self.underway {
            TripPhase::Underway
        } else {
            TripPhase::Waiting
        }
    }

    /// Duration from destination arrival to return (or to `now` while underway)
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some(end.saturating_duration_since(started))
    }
}

/// Coarse lifecycle label used in logs and the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripPhase {
    Waiting,
    Underway,
    Returned,
}

impl TripPhase {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            TripPhase::Waiting => "waiting",
            TripPhase::Underway => "underway",
            TripPhase::Returned => "returned",
        }
    }
}

/// Transition emitted by the arrival detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripEvent {
    ReachedDestination { trip_id: Uuid, position: Position },
    ReturnedToOrigin { trip_id: Uuid, position: Position, elapsed: Duration },
}

impl TripEvent {
    pub fn kind(&self) -> NotificationKind {
        match self {
            TripEvent::ReachedDestination { .. } => NotificationKind::DestinationReached,
            TripEvent::ReturnedToOrigin { .. } => NotificationKind::ReturnedToOrigin,
        }
    }

    pub fn trip_id(&self) -> Uuid {
        match self {
            TripEvent::ReachedDestination { trip_id, .. }
            | TripEvent::ReturnedToOrigin { trip_id, .. } => *trip_id,
        }
    }

    pub fn position(&self) -> Position {
        match self {
            TripEvent::ReachedDestination { position, .. }
            | TripEvent::ReturnedToOrigin { position, .. } => *position,
        }
    }

    /// Operator notification describing this event
    pub fn to_notification(&self) -> NotificationEvent {
        let elapsed = match self {
            TripEvent::ReachedDestination { .. } => None,
            TripEvent::ReturnedToOrigin { elapsed, .. } => Some(*elapsed),
        };
        NotificationEvent {
            kind: self.kind(),
            trip_id: self.trip_id(),
            position: self.position(),
            elapsed,
        }
    }
}

/// Kind of operator notification; each maps to one configured template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DestinationReached,
    ReturnedToOrigin,
}

impl NotificationKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::DestinationReached => "destination_reached",
            NotificationKind::ReturnedToOrigin => "returned_to_origin",
        }
    }
}

/// Fire-and-forget notification request
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub trip_id: Uuid,
    pub position: Position,
    pub elapsed: Option<Duration>,
}

impl NotificationEvent {
    /// Template variables, keyed the way content templates number them
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("1".to_string(), format!("{:.2}, {:.2}", self.position.x, self.position.y));
        if let Some(elapsed) = self.elapsed {
            vars.insert("2".to_string(), format!("{:.1}", elapsed.as_secs_f64()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_waiting() {
        let state = TripState::default();
        assert_eq!(state.phase(), TripPhase::Waiting);
        assert!(!state.is_complete());
        assert!(state.elapsed(Instant::now()).is_none());
    }

    #[test]
    fn test_elapsed_uses_finish_time_once_returned() {
        let start = Instant::now();
        let state = TripState {
            underway: true,
            started_at: Some(start),
            finished_at: Some(start + Duration::from_secs(42)),
            destination_notified: true,
            origin_notified: true,
            ..Default::default()
        };
        let later = start + Duration::from_secs(600);
        assert_eq!(state.elapsed(later), Some(Duration::from_secs(42)));
        assert_eq!(state.phase(), TripPhase::Returned);
    }

    #[test]
    fn test_notification_variables() {
        let event = TripEvent::ReturnedToOrigin {
            trip_id: new_trip_id(),
            position: Position { x: 0.05, y: -0.1 },
            elapsed: Duration::from_millis(73_240),
        };
        let note = event.to_notification();
        assert_eq!(note.kind, NotificationKind::ReturnedToOrigin);
        let vars = note.variables();
        assert_eq!(vars.get("1").map(String::as_str), Some("0.05, -0.10"));
        assert_eq!(vars.get("2").map(String::as_str), Some("73.2"));
    }

    #[test]
    fn test_destination_notification_has_no_elapsed() {
        let event = TripEvent::ReachedDestination {
            trip_id: new_trip_id(),
            position: Position { x: 1.6, y: 3.0 },
        };
        let note = event.to_notification();
        assert_eq!(note.kind, NotificationKind::DestinationReached);
        assert!(note.elapsed.is_none());
        assert!(!note.variables().contains_key("2"));
    }
}
