//! Arrival detection - turns position samples into one-shot trip events
//!
//! The transition function is pure apart from the `now` it is handed:
//! - inside destination, not yet notified -> `ReachedDestination`, trip starts
//! - else inside origin, trip underway, not yet notified -> `ReturnedToOrigin`
//! - otherwise nothing changes
//!
//! The two checks are exclusive: a point inside overlapping zones only ever
//! triggers the destination transition. After both events have fired the
//! detector is inert for the rest of the process.

use crate::domain::trip::{new_trip_id, TripEvent, TripState};
use crate::domain::types::{Position, Zone};
use smallvec::SmallVec;
use std::time::Instant;

/// Events produced by a single evaluation (never more than one today)
pub type TripEvents = SmallVec<[TripEvent; 1]>;

#[derive(Debug, Clone)]
pub struct ArrivalDetector {
    destination: Zone,
    origin: Zone,
}

impl ArrivalDetector {
    pub fn new(destination: Zone, origin: Zone) -> Self {
        Self { destination, origin }
    }

    pub fn destination(&self) -> &Zone {
        &self.destination
    }

    pub fn origin(&self) -> &Zone {
        &self.origin
    }

    /// Evaluate against the wall clock
    pub fn evaluate(&self, position: Position, state: &TripState) -> (TripState, TripEvents) {
        self.evaluate_at(position, state, Instant::now())
    }

    /// Evaluate one sample against the current state at time `now`
    pub fn evaluate_at(
        &self,
        position: Position,
        state: &TripState,
        now: Instant,
    ) -> (TripState, TripEvents) {
        let mut next = *state;
        let mut events = TripEvents::new();

        if self.destination.contains(position) && !state.destination_notified {
            let trip_id = new_trip_id();
            next.trip_id = Some(trip_id);
            next.underway = true;
            next.started_at = Some(now);
            next.destination_notified = true;
            events.push(TripEvent::ReachedDestination { trip_id, position });
        } else if self.origin.contains(position) && state.underway && !state.origin_notified {
            let elapsed =
                state.started_at.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
            next.finished_at = Some(now);
            next.origin_notified = true;
            events.push(TripEvent::ReturnedToOrigin {
                trip_id: state.trip_id.unwrap_or_else(new_trip_id),
                position,
                elapsed,
            });
        }

        (next, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ZoneKind;
    use std::time::Duration;

    fn detector() -> ArrivalDetector {
        ArrivalDetector::new(
            Zone::new(ZoneKind::Destination, Position { x: 1.6, y: 3.0 }, 0.3),
            Zone::new(ZoneKind::Origin, Position { x: 0.0, y: 0.0 }, 0.3),
        )
    }

    fn pos(x: f64, y: f64) -> Position {
        Position { x, y }
    }

    #[test]
    fn test_outside_both_zones_is_noop() {
        let det = detector();
        let state = TripState::default();
        let (next, events) = det.evaluate(pos(0.8, 1.5), &state);
        assert!(events.is_empty());
        assert_eq!(next, state);
    }

    #[test]
    fn test_reaching_destination_starts_trip() {
        let det = detector();
        let now = Instant::now();
        let (next, events) = det.evaluate_at(pos(1.6, 3.0), &TripState::default(), now);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TripEvent::ReachedDestination { .. }));
        assert!(next.underway);
        assert!(next.destination_notified);
        assert!(!next.origin_notified);
        assert_eq!(next.started_at, Some(now));
        assert_eq!(next.trip_id, Some(events[0].trip_id()));
    }

    #[test]
    fn test_destination_fires_once_while_dwelling() {
        let det = detector();
        let mut state = TripState::default();
        let mut fired = 0;
        for _ in 0..50 {
            let (next, events) = det.evaluate(pos(1.65, 2.95), &state);
            fired += events.len();
            state = next;
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_origin_ignored_before_trip_starts() {
        let det = detector();
        let state = TripState::default();
        for _ in 0..10 {
            let (next, events) = det.evaluate(pos(0.0, 0.0), &state);
            assert!(events.is_empty());
            assert_eq!(next, state);
            assert!(!next.origin_notified);
        }
    }

    #[test]
    fn test_return_reports_elapsed() {
        let det = detector();
        let t0 = Instant::now();
        let (state, _) = det.evaluate_at(pos(1.6, 3.0), &TripState::default(), t0);
        let t1 = t0 + Duration::from_secs(95);
        let (state, events) = det.evaluate_at(pos(0.1, -0.1), &state, t1);

        assert_eq!(events.len(), 1);
        match events[0] {
            TripEvent::ReturnedToOrigin { trip_id, elapsed, .. } => {
                assert_eq!(elapsed, Duration::from_secs(95));
                assert_eq!(Some(trip_id), state.trip_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(state.origin_notified);
        assert_eq!(state.finished_at, Some(t1));
        assert!(state.is_complete());
    }

    #[test]
    fn test_inert_after_both_events() {
        let det = detector();
        let (state, _) = det.evaluate(pos(1.6, 3.0), &TripState::default());
        let (state, _) = det.evaluate(pos(0.0, 0.0), &state);
        assert!(state.is_complete());

        for p in [pos(1.6, 3.0), pos(0.0, 0.0), pos(0.8, 1.5), pos(1.6, 3.0), pos(0.0, 0.0)] {
            let (next, events) = det.evaluate(p, &state);
            assert!(events.is_empty(), "detector fired after completion at {p}");
            assert_eq!(next, state);
        }
    }

    #[test]
    fn test_overlapping_zones_prefer_destination() {
        let det = ArrivalDetector::new(
            Zone::new(ZoneKind::Destination, Position { x: 0.0, y: 0.0 }, 0.5),
            Zone::new(ZoneKind::Origin, Position { x: 0.2, y: 0.0 }, 0.5),
        );
        let (state, events) = det.evaluate(pos(0.1, 0.0), &TripState::default());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TripEvent::ReachedDestination { .. }));

        // Once destination has fired the same point now counts as a return
        let (state, events) = det.evaluate(pos(0.1, 0.0), &state);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TripEvent::ReturnedToOrigin { .. }));
        assert!(state.is_complete());
    }

    #[test]
    fn test_per_axis_tolerance_edges() {
        let det = detector();
        let (_, inside) = det.evaluate(pos(1.6 + 0.29, 3.0 + 0.29), &TripState::default());
        assert_eq!(inside.len(), 1);
        let (_, outside) = det.evaluate(pos(1.6 + 0.31, 3.0), &TripState::default());
        assert!(outside.is_empty());
    }
}
