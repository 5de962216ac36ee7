//! Trip coordination - owns the trip state and fans events out
//!
//! The coordinator is the only place `TripState` changes. On every tick it
//! reads the latest position, runs the detector's transition function, stores
//! the result and, for each event, enqueues one `Stop` and fires one
//! notification. The notification does not wait on (or depend on) the stop
//! command's outcome.


use crate::domain::trip::{TripEvent, TripState};
use crate::domain::types::{Command, Position};
use crate::infra::metrics::Metrics;
use crate::services::command_worker::CommandSender;
use crate::services::detector::{ArrivalDetector, TripEvents};
use crate::services::latest_position::LatestPosition;
use crate::services::notifier::NotificationDispatcher;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct TripCoordinator {
    detector: ArrivalDetector,
    state: TripState,
    latest: Arc<LatestPosition>,
    commands: CommandSender,
    notifier: NotificationDispatcher,
    metrics: Arc<Metrics>,
    /// Snapshot published after every transition (status endpoint)
    state_tx: watch::Sender<TripState>,
}

impl TripCoordinator {
    pub fn new(
        detector: ArrivalDetector,
        latest: Arc<LatestPosition>,
        commands: CommandSender,
        notifier: NotificationDispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        let state = TripState::default();
        let (state_tx, _) = watch::channel(state);
        Self { detector, state, latest, commands, notifier, metrics, state_tx }
    }

    /// Receiver that observes every committed state
    pub fn subscribe(&self) -> watch::Receiver<TripState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> &TripState {
        &self.state
    }

    /// Run detection at a fixed cadence until shutdown
    pub async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = %poll_interval.as_millis(),
            destination = %self.detector.destination().center,
            origin = %self.detector.origin().center,
            tolerance = %self.detector.destination().tolerance,
            "trip_coordinator_started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(phase = self.state.phase().as_str(), "trip_coordinator_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// One detection pass over the latest known position
    pub fn tick(&mut self) -> TripEvents {
        self.metrics.record_detector_tick();
        match self.latest.load() {
            Some(position) => self.process_position(position),
            None => TripEvents::new(),
        }
    }

    /// Evaluate a position, commit the new state and dispatch its events
    pub fn process_position(&mut self, position: Position) -> TripEvents {
        if self.state.is_complete() {
            return TripEvents::new();
        }

        // Paused-clock aware so elapsed times are deterministic under test
        let now = Instant::now().into_std();
        let (next, events) = self.detector.evaluate_at(position, &self.state, now);

        debug!(
            x = %position.x,
            y = %position.y,
            in_destination = self.detector.destination().contains(position),
            in_origin = self.detector.origin().contains(position),
            phase = next.phase().as_str(),
            "tick"
        );

        if next != self.state {
            self.state = next;
            self.state_tx.send_replace(next);
        }

        for event in &events {
            self.handle_event(event);
        }
        events
    }

    fn handle_event(&mut self, event: &TripEvent) {
        let trip_id = event.trip_id();
        match event {
            TripEvent::ReachedDestination { position, .. } => {
                self.metrics.record_destination_event();
                info!(trip_id = %trip_id, position = %position, "destination_reached");
            }
            TripEvent::ReturnedToOrigin { position, elapsed, .. } => {
                self.metrics.record_origin_event();
                info!(
                    trip_id = %trip_id,
                    position = %position,
                    elapsed_ms = %elapsed.as_millis(),
                    "returned_to_origin"
                );
            }
        }

        self.commands.enqueue(Command::Stop, Some(trip_id));
        // Handle intentionally dropped; the task logs its own outcome
        let _ = self.notifier.notify(event.to_notification());
    }
}
