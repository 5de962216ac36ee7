//! Single-slot handoff between the MQTT subscriber and the detector tick
//!
//! The subscriber overwrites the slot on every valid report; the tick reads
//! whatever is there. Intermediate samples between ticks are dropped.

use crate::domain::types::Position;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    position: Position,
    stored_at: Instant,
}

/// Latest known tag position, safe to write from any thread
#[derive(Debug, Default)]
pub struct LatestPosition {
    slot: Mutex<Option<Sample>>,
}

impl LatestPosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot with a fresh sample
    #[inline]
    pub fn store(&self, position: Position) {
        *self.slot.lock() = Some(Sample { position, stored_at: Instant::now() });
    }

    /// Most recent position, if any report has arrived yet
    #[inline]
    pub fn load(&self) -> Option<Position> {
        self.slot.lock().map(|s| s.position)
    }

    /// Time since the last store
    pub fn age(&self) -> Option<Duration> {
        self.slot.lock().map(|s| s.stored_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_until_first_store() {
        let latest = LatestPosition::new();
        assert!(latest.load().is_none());
        assert!(latest.age().is_none());
    }

    #[test]
    fn test_store_overwrites() {
        let latest = LatestPosition::new();
        latest.store(Position { x: 0.0, y: 0.0 });
        latest.store(Position { x: 1.0, y: 2.0 });
        assert_eq!(latest.load(), Some(Position { x: 1.0, y: 2.0 }));
        assert!(latest.age().is_some());
    }

    #[test]
    fn test_store_from_other_threads() {
        let latest = Arc::new(LatestPosition::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let latest = latest.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        latest.store(Position { x: i as f64, y: j as f64 });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let last = latest.load().unwrap();
        assert_eq!(last.y, 99.0);
    }
}
