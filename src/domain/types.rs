//! Shared value types for the follower gateway

use serde::{Deserialize, Serialize};

/// Planar tag position reported by the positioning feed (metres)
///
/// Only ever constructed from finite coordinates; see [`Position::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Build a position, rejecting NaN and infinities
    #[inline]
    pub fn new(x: f64, y: f64) -> Option<Self> {
        if x.is_finite() && y.is_finite() {
            Some(Self { x, y })
        } else {
            None
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// Which configured zone a check refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Destination,
    Origin,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Destination => "destination",
            ZoneKind::Origin => "origin",
        }
    }
}

/// Axis-aligned tolerance box around a configured point
///
/// Containment is checked per axis (strict `<`), not by radial distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub kind: ZoneKind,
    pub center: Position,
    pub tolerance: f64,
}

impl Zone {
    pub fn new(kind: ZoneKind, center: Position, tolerance: f64) -> Self {
        Self { kind, center, tolerance }
    }

    #[inline]
    pub fn contains(&self, point: Position) -> bool {
        (point.x - self.center.x).abs() < self.tolerance
            && (point.y - self.center.y).abs() < self.tolerance
    }

    /// True if some point could lie inside both boxes
    pub fn overlaps(&self, other: &Zone) -> bool {
        let reach = self.tolerance + other.tolerance;
        (self.center.x - other.center.x).abs() < reach
            && (self.center.y - other.center.y).abs() < reach
    }
}

/// Device command placed on the dispatch queue
///
/// The arrival pipeline only ever issues `Stop`; the remaining variants are
/// the rest of the controller's resource set, used by operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Start,
    InvertLogic,
    SetSpeed { left: u8, right: u8 },
}

impl Command {
    /// Resource path on the device controller
    pub fn path(&self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Start => "start",
            Command::InvertLogic => "inverterLogica",
            Command::SetSpeed { .. } => "setVelocidade",
        }
    }

    /// Request body understood by the controller firmware
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::Stop | Command::Start | Command::InvertLogic => b"1".to_vec(),
            Command::SetSpeed { left, right } => format!("{left},{right}").into_bytes(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Start => "start",
            Command::InvertLogic => "invert_logic",
            Command::SetSpeed { .. } => "set_speed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Zone {
        Zone::new(ZoneKind::Destination, Position { x: 1.6, y: 3.0 }, 0.3)
    }

    #[test]
    fn test_position_rejects_non_finite() {
        assert!(Position::new(f64::NAN, 1.0).is_none());
        assert!(Position::new(1.0, f64::INFINITY).is_none());
        assert!(Position::new(f64::NEG_INFINITY, 0.0).is_none());
        assert_eq!(Position::new(1.0, 2.0), Some(Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn test_zone_containment_is_per_axis() {
        let zone = destination();
        // Diagonal offset of 0.29 on both axes is ~0.41 radially but still inside
        assert!(zone.contains(Position { x: 1.6 + 0.29, y: 3.0 + 0.29 }));
        assert!(!zone.contains(Position { x: 1.6 + 0.31, y: 3.0 }));
        assert!(!zone.contains(Position { x: 1.6, y: 3.0 - 0.31 }));
    }

    #[test]
    fn test_zone_boundary_is_exclusive() {
        let zone = Zone::new(ZoneKind::Origin, Position { x: 0.0, y: 0.0 }, 0.5);
        assert!(!zone.contains(Position { x: 0.5, y: 0.0 }));
        assert!(zone.contains(Position { x: 0.49, y: -0.49 }));
    }

    #[test]
    fn test_zone_overlap() {
        let origin = Zone::new(ZoneKind::Origin, Position { x: 0.0, y: 0.0 }, 0.3);
        assert!(!destination().overlaps(&origin));

        let near = Zone::new(ZoneKind::Origin, Position { x: 1.2, y: 2.8 }, 0.3);
        assert!(destination().overlaps(&near));
    }

    #[test]
    fn test_command_wire_mapping() {
        assert_eq!(Command::Stop.path(), "stop");
        assert_eq!(Command::Stop.payload(), b"1".to_vec());
        assert_eq!(Command::InvertLogic.path(), "inverterLogica");
        let speed = Command::SetSpeed { left: 100, right: 120 };
        assert_eq!(speed.path(), "setVelocidade");
        assert_eq!(speed.payload(), b"100,120".to_vec());
    }
}
