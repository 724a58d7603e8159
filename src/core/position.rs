//! Grid Position
//!
//! Integer 2D coordinate used for tiles, players and fights.

use std::fmt;
use serde::{Deserialize, Deserializer, Serialize};

/// 2D integer grid coordinate.
///
/// Serializes as `{"x": .., "y": ..}`. Deserializes from either that
/// object form or a two-element `[x, y]` array, since tile broadcasts
/// carry positions as arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Position {
    /// Column
    pub x: i32,
    /// Row
    pub y: i32,
}

impl Position {
    /// Origin (0, 0)
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    /// Create a new position.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Manhattan (taxicab) distance.
    #[inline]
    pub fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// Euclidean distance.
    pub fn distance(self, other: Self) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }

    /// Offset by (dx, dy).
    #[inline]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }

    /// The four orthogonal neighbours: up, down, left, right.
    pub fn neighbours4(self) -> [Position; 4] {
        [
            self.offset(0, -1),
            self.offset(0, 1),
            self.offset(-1, 0),
            self.offset(1, 0),
        ]
    }

    /// Array form used by tile broadcasts.
    #[inline]
    pub const fn to_array(self) -> [i32; 2] {
        [self.x, self.y]
    }
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

impl From<[i32; 2]> for Position {
    fn from([x, y]: [i32; 2]) -> Self {
        Self::new(x, y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.x, self.y)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PositionRepr {
    Object { x: i32, y: i32 },
    Array([i32; 2]),
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match PositionRepr::deserialize(deserializer)? {
            PositionRepr::Object { x, y } => Position::new(x, y),
            PositionRepr::Array(arr) => Position::from(arr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = Position::new(0, 0);
        let b = Position::new(3, 4);
        assert_eq!(a.manhattan(b), 7);
        assert!((a.distance(b) - 5.0).abs() < 1e-9);
        assert_eq!(b.manhattan(a), 7);
    }

    #[test]
    fn test_accepts_both_wire_forms() {
        let from_obj: Position = serde_json::from_str(r#"{"x":2,"y":-1}"#).unwrap();
        let from_arr: Position = serde_json::from_str("[2,-1]").unwrap();
        assert_eq!(from_obj, from_arr);
        assert_eq!(serde_json::to_string(&from_obj).unwrap(), r#"{"x":2,"y":-1}"#);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(serde_json::from_str::<Position>("[1]").is_err());
        assert!(serde_json::from_str::<Position>(r#"{"x":1}"#).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Position::new(4, 7).to_string(), "4, 7");
    }
}
