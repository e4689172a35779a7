//! World value objects
//!
//! Plain data carried between the agent, the context surface and program
//! code: positions, block references, item stacks and the agent state
//! snapshot. All of them serialize to the JSON shapes programs observe.

use serde::{Deserialize, Serialize};

/// A point in world space. Components are finite doubles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// Euclidean distance in double precision.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Component-wise floor, as integer block coordinates.
    pub fn block(&self) -> (i64, i64, i64) {
        (
            self.x.floor() as i64,
            self.y.floor() as i64,
            self.z.floor() as i64,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A block observed in the world: absolute position plus kind name.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockRef {
    pub position: Position,
    pub kind: String,
}

/// An inventory slot: item name and stack count.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ItemStack {
    pub name: String,
    pub count: u32,
}

/// A snapshot of the agent's physical state.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub position: Position,
    pub yaw: f64,
    pub pitch: f64,
    pub health: f64,
    pub food: f64,
    pub oxygen: f64,
    pub on_ground: bool,
    pub in_water: bool,
    pub in_lava: bool,
}

/// World time as observed by programs. A day is 24000 ticks; daylight is
/// the first 12000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldTime {
    pub day_time: i64,
    pub is_day: bool,
}

impl WorldTime {
    pub fn from_ticks(ticks: i64) -> Self {
        let day_time = ticks.rem_euclid(24000);
        Self {
            day_time,
            is_day: day_time < 12000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_to(&b), 5.0);
    }

    #[test]
    fn block_floors_components() {
        let p = Position::new(1.9, -0.5, 63.0);
        assert_eq!(p.block(), (1, -1, 63));
    }

    #[test]
    fn world_time_day_boundary() {
        assert!(WorldTime::from_ticks(0).is_day);
        assert!(WorldTime::from_ticks(11999).is_day);
        assert!(!WorldTime::from_ticks(12000).is_day);
        assert_eq!(WorldTime::from_ticks(24001).day_time, 1);
    }

    #[test]
    fn agent_state_uses_camel_case() {
        let s = serde_json::to_string(&AgentState::default()).unwrap();
        assert!(s.contains("onGround"));
        assert!(s.contains("inWater"));
    }
}
