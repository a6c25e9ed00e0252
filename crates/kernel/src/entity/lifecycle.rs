use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::position::wrap_degrees;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Killed,
    Discarded,
    UnloadedToChunk,
    UnloadedWithPlayer,
    ChangedDimension,
}

impl RemovalReason {
    /// Destroying removals also sever vehicle and leash relationships.
    pub const fn destroys(self) -> bool {
        matches!(self, Self::Killed | Self::Discarded)
    }

    pub const fn should_save(self) -> bool {
        matches!(self, Self::UnloadedToChunk)
    }
}

/// Which side of the simulation owns an entity's state this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAuthority {
    /// Full physics, block effects, fluids and leash constraints.
    Authoritative,
    /// Interpolates toward synchronized state; no effects are applied.
    Mirrored,
}

/// Which side this simulation instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulationRole {
    #[default]
    Server,
    Client,
}

impl SimulationRole {
    pub fn authority_for(self, locally_controlled: bool) -> TickAuthority {
        match self {
            Self::Server => TickAuthority::Authoritative,
            Self::Client if locally_controlled => TickAuthority::Authoritative,
            Self::Client => TickAuthority::Mirrored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolation {
    pub target: DVec3,
    pub yaw: f32,
    pub pitch: f32,
    pub steps: u32,
}

impl Interpolation {
    /// Advances one step; returns the next position/rotation and whether
    /// the target has been reached.
    pub(crate) fn step(&mut self, position: DVec3, yaw: f32, pitch: f32) -> (DVec3, f32, f32, bool) {
        if self.steps == 0 {
            return (self.target, self.yaw, self.pitch, true);
        }
        let fraction = 1.0 / f64::from(self.steps);
        let next = position + (self.target - position) * fraction;
        let yaw_delta = wrap_degrees(self.yaw - yaw);
        let next_yaw = yaw + yaw_delta * fraction as f32;
        let next_pitch = pitch + (self.pitch - pitch) * fraction as f32;
        self.steps -= 1;
        (next, next_yaw, next_pitch, self.steps == 0)
    }
}
