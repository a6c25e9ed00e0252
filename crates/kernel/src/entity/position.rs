use glam::DVec3;
use tracing::warn;

use crate::math::Aabb;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityDimensions {
    pub width: f64,
    pub height: f64,
}

impl EntityDimensions {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            width: self.width * factor,
            height: self.height * factor,
        }
    }

    /// Box centred on `position` horizontally, standing on it vertically.
    pub fn make_box(self, position: DVec3) -> Aabb {
        let half = self.width * 0.5;
        Aabb::new(
            DVec3::new(position.x - half, position.y, position.z - half),
            DVec3::new(position.x + half, position.y + self.height, position.z + half),
        )
    }

    fn is_valid(self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width >= 0.0 && self.height >= 0.0
    }
}

/// Authoritative kinematic state of one entity.
///
/// The bounding box is never stored independently: every mutation of the
/// position or dimensions recomputes it, and non-finite input is rejected
/// before it can reach any field.
#[derive(Debug, Clone)]
pub struct PositionState {
    position: DVec3,
    velocity: DVec3,
    yaw: f32,
    pitch: f32,
    old_position: DVec3,
    old_yaw: f32,
    old_pitch: f32,
    dimensions: EntityDimensions,
    bounding_box: Aabb,
    rejected_inputs: u32,
}

impl PositionState {
    pub fn new(position: DVec3, dimensions: EntityDimensions) -> Self {
        let position = if position.is_finite() {
            position
        } else {
            warn!(field = "position", "rejected_non_finite_input");
            DVec3::ZERO
        };
        Self {
            position,
            velocity: DVec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            old_position: position,
            old_yaw: 0.0,
            old_pitch: 0.0,
            dimensions,
            bounding_box: dimensions.make_box(position),
            rejected_inputs: 0,
        }
    }

    pub fn position(&self) -> DVec3 {
        self.position
    }

    pub fn velocity(&self) -> DVec3 {
        self.velocity
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn old_position(&self) -> DVec3 {
        self.old_position
    }

    pub fn old_yaw(&self) -> f32 {
        self.old_yaw
    }

    pub fn dimensions(&self) -> EntityDimensions {
        self.dimensions
    }

    pub fn bounding_box(&self) -> Aabb {
        self.bounding_box
    }

    pub fn make_box_at(&self, position: DVec3) -> Aabb {
        self.dimensions.make_box(position)
    }

    pub fn set_position(&mut self, position: DVec3) -> bool {
        if !position.is_finite() {
            self.reject("position");
            return false;
        }
        self.position = position;
        self.bounding_box = self.dimensions.make_box(position);
        true
    }

    pub fn set_velocity(&mut self, velocity: DVec3) -> bool {
        if !velocity.is_finite() {
            self.reject("velocity");
            return false;
        }
        self.velocity = velocity;
        true
    }

    pub fn add_velocity(&mut self, impulse: DVec3) -> bool {
        self.set_velocity(self.velocity + impulse)
    }

    /// Yaw is kept in `[-180, 180)`, pitch clamped to `[-90, 90]`.
    pub fn set_rotation(&mut self, yaw: f32, pitch: f32) -> bool {
        if !yaw.is_finite() || !pitch.is_finite() {
            self.reject("rotation");
            return false;
        }
        self.yaw = wrap_degrees(yaw);
        self.pitch = pitch.clamp(-90.0, 90.0);
        true
    }

    pub fn set_yaw(&mut self, yaw: f32) -> bool {
        self.set_rotation(yaw, self.pitch)
    }

    pub fn set_dimensions(&mut self, dimensions: EntityDimensions) -> bool {
        if !dimensions.is_valid() {
            self.reject("dimensions");
            return false;
        }
        self.dimensions = dimensions;
        self.bounding_box = dimensions.make_box(self.position);
        true
    }

    /// Snapshot used by interpolation and the next tick's synthesized movement.
    pub fn save_old(&mut self) {
        self.old_position = self.position;
        self.old_yaw = self.yaw;
        self.old_pitch = self.pitch;
    }

    pub fn take_rejected_inputs(&mut self) -> u32 {
        std::mem::take(&mut self.rejected_inputs)
    }

    fn reject(&mut self, field: &'static str) {
        self.rejected_inputs = self.rejected_inputs.saturating_add(1);
        warn!(field, "rejected_non_finite_input");
    }
}

pub fn wrap_degrees(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}
