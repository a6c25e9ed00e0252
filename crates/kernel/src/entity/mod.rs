mod lifecycle;
mod position;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collision::PistonLimiter;
use crate::leash::{LeashData, LeashHooks};
use crate::math::Aabb;
use crate::recorder::MovementRecorder;
use crate::world::FluidKind;

pub use lifecycle::{Interpolation, RemovalReason, SimulationRole, TickAuthority};
pub use position::{wrap_degrees, EntityDimensions, PositionState};

const MAX_FROZEN_TICKS: i32 = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityUuid(pub u128);

impl fmt::Display for EntityUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Process-wide source of entity ids. Ids are never reused; share one
/// allocator between every simulation that can exchange entities.
#[derive(Debug)]
pub struct EntityIdAllocator {
    next: AtomicU64,
    namespace: u64,
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EntityIdAllocator {
    pub fn new(namespace: u64) -> Self {
        Self {
            next: AtomicU64::new(1),
            namespace,
        }
    }

    pub fn allocate(&self) -> EntityId {
        EntityId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn uuid_for(&self, id: EntityId) -> EntityUuid {
        EntityUuid((u128::from(self.namespace) << 64) | u128::from(id.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Pose {
    #[default]
    Standing,
    Crouching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoverKind {
    SelfDriven,
    Piston,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DamageSource {
    Fall,
    HotFloor,
    Fire,
    Lava,
    Freeze,
}

/// Damage is outside the kernel; entity kinds plug their own handling in here.
pub trait DamageHooks: fmt::Debug + Send + Sync {
    fn on_fall(&self, _entity: &mut Entity, _distance: f64, _multiplier: f64, _source: DamageSource) -> bool {
        false
    }

    fn on_hurt(&self, _entity: &mut Entity, _source: DamageSource) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsProfile {
    pub step_height: f64,
    pub gravity: f64,
    pub vertical_drag: f64,
    pub no_physics: bool,
    pub pushable: bool,
    /// Other entities collide with this one as with a block.
    pub solid_collider: bool,
}

impl Default for PhysicsProfile {
    fn default() -> Self {
        Self {
            step_height: 0.6,
            gravity: 0.08,
            vertical_drag: 0.98,
            no_physics: false,
            pushable: true,
            solid_collider: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluidProfile {
    pub pushed_by_fluid: bool,
    /// Keep the raw averaged flow instead of normalizing it.
    pub precise_flow: bool,
}

impl Default for FluidProfile {
    fn default() -> Self {
        Self {
            pushed_by_fluid: true,
            precise_flow: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeashProfile {
    pub quad: bool,
    pub snap_distance: Option<f64>,
    pub elastic_distance: Option<f64>,
    pub hooks: Arc<dyn LeashHooks>,
}

/// Capabilities shared by every entity of one kind.
#[derive(Debug, Clone)]
pub struct EntityProfile {
    pub kind: String,
    pub dimensions: EntityDimensions,
    pub pose_dimensions: Vec<(Pose, EntityDimensions)>,
    pub physics: PhysicsProfile,
    pub fluid: FluidProfile,
    pub leash: Option<LeashProfile>,
    pub quad_leash_holder: bool,
    pub leash_knot: bool,
    pub damage: Option<Arc<dyn DamageHooks>>,
}

impl EntityProfile {
    pub fn new(kind: impl Into<String>, dimensions: EntityDimensions) -> Self {
        Self {
            kind: kind.into(),
            dimensions,
            pose_dimensions: Vec::new(),
            physics: PhysicsProfile::default(),
            fluid: FluidProfile::default(),
            leash: None,
            quad_leash_holder: false,
            leash_knot: false,
            damage: None,
        }
    }

    /// Fixed anchor a leash ties to when attached to a block.
    pub fn leash_knot() -> Self {
        let mut profile = Self::new("leash_knot", EntityDimensions::new(0.375, 0.5));
        profile.physics = PhysicsProfile {
            step_height: 0.0,
            gravity: 0.0,
            no_physics: true,
            pushable: false,
            ..PhysicsProfile::default()
        };
        profile.fluid.pushed_by_fluid = false;
        profile.leash_knot = true;
        profile
    }

    pub fn with_pose(mut self, pose: Pose, dimensions: EntityDimensions) -> Self {
        self.pose_dimensions.push((pose, dimensions));
        self
    }

    pub fn with_physics(mut self, physics: PhysicsProfile) -> Self {
        self.physics = physics;
        self
    }

    pub fn with_fluid(mut self, fluid: FluidProfile) -> Self {
        self.fluid = fluid;
        self
    }

    pub fn with_leash(mut self, leash: LeashProfile) -> Self {
        self.leash = Some(leash);
        self
    }

    pub fn with_quad_leash_holder(mut self) -> Self {
        self.quad_leash_holder = true;
        self
    }

    pub fn with_damage(mut self, damage: Arc<dyn DamageHooks>) -> Self {
        self.damage = Some(damage);
        self
    }

    pub fn dimensions_for(&self, pose: Pose) -> EntityDimensions {
        self.pose_dimensions
            .iter()
            .find(|(candidate, _)| *candidate == pose)
            .map(|(_, dimensions)| *dimensions)
            .unwrap_or(self.dimensions)
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) id: EntityId,
    pub(crate) uuid: EntityUuid,
    pub(crate) profile: Arc<EntityProfile>,
    pub(crate) position: PositionState,
    pub(crate) pose: Pose,
    pub(crate) on_ground: bool,
    pub(crate) horizontal_collision: bool,
    pub(crate) vertical_collision: bool,
    pub(crate) vertical_collision_below: bool,
    pub(crate) fall_distance: f64,
    pub(crate) ground_friction: f64,
    pub(crate) stuck_speed_multiplier: DVec3,
    pub(crate) fluid_heights: HashMap<FluidKind, f64>,
    pub(crate) was_touching_water: bool,
    pub(crate) was_in_lava: bool,
    pub(crate) first_tick: bool,
    pub(crate) recorder: MovementRecorder,
    pub(crate) piston: PistonLimiter,
    pub(crate) removal: Option<RemovalReason>,
    pub(crate) vehicle: Option<EntityId>,
    pub(crate) passengers: Vec<EntityId>,
    pub(crate) leash: LeashData,
    pub(crate) tick_count: u64,
    pub(crate) remaining_fire_ticks: i32,
    pub(crate) ticks_frozen: i32,
    pub(crate) walk_distance: f64,
    pub(crate) next_step_distance: f64,
    pub(crate) interpolation: Option<Interpolation>,
    pub(crate) locally_controlled: bool,
    pub(crate) needs_sync: bool,
    pub(crate) last_hurt: Option<DamageSource>,
}

impl Entity {
    pub fn new(id: EntityId, uuid: EntityUuid, profile: Arc<EntityProfile>, position: DVec3) -> Self {
        let dimensions = profile.dimensions_for(Pose::Standing);
        Self {
            id,
            uuid,
            profile,
            position: PositionState::new(position, dimensions),
            pose: Pose::Standing,
            on_ground: false,
            horizontal_collision: false,
            vertical_collision: false,
            vertical_collision_below: false,
            fall_distance: 0.0,
            ground_friction: 0.6,
            stuck_speed_multiplier: DVec3::ZERO,
            fluid_heights: HashMap::new(),
            was_touching_water: false,
            was_in_lava: false,
            first_tick: true,
            recorder: MovementRecorder::default(),
            piston: PistonLimiter::default(),
            removal: None,
            vehicle: None,
            passengers: Vec::new(),
            leash: LeashData::default(),
            tick_count: 0,
            remaining_fire_ticks: 0,
            ticks_frozen: 0,
            walk_distance: 0.0,
            next_step_distance: 1.0,
            interpolation: None,
            locally_controlled: false,
            needs_sync: false,
            last_hurt: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn uuid(&self) -> EntityUuid {
        self.uuid
    }

    pub fn profile(&self) -> &EntityProfile {
        &self.profile
    }

    pub fn position_state(&self) -> &PositionState {
        &self.position
    }

    pub fn position(&self) -> DVec3 {
        self.position.position()
    }

    pub fn velocity(&self) -> DVec3 {
        self.position.velocity()
    }

    pub fn yaw(&self) -> f32 {
        self.position.yaw()
    }

    pub fn pitch(&self) -> f32 {
        self.position.pitch()
    }

    pub fn bounding_box(&self) -> Aabb {
        self.position.bounding_box()
    }

    pub fn dimensions(&self) -> EntityDimensions {
        self.position.dimensions()
    }

    /// Teleport-style placement; does not record a movement.
    pub fn set_position(&mut self, position: DVec3) -> bool {
        self.position.set_position(position)
    }

    pub fn set_velocity(&mut self, velocity: DVec3) -> bool {
        self.position.set_velocity(velocity)
    }

    pub fn add_velocity(&mut self, impulse: DVec3) -> bool {
        self.position.add_velocity(impulse)
    }

    pub fn set_rotation(&mut self, yaw: f32, pitch: f32) -> bool {
        self.position.set_rotation(yaw, pitch)
    }

    /// External impulse (explosions, entity shoves).
    pub fn push(&mut self, impulse: DVec3) -> bool {
        let accepted = self.position.add_velocity(impulse);
        if accepted {
            self.needs_sync = true;
        }
        accepted
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        if self.position.set_dimensions(self.profile.dimensions_for(pose)) {
            self.pose = pose;
        }
    }

    pub fn is_crouching(&self) -> bool {
        self.pose == Pose::Crouching
    }

    pub fn is_on_ground(&self) -> bool {
        self.on_ground
    }

    pub fn horizontal_collision(&self) -> bool {
        self.horizontal_collision
    }

    pub fn vertical_collision(&self) -> bool {
        self.vertical_collision
    }

    pub fn vertical_collision_below(&self) -> bool {
        self.vertical_collision_below
    }

    pub fn fall_distance(&self) -> f64 {
        self.fall_distance
    }

    pub fn reset_fall_distance(&mut self) {
        self.fall_distance = 0.0;
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    pub fn set_locally_controlled(&mut self, locally_controlled: bool) {
        self.locally_controlled = locally_controlled;
    }

    pub fn is_no_physics(&self) -> bool {
        self.profile.physics.no_physics
    }

    pub fn cause_fall_damage(&mut self, distance: f64, multiplier: f64, source: DamageSource) -> bool {
        match self.profile.damage.clone() {
            Some(hooks) => hooks.on_fall(self, distance, multiplier, source),
            None => false,
        }
    }

    pub fn hurt(&mut self, source: DamageSource) {
        self.last_hurt = Some(source);
        if let Some(hooks) = self.profile.damage.clone() {
            hooks.on_hurt(self, source);
        }
    }

    pub fn last_hurt(&self) -> Option<DamageSource> {
        self.last_hurt
    }

    /// Scales the next move (cobwebs, berry bushes). Non-finite input is ignored.
    pub fn make_stuck_in_block(&mut self, multiplier: DVec3) {
        if multiplier.is_finite() {
            self.fall_distance = 0.0;
            self.stuck_speed_multiplier = multiplier;
        }
    }

    pub fn remaining_fire_ticks(&self) -> i32 {
        self.remaining_fire_ticks
    }

    pub fn ignite_for_ticks(&mut self, ticks: i32) {
        self.remaining_fire_ticks = self.remaining_fire_ticks.max(ticks);
    }

    pub fn extinguish(&mut self) {
        self.remaining_fire_ticks = 0;
    }

    pub fn ticks_frozen(&self) -> i32 {
        self.ticks_frozen
    }

    pub fn freeze_step(&mut self) {
        self.ticks_frozen = (self.ticks_frozen + 1).min(MAX_FROZEN_TICKS);
    }

    pub fn clear_freeze(&mut self) {
        self.ticks_frozen = 0;
    }

    pub fn fluid_height(&self, kind: FluidKind) -> f64 {
        self.fluid_heights.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn is_in_water(&self) -> bool {
        self.was_touching_water
    }

    pub fn is_in_lava(&self) -> bool {
        self.was_in_lava
    }

    pub fn is_in_liquid(&self) -> bool {
        self.was_touching_water || self.was_in_lava
    }

    pub fn is_removed(&self) -> bool {
        self.removal.is_some()
    }

    pub fn removal_reason(&self) -> Option<RemovalReason> {
        self.removal
    }

    /// Alive and still attached to a world.
    pub fn can_interact_with_level(&self) -> bool {
        !self.is_removed()
    }

    /// Records the first removal reason. Returns the reason in effect and
    /// whether this call was the one that set it. Block callbacks and hooks
    /// may call this mid-tick; the simulation finishes the removal when the
    /// entity's tick ends.
    pub fn mark_removed(&mut self, reason: RemovalReason) -> (RemovalReason, bool) {
        match self.removal {
            Some(existing) => (existing, false),
            None => {
                self.removal = Some(reason);
                debug!(entity = %self.id, ?reason, "entity_marked_removed");
                (reason, true)
            }
        }
    }

    pub fn vehicle(&self) -> Option<EntityId> {
        self.vehicle
    }

    pub fn passengers(&self) -> &[EntityId] {
        &self.passengers
    }

    pub fn is_passenger(&self) -> bool {
        self.vehicle.is_some()
    }

    pub fn leash(&self) -> &LeashData {
        &self.leash
    }

    pub fn is_leashed(&self) -> bool {
        self.leash.holder().is_some()
    }

    pub fn recorded_movements(&self) -> &MovementRecorder {
        &self.recorder
    }

    /// Queues a mirrored-side interpolation toward synchronized state.
    pub fn lerp_to(&mut self, target: DVec3, yaw: f32, pitch: f32, steps: u32) {
        if !target.is_finite() || !yaw.is_finite() || !pitch.is_finite() {
            debug!(entity = %self.id, "lerp_target_rejected");
            return;
        }
        self.interpolation = Some(Interpolation {
            target,
            yaw,
            pitch,
            steps: steps.max(1),
        });
    }

    /// Would this entity, moving from `from` to `to`, have touched any of `boxes`?
    pub fn collided_with_shape_moving_from(&self, from: DVec3, to: DVec3, boxes: &[Aabb]) -> bool {
        self.position.make_box_at(from).collided_along_vector(to - from, boxes)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn allocator_never_repeats_ids() {
        let allocator = EntityIdAllocator::new(7);
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_ne!(first, second);
        assert_ne!(allocator.uuid_for(first), allocator.uuid_for(second));
        assert_eq!(allocator.uuid_for(first).0 >> 64, 7);
    }

    #[test]
    fn removal_reason_is_write_once() {
        let mut entity = test_entity(DVec3::ZERO);
        assert_eq!(
            entity.mark_removed(RemovalReason::UnloadedToChunk),
            (RemovalReason::UnloadedToChunk, true)
        );
        assert_eq!(
            entity.mark_removed(RemovalReason::Killed),
            (RemovalReason::UnloadedToChunk, false)
        );
        assert_eq!(entity.removal_reason(), Some(RemovalReason::UnloadedToChunk));
        assert!(!entity.can_interact_with_level());
    }

    #[test]
    fn pose_change_resizes_bounding_box() {
        let profile = test_profile().with_pose(Pose::Crouching, EntityDimensions::new(0.6, 1.5));
        let mut entity = entity_with(EntityId(3), profile, DVec3::ZERO);
        entity.set_pose(Pose::Crouching);
        assert!((entity.bounding_box().height() - 1.5).abs() < 1e-12);
        entity.set_pose(Pose::Standing);
        assert!((entity.bounding_box().height() - 1.8).abs() < 1e-12);
    }

    #[test]
    fn fall_damage_defers_to_hooks() {
        let hooks = Arc::new(RecordingDamage::default());
        let profile = test_profile().with_damage(hooks.clone());
        let mut entity = entity_with(EntityId(4), profile, DVec3::ZERO);
        assert!(entity.cause_fall_damage(5.0, 1.0, DamageSource::Fall));
        assert!(!test_entity(DVec3::ZERO).cause_fall_damage(5.0, 1.0, DamageSource::Fall));
        assert_eq!(*hooks.falls.lock().expect("falls"), vec![(5.0, 1.0)]);
    }

    #[test]
    fn push_rejects_non_finite_impulse() {
        let mut entity = test_entity(DVec3::ZERO);
        assert!(!entity.push(DVec3::new(f64::NAN, 0.0, 0.0)));
        assert!(!entity.needs_sync());
        assert!(entity.push(DVec3::new(0.1, 0.0, 0.0)));
        assert!(entity.needs_sync());
    }
}
