//! Tethers between a leashed entity and its holder.

use std::fmt;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LeashConfig, WorldRules};
use crate::entity::{Entity, EntityId, EntityUuid};
use crate::events::{DroppedItem, EventSink, KernelEvent, SoundKind};
use crate::math::BlockPos;

const AIR_ANGULAR_FRICTION: f64 = 0.91;
const LIQUID_ANGULAR_FRICTION: f64 = 0.8;
const SAFE_PULL_FALL_DISTANCE: f64 = 1.0;

/// Attachment points in units of the owner's (width, height, width), before
/// rotation by the owner's yaw.
const LEASHEE_POINT: [DVec3; 1] = [DVec3::new(0.0, 0.5, 0.5)];
const HOLDER_POINT: [DVec3; 1] = [DVec3::new(0.0, 0.5, 0.0)];
const QUAD_POINTS: [DVec3; 4] = [
    DVec3::new(-0.5, 0.5, 0.5),
    DVec3::new(-0.5, 0.5, -0.5),
    DVec3::new(0.5, 0.5, -0.5),
    DVec3::new(0.5, 0.5, 0.5),
];

/// Who a not-yet-resolved leash should attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingHolder {
    Uuid(EntityUuid),
    NetworkId(EntityId),
    Anchor(BlockPos),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum LeashState {
    #[default]
    Unattached,
    Pending {
        holder: PendingHolder,
        since_tick: u64,
    },
    Attached {
        holder: EntityId,
    },
}

/// Per-entity leash state. The holder is stored by id and looked up each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LeashData {
    pub(crate) state: LeashState,
    pub(crate) angular_momentum: f64,
    /// How the holder was known when the leash was tied; outlives the holder.
    pub(crate) last_attachment: Option<LeashAttachment>,
}

impl LeashData {
    pub fn state(&self) -> LeashState {
        self.state
    }

    pub fn holder(&self) -> Option<EntityId> {
        match self.state {
            LeashState::Attached { holder } => Some(holder),
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<PendingHolder> {
        match self.state {
            LeashState::Pending { holder, .. } => Some(holder),
            _ => None,
        }
    }

    pub fn angular_momentum(&self) -> f64 {
        self.angular_momentum
    }

    pub fn last_attachment(&self) -> Option<LeashAttachment> {
        self.last_attachment
    }

    pub(crate) fn attach(&mut self, holder: EntityId) {
        self.state = LeashState::Attached { holder };
    }

    pub(crate) fn remember(&mut self, attachment: Option<LeashAttachment>) {
        if attachment.is_some() {
            self.last_attachment = attachment;
        }
    }

    pub(crate) fn set_pending(&mut self, holder: PendingHolder, since_tick: u64) {
        self.state = LeashState::Pending { holder, since_tick };
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Persisted form of a leash: a holder identity or a fixed block anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeashAttachment {
    Holder { uuid: EntityUuid },
    Anchor { pos: [i32; 3] },
}

impl LeashAttachment {
    pub fn anchor(pos: BlockPos) -> Self {
        Self::Anchor {
            pos: pos.to_array(),
        }
    }

    pub(crate) fn into_pending(self) -> PendingHolder {
        match self {
            Self::Holder { uuid } => PendingHolder::Uuid(uuid),
            Self::Anchor { pos } => PendingHolder::Anchor(BlockPos::from_array(pos)),
        }
    }
}

/// What to do when the tether overstretches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeashRelease {
    Drop,
    Keep,
}

/// Per-kind reactions to leash events.
pub trait LeashHooks: fmt::Debug + Send + Sync {
    fn when_leashed_to(&self, _entity: &mut Entity, _holder: &Entity) {}

    fn leash_too_far(&self, _entity: &mut Entity) -> LeashRelease {
        LeashRelease::Drop
    }

    fn on_elastic_pull(&self, entity: &mut Entity) {
        entity.check_fall_distance_accumulation();
    }

    fn close_range(&self, _entity: &mut Entity, _holder: &Entity) {}
}

#[derive(Debug, Default)]
pub struct DefaultLeashHooks;

impl LeashHooks for DefaultLeashHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeashOutcome {
    /// One of the parties left the level; the leash was released.
    Released,
    Snapped,
    Elastic,
    CloseRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Wrench {
    force: DVec3,
    torque: f64,
}

impl Entity {
    /// A taut leash caps the fall distance that has built up so far.
    pub fn check_fall_distance_accumulation(&mut self) {
        if self.velocity().y > -0.5 && self.fall_distance > SAFE_PULL_FALL_DISTANCE {
            self.fall_distance = SAFE_PULL_FALL_DISTANCE;
        }
    }

    /// Distance between bounding-box centres.
    pub fn leash_distance_to(&self, holder: &Entity) -> f64 {
        self.bounding_box()
            .center()
            .distance(holder.bounding_box().center())
    }

    fn supports_quad_leash(&self) -> bool {
        self.profile.leash.as_ref().is_some_and(|leash| leash.quad)
    }
}

/// Spring-damper constraint between a leashed entity and its holder.
#[derive(Debug, Clone, Copy)]
pub struct LeashConstraintSolver<'a> {
    config: &'a LeashConfig,
    rules: &'a WorldRules,
}

impl<'a> LeashConstraintSolver<'a> {
    pub fn new(config: &'a LeashConfig, rules: &'a WorldRules) -> Self {
        Self { config, rules }
    }

    pub fn snap_distance(&self, entity: &Entity) -> f64 {
        entity
            .profile
            .leash
            .as_ref()
            .and_then(|leash| leash.snap_distance)
            .unwrap_or(self.config.snap_distance)
    }

    pub fn elastic_distance(&self, entity: &Entity) -> f64 {
        entity
            .profile
            .leash
            .as_ref()
            .and_then(|leash| leash.elastic_distance)
            .unwrap_or(self.config.elastic_distance)
    }

    /// Runs one tick of the constraint for an attached pair.
    pub fn solve(
        &self,
        entity: &mut Entity,
        holder: &mut Entity,
        events: &mut dyn EventSink,
    ) -> LeashOutcome {
        if !entity.can_interact_with_level() || !holder.can_interact_with_level() {
            self.release(entity, self.rules.entity_drops, events);
            return LeashOutcome::Released;
        }
        let hooks = entity.profile.leash.as_ref().map(|leash| leash.hooks.clone());
        if let Some(hooks) = &hooks {
            hooks.when_leashed_to(entity, holder);
        }

        let distance = entity.leash_distance_to(holder);
        let slack = self.elastic_distance(entity)
            - (holder.dimensions().width + entity.dimensions().width) * 0.5;
        let mut release = LeashRelease::Keep;
        let outcome = if distance > self.snap_distance(entity) {
            events.emit(KernelEvent::Sound {
                sound: SoundKind::LeashBreak,
                position: holder.position(),
            });
            release = match &hooks {
                Some(hooks) => hooks.leash_too_far(entity),
                None => LeashRelease::Drop,
            };
            LeashOutcome::Snapped
        } else if distance > slack && self.apply_elastic(entity, holder) {
            if let Some(hooks) = &hooks {
                hooks.on_elastic_pull(entity);
            }
            LeashOutcome::Elastic
        } else {
            if let Some(hooks) = &hooks {
                hooks.close_range(entity, holder);
            }
            LeashOutcome::CloseRange
        };

        // The turn lands even on the tick the leash snaps.
        let yaw = entity.yaw() - entity.leash.angular_momentum as f32;
        entity.position.set_yaw(yaw);
        entity.leash.angular_momentum *= angular_friction(entity);

        if release == LeashRelease::Drop {
            info!(entity = %entity.id, holder = %holder.id, distance, "leash_snapped");
            self.release(entity, self.rules.entity_drops, events);
        }
        outcome
    }

    /// Abandons a pending attachment whose holder never showed up. Returns
    /// true if the leash was dropped.
    pub fn expire_pending(&self, entity: &mut Entity, events: &mut dyn EventSink) -> bool {
        let LeashState::Pending { holder, since_tick } = entity.leash.state else {
            return false;
        };
        if entity.tick_count.saturating_sub(since_tick) <= u64::from(self.config.restore_grace_ticks) {
            return false;
        }
        warn!(entity = %entity.id, ?holder, "leash_holder_unresolved");
        self.release(entity, true, events);
        true
    }

    /// Clears the leash, dropping a lead at the entity when `drop_item`.
    pub fn release(&self, entity: &mut Entity, drop_item: bool, events: &mut dyn EventSink) {
        entity.leash.clear();
        entity.needs_sync = true;
        if drop_item {
            events.emit(KernelEvent::ItemDropped {
                item: DroppedItem::Lead,
                position: entity.position(),
            });
        }
        debug!(entity = %entity.id, drop_item, "leash_released");
    }

    fn apply_elastic(&self, entity: &mut Entity, holder: &mut Entity) -> bool {
        let quad = holder.profile.quad_leash_holder && entity.supports_quad_leash();
        let (entity_points, holder_points): (&[DVec3], &[DVec3]) = if quad {
            (&QUAD_POINTS, &QUAD_POINTS)
        } else {
            (&LEASHEE_POINT, &HOLDER_POINT)
        };

        let slack = self.elastic_distance(entity);
        let entity_motion = own_motion(entity);
        let mut total = None::<Wrench>;
        for (entity_point, holder_point) in entity_points.iter().zip(holder_points) {
            let lever = attachment_offset(entity, *entity_point);
            let entity_anchor = entity.position() + lever;
            let holder_anchor = holder.position() + attachment_offset(holder, *holder_point);
            if let Some(wrench) = self.wrench(holder_anchor, entity_anchor, slack, entity_motion, lever) {
                let sum = total.get_or_insert_with(Wrench::default);
                sum.force += wrench.force;
                sum.torque += wrench.torque;
            }
        }
        let Some(total) = total else {
            return false;
        };

        let scale = if quad {
            self.config.quad_point_scale
        } else {
            self.config.single_point_scale
        };
        let force = total.force * scale;
        entity.leash.angular_momentum += self.config.torsional_elasticity * total.torque * scale;

        let relative = own_motion(holder) - entity_motion;
        entity.add_velocity(force * self.config.axis_elasticity() + relative * self.config.stiffness);
        if !holder.is_no_physics() && self.config.holder_reaction > 0.0 {
            holder.add_velocity(-force * self.config.axis_elasticity() * self.config.holder_reaction);
        }
        true
    }

    fn wrench(
        &self,
        holder_anchor: DVec3,
        entity_anchor: DVec3,
        slack: f64,
        entity_motion: DVec3,
        lever: DVec3,
    ) -> Option<Wrench> {
        let separation = entity_anchor.distance(holder_anchor);
        if separation < slack {
            return None;
        }
        let mut force = (holder_anchor - entity_anchor).normalize_or_zero() * (separation - slack);
        let torque = lever.z * force.x - lever.x * force.z;
        if entity_motion.dot(force) >= 0.0 {
            force *= self.config.damping;
        }
        Some(Wrench { force, torque })
    }
}

fn own_motion(entity: &Entity) -> DVec3 {
    if entity.is_no_physics() {
        DVec3::ZERO
    } else {
        entity.velocity()
    }
}

/// `point` scaled by the entity's size and turned by its yaw.
fn attachment_offset(entity: &Entity, point: DVec3) -> DVec3 {
    let dimensions = entity.dimensions();
    let scaled = point * DVec3::new(dimensions.width, dimensions.height, dimensions.width);
    rotate_y(scaled, -f64::from(entity.yaw()).to_radians())
}

fn rotate_y(v: DVec3, angle: f64) -> DVec3 {
    let (sin, cos) = angle.sin_cos();
    DVec3::new(v.x * cos + v.z * sin, v.y, v.z * cos - v.x * sin)
}

fn angular_friction(entity: &Entity) -> f64 {
    if entity.on_ground {
        entity.ground_friction * AIR_ANGULAR_FRICTION
    } else if entity.is_in_liquid() {
        LIQUID_ANGULAR_FRICTION
    } else {
        AIR_ANGULAR_FRICTION
    }
}
