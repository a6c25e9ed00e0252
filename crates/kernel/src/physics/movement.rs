use glam::DVec3;
use tracing::warn;

use crate::collision::CollisionResolver;
use crate::config::MovementConfig;
use crate::entity::{Entity, MoverKind};
use crate::events::{EventSink, GameEventKind, KernelEvent};
use crate::math::{block_containing, horizontal_length_squared, BlockPos};
use crate::physics::traversal::walk_segment;
use crate::recorder::Movement;
use crate::world::{BlockGetter, CollisionGetter, FluidKind};

const MOVE_EPSILON: f64 = 1.0e-7;
const AXIS_EQUAL_EPSILON: f64 = 1.0e-5;
const AIR_FRICTION: f64 = 0.91;
const WATER_DRAG: f64 = 0.8;
const LAVA_DRAG: f64 = 0.5;

pub struct MoveContext<'a> {
    pub game_time: u64,
    pub config: &'a MovementConfig,
    pub events: &'a mut dyn EventSink,
}

impl Entity {
    /// Moves by `delta`, clipped against the level. Returns the displacement
    /// actually applied.
    pub fn move_entity<C: CollisionGetter + ?Sized>(
        &mut self,
        mover: MoverKind,
        delta: DVec3,
        level: &C,
        ctx: &mut MoveContext<'_>,
    ) -> DVec3 {
        if self.is_removed() {
            return DVec3::ZERO;
        }
        if !delta.is_finite() {
            warn!(entity = %self.id, ?mover, "rejected_non_finite_move");
            return DVec3::ZERO;
        }
        if self.is_no_physics() {
            let target = self.position() + delta;
            return if self.position.set_position(target) {
                delta
            } else {
                DVec3::ZERO
            };
        }

        let mut movement = delta;
        if mover == MoverKind::Piston {
            movement = self.piston.limit(movement, ctx.game_time, ctx.config.piston_limit);
            if movement == DVec3::ZERO {
                return DVec3::ZERO;
            }
        }
        if self.stuck_speed_multiplier.length_squared() > MOVE_EPSILON {
            if mover != MoverKind::Piston {
                movement *= self.stuck_speed_multiplier;
            }
            self.stuck_speed_multiplier = DVec3::ZERO;
            self.position.set_velocity(DVec3::ZERO);
        }

        let resolved = CollisionResolver::new(level).resolve(self, movement);
        let travelled = resolved.length_squared();
        if travelled > MOVE_EPSILON || movement.length_squared() - travelled < MOVE_EPSILON {
            let from = self.position();
            let to = from + resolved;
            if self.fall_distance != 0.0 && travelled >= 1.0 && crosses_water(level, from, to) {
                self.reset_fall_distance();
            }
            if self.position.set_position(to) {
                self.recorder.record(Movement {
                    from,
                    to,
                    axis_dependent_original: Some(movement),
                });
            }
        }

        let x_clipped = (movement.x - resolved.x).abs() >= AXIS_EQUAL_EPSILON;
        let z_clipped = (movement.z - resolved.z).abs() >= AXIS_EQUAL_EPSILON;
        self.horizontal_collision = x_clipped || z_clipped;
        self.vertical_collision = movement.y != resolved.y;
        self.vertical_collision_below = self.vertical_collision && movement.y < 0.0;
        self.on_ground = self.vertical_collision_below;

        let on_pos = self.on_pos();
        let on_state = level.block_state(on_pos);
        let on_def = level.block_def(on_state);
        self.check_fall_damage(resolved.y, on_pos, level, ctx);
        if self.is_removed() {
            return resolved;
        }

        if self.horizontal_collision {
            let velocity = self.velocity();
            self.position.set_velocity(DVec3::new(
                if x_clipped { 0.0 } else { velocity.x },
                velocity.y,
                if z_clipped { 0.0 } else { velocity.z },
            ));
        }
        let behavior = on_def.behavior.clone();
        if self.vertical_collision {
            behavior.update_entity_movement_after_fall_on(self);
        }
        if self.on_ground {
            behavior.on_step_on(on_pos, on_state, self);
            self.ground_friction = level
                .block_def(level.block_state(self.friction_pos()))
                .friction;
            if mover != MoverKind::Piston && !self.is_crouching() {
                self.emit_step_events(resolved, ctx);
            }
        }

        let speed = self.block_speed_factor(level);
        let velocity = self.velocity();
        self.position
            .set_velocity(DVec3::new(velocity.x * speed, velocity.y, velocity.z * speed));
        resolved
    }

    /// One tick of self-driven motion: move by the current velocity, then
    /// apply gravity and the medium's drag for the next tick.
    pub fn travel<C: CollisionGetter + ?Sized>(&mut self, level: &C, ctx: &mut MoveContext<'_>) {
        if self.is_no_physics() || self.is_removed() {
            return;
        }
        let gravity = self.profile.physics.gravity;
        let velocity = self.velocity();
        self.move_entity(MoverKind::SelfDriven, velocity, level, ctx);

        let velocity = self.velocity();
        let next = if self.is_in_water() {
            velocity * WATER_DRAG - DVec3::new(0.0, gravity / 16.0, 0.0)
        } else if self.is_in_lava() {
            velocity * LAVA_DRAG - DVec3::new(0.0, gravity / 4.0, 0.0)
        } else {
            let friction = if self.on_ground {
                self.ground_friction * AIR_FRICTION
            } else {
                AIR_FRICTION
            };
            DVec3::new(
                velocity.x * friction,
                (velocity.y - gravity) * self.profile.physics.vertical_drag,
                velocity.z * friction,
            )
        };
        self.position.set_velocity(next);
    }

    fn check_fall_damage<C: CollisionGetter + ?Sized>(
        &mut self,
        dy: f64,
        on_pos: BlockPos,
        level: &C,
        ctx: &mut MoveContext<'_>,
    ) {
        if self.on_ground {
            let fall_distance = self.fall_distance;
            if fall_distance > 0.0 {
                let state = level.block_state(on_pos);
                let behavior = level.block_def(state).behavior.clone();
                behavior.on_fall_on(on_pos, state, self, fall_distance);
                ctx.events.emit(KernelEvent::GameEvent {
                    kind: GameEventKind::HitGround,
                    entity: self.id,
                    position: self.position(),
                });
            }
            self.reset_fall_distance();
        } else if dy < 0.0 {
            self.fall_distance -= dy;
        }
    }

    fn emit_step_events(&mut self, resolved: DVec3, ctx: &mut MoveContext<'_>) {
        self.walk_distance += horizontal_length_squared(resolved).sqrt() * 0.6;
        if self.walk_distance > self.next_step_distance {
            self.next_step_distance = self.walk_distance + 1.0;
            ctx.events.emit(KernelEvent::GameEvent {
                kind: GameEventKind::Step,
                entity: self.id,
                position: self.position(),
            });
        }
    }

    /// Block the entity stands on.
    pub fn on_pos(&self) -> BlockPos {
        block_containing(self.position() - DVec3::new(0.0, 0.2, 0.0))
    }

    fn friction_pos(&self) -> BlockPos {
        block_containing(self.position() - DVec3::new(0.0, 0.500_000_1, 0.0))
    }

    fn block_speed_factor<B: BlockGetter + ?Sized>(&self, level: &B) -> f64 {
        let feet = level.block_state(block_containing(self.position()));
        let factor = level.block_def(feet).speed_factor;
        if factor != 1.0 || level.fluid_state(block_containing(self.position())).is(FluidKind::Water) {
            return factor;
        }
        level
            .block_def(level.block_state(self.friction_pos()))
            .speed_factor
    }
}

fn crosses_water<B: BlockGetter + ?Sized>(level: &B, from: DVec3, to: DVec3) -> bool {
    let mut found = false;
    walk_segment(from, to, |pos| {
        let fluid = level.fluid_state(pos);
        if fluid.is(FluidKind::Water) && fluid.aabb(level, pos).clip(from, to).is_some() {
            found = true;
            return false;
        }
        true
    });
    found
}
