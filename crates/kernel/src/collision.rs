use glam::DVec3;
use tracing::trace;

use crate::entity::{Entity, EntityId};
use crate::math::{axis_step_order, horizontal_length_squared, Aabb, Axis};
use crate::shape::{Shape, COLLISION_EPSILON};
use crate::world::CollisionGetter;

const STEP_EPSILON: f64 = 1.0e-5;
const PISTON_DEADZONE: f64 = 1.0e-5;

/// Clips desired motion against static and dynamic geometry.
pub struct CollisionResolver<'a, C: CollisionGetter + ?Sized> {
    level: &'a C,
}

impl<'a, C: CollisionGetter + ?Sized> CollisionResolver<'a, C> {
    pub fn new(level: &'a C) -> Self {
        Self { level }
    }

    pub fn resolve(&self, entity: &Entity, movement: DVec3) -> DVec3 {
        self.resolve_box(
            entity.bounding_box(),
            movement,
            Some(entity.id()),
            entity.is_on_ground(),
            entity.profile().physics.step_height,
        )
    }

    /// Largest motion not exceeding `movement` that keeps `bbox` out of every
    /// collider, stepping up onto low obstacles when allowed.
    pub fn resolve_box(
        &self,
        bbox: Aabb,
        movement: DVec3,
        excluding: Option<EntityId>,
        on_ground: bool,
        step_height: f64,
    ) -> DVec3 {
        if movement.length_squared() == 0.0 {
            return movement;
        }

        let swept = bbox.expand_towards(movement);
        let entity_colliders = self.level.entity_collisions(&swept, excluding);
        let origin = bbox.center();
        let shapes = self.collect_colliders(&entity_colliders, &swept, origin, excluding);
        let resolved = collide_with_shapes(movement, &bbox, &shapes);

        let x_clipped = movement.x != resolved.x;
        let y_clipped = movement.y != resolved.y;
        let z_clipped = movement.z != resolved.z;
        let grounded_after = y_clipped && movement.y < 0.0;

        if step_height <= 0.0 || !(grounded_after || on_ground) || !(x_clipped || z_clipped) {
            return resolved;
        }

        let base = if grounded_after {
            bbox.translate(DVec3::new(0.0, resolved.y, 0.0))
        } else {
            bbox
        };
        let mut step_box = base.expand_towards(DVec3::new(movement.x, step_height, movement.z));
        if !grounded_after {
            step_box = step_box.expand_towards(DVec3::new(0.0, -STEP_EPSILON, 0.0));
        }
        let step_shapes = self.collect_colliders(&entity_colliders, &step_box, origin, excluding);

        for candidate in candidate_step_heights(&base, &step_shapes, step_height, resolved.y) {
            let stepped = collide_with_shapes(
                DVec3::new(movement.x, candidate, movement.z),
                &base,
                &step_shapes,
            );
            if horizontal_length_squared(stepped) > horizontal_length_squared(resolved) {
                trace!(candidate, "step_up_accepted");
                return stepped + DVec3::new(0.0, base.min.y - bbox.min.y, 0.0);
            }
        }
        resolved
    }

    fn collect_colliders(
        &self,
        entity_colliders: &[Shape],
        query: &Aabb,
        origin: DVec3,
        excluding: Option<EntityId>,
    ) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = entity_colliders.to_vec();
        if let Some(border) = self.level.world_border() {
            if border.is_inside_close_to_border(origin, query) {
                shapes.push(border.collision_shape());
            }
        }
        shapes.extend(self.level.block_collisions(query, excluding));
        shapes
    }
}

/// Resolves `movement` one axis at a time (vertical, then the dominant
/// horizontal axis), each axis starting from the box already moved along the
/// previous ones.
pub fn collide_with_shapes(movement: DVec3, bbox: &Aabb, shapes: &[Shape]) -> DVec3 {
    if shapes.is_empty() {
        return movement;
    }
    let mut resolved = DVec3::ZERO;
    for axis in axis_step_order(movement) {
        let desired = axis.component(movement);
        if desired == 0.0 {
            continue;
        }
        let moved = bbox.translate(resolved);
        let allowed = collide_axis(axis, &moved, shapes, desired);
        resolved = axis.with(resolved, allowed);
    }
    resolved
}

fn collide_axis(axis: Axis, moving: &Aabb, shapes: &[Shape], desired: f64) -> f64 {
    let mut allowed = desired;
    for shape in shapes {
        if allowed.abs() < COLLISION_EPSILON {
            return 0.0;
        }
        allowed = shape.collide(axis, moving, allowed);
    }
    allowed
}

/// Distinct heights, relative to `base`, of collider faces an entity could
/// step onto, ascending.
pub fn candidate_step_heights(base: &Aabb, shapes: &[Shape], max_step: f64, skip: f64) -> Vec<f64> {
    let mut heights: Vec<f64> = shapes
        .iter()
        .flat_map(|shape| shape.coords(Axis::Y))
        .map(|y| y - base.min.y)
        .filter(|height| *height >= 0.0 && *height <= max_step)
        .filter(|height| (*height - skip).abs() >= STEP_EPSILON)
        .collect();
    heights.sort_by(f64::total_cmp);
    heights.dedup_by(|a, b| (*a - *b).abs() < STEP_EPSILON);
    heights
}

/// Caps how far pistons may shove an entity along each axis per game tick.
#[derive(Debug, Clone, Default)]
pub struct PistonLimiter {
    deltas: [f64; 3],
    game_time: Option<u64>,
}

impl PistonLimiter {
    /// Only the first non-zero axis of `movement` is kept.
    pub fn limit(&mut self, movement: DVec3, game_time: u64, max_per_tick: f64) -> DVec3 {
        if movement.length_squared() <= COLLISION_EPSILON {
            return movement;
        }
        if self.game_time != Some(game_time) {
            self.deltas = [0.0; 3];
            self.game_time = Some(game_time);
        }
        for axis in Axis::ALL {
            let desired = axis.component(movement);
            if desired == 0.0 {
                continue;
            }
            let slot = &mut self.deltas[axis.index()];
            let accumulated = (*slot + desired).clamp(-max_per_tick, max_per_tick);
            let allowed = accumulated - *slot;
            *slot = accumulated;
            return if allowed.abs() <= PISTON_DEADZONE {
                DVec3::ZERO
            } else {
                axis.unit() * allowed
            };
        }
        DVec3::ZERO
    }
}
