use std::collections::HashSet;

use glam::{DVec3, IVec3};
use thiserror::Error;
use tracing::trace;

use crate::config::TraversalConfig;
use crate::entity::{Entity, EntityId};
use crate::math::{axis_step_order, block_containing, block_origin, cells_between, Aabb, Axis, BlockPos};
use crate::physics::effects::EffectCollector;
use crate::recorder::Movement;
use crate::shape::Shape;
use crate::world::{BlockCallbackError, BlockGetter};

const SHORT_SEGMENT: f64 = 0.99999;
const DESTINATION_DEFLATE: f64 = 1.0e-5;
const CELL_MARGIN: f64 = 1.0e-5;

/// A block or fluid callback failed; the world is no longer consistent.
#[derive(Debug, Error)]
#[error("effect of '{block}' at {block_pos} failed on entity {entity} at {entity_position}")]
pub struct BlockEffectFailure {
    pub entity: EntityId,
    pub entity_position: DVec3,
    pub block: String,
    pub block_pos: BlockPos,
    #[source]
    pub source: BlockCallbackError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalReport {
    pub visited_cells: usize,
    pub contacts: usize,
    pub air_cells: usize,
    pub exhausted_movements: usize,
}

/// Replays one tick's movements through the voxel grid and fires the
/// "entity inside" callbacks, at most once per block per tick.
#[derive(Debug)]
pub struct BlockTraversalEngine {
    visited: HashSet<BlockPos>,
    max_steps: usize,
    report_air: bool,
}

impl Default for BlockTraversalEngine {
    fn default() -> Self {
        Self::new(&TraversalConfig::default())
    }
}

impl BlockTraversalEngine {
    pub fn new(config: &TraversalConfig) -> Self {
        Self {
            visited: HashSet::new(),
            max_steps: config.max_steps.max(1),
            report_air: config.report_air,
        }
    }

    pub fn apply_movements<B: BlockGetter + ?Sized>(
        &mut self,
        entity: &mut Entity,
        movements: &[Movement],
        level: &B,
        effects: &mut EffectCollector,
    ) -> Result<TraversalReport, BlockEffectFailure> {
        self.visited.clear();
        let mut report = TraversalReport::default();
        let result = self.replay(entity, movements, level, effects, &mut report);
        self.visited.clear();
        result.map(|()| report)
    }

    fn replay<B: BlockGetter + ?Sized>(
        &mut self,
        entity: &mut Entity,
        movements: &[Movement],
        level: &B,
        effects: &mut EffectCollector,
        report: &mut TraversalReport,
    ) -> Result<(), BlockEffectFailure> {
        for movement in movements {
            if entity.is_removed() {
                break;
            }
            let mut remaining = self.max_steps;
            let delta = movement.delta();
            match movement.axis_dependent_original {
                Some(original) if delta.length_squared() > 0.0 => {
                    let mut from = movement.from;
                    for axis in axis_step_order(original) {
                        let distance = axis.component(delta);
                        if distance == 0.0 {
                            continue;
                        }
                        let to = from + axis.unit() * distance;
                        let used = self.check_segment(entity, from, to, remaining, level, effects, report)?;
                        remaining = remaining.saturating_sub(used);
                        from = to;
                    }
                }
                _ => {
                    let used = self.check_segment(
                        entity,
                        movement.from,
                        movement.to,
                        remaining,
                        level,
                        effects,
                        report,
                    )?;
                    remaining = remaining.saturating_sub(used);
                }
            }
            if remaining == 0 {
                report.exhausted_movements += 1;
                self.check_segment(entity, movement.to, movement.to, 1, level, effects, report)?;
            }
        }
        Ok(())
    }

    /// Returns how many steps of the budget the segment consumed.
    #[allow(clippy::too_many_arguments)]
    fn check_segment<B: BlockGetter + ?Sized>(
        &mut self,
        entity: &mut Entity,
        from: DVec3,
        to: DVec3,
        max_steps: usize,
        level: &B,
        effects: &mut EffectCollector,
        report: &mut TraversalReport,
    ) -> Result<usize, BlockEffectFailure> {
        if max_steps == 0 {
            return Ok(0);
        }
        let destination = entity
            .position_state()
            .make_box_at(to)
            .deflate(DESTINATION_DEFLATE);
        let visited = &mut self.visited;
        let report_air = self.report_air;
        let mut last_index = 0;
        let mut failure = None;

        for_each_block_intersected_between(from, to, &destination, |pos, index| {
            if entity.is_removed() || index >= max_steps {
                return false;
            }
            last_index = index;
            let state = level.block_state(pos);
            let fluid = level.fluid_state(pos);
            if state.is_air() && fluid.is_empty() {
                if report_air {
                    report.air_cells += 1;
                    trace!(?pos, index, "traversal_air_cell");
                }
                return true;
            }
            if !visited.insert(pos) {
                return true;
            }
            report.visited_cells += 1;

            let def = level.block_def(state);
            let block_contact = block_contact(entity, &def.inside_shape, pos, &destination, from, to);
            let fluid_contact = fluid.kind().filter(|_| {
                entity.collided_with_shape_moving_from(from, to, &[fluid.aabb(level, pos)])
            });
            if block_contact.is_none() && fluid_contact.is_none() {
                return true;
            }

            effects.advance_step(index);
            report.contacts += 1;
            let entity_position = entity.position();
            if let Some(precise) = block_contact {
                if let Err(source) = def
                    .behavior
                    .on_entity_entered_block(pos, state, entity, effects, precise)
                {
                    failure = Some(BlockEffectFailure {
                        entity: entity.id(),
                        entity_position,
                        block: def.name.clone(),
                        block_pos: pos,
                        source,
                    });
                    return false;
                }
            }
            if let Some(kind) = fluid_contact {
                if let Err(source) = level
                    .registry()
                    .fluid_behavior(kind)
                    .on_entity_entered_fluid(pos, fluid, entity, effects)
                {
                    failure = Some(BlockEffectFailure {
                        entity: entity.id(),
                        entity_position,
                        block: format!("{kind:?}").to_lowercase(),
                        block_pos: pos,
                        source,
                    });
                    return false;
                }
            }
            true
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(last_index + 1),
        }
    }
}

/// `Some(precise)` when the entity touches the block's inside shape.
/// Full cubes and destination overlaps are precise; a contact found only by
/// sweeping the box along the segment is not.
fn block_contact(
    entity: &Entity,
    inside_shape: &Shape,
    pos: BlockPos,
    destination: &Aabb,
    from: DVec3,
    to: DVec3,
) -> Option<bool> {
    if inside_shape.is_empty() {
        return None;
    }
    if inside_shape.is_full_block() {
        return Some(true);
    }
    let placed = inside_shape.translate(block_origin(pos));
    if placed.intersects(destination) {
        Some(true)
    } else if entity.collided_with_shape_moving_from(from, to, placed.boxes()) {
        Some(false)
    } else {
        None
    }
}

/// Incremental voxel walk along a segment, one cell boundary per step.
struct VoxelWalk {
    cell: IVec3,
    step: IVec3,
    t_max: DVec3,
    t_delta: DVec3,
}

impl VoxelWalk {
    fn new(from: DVec3, delta: DVec3) -> Self {
        let mut step = IVec3::ZERO;
        let mut t_max = DVec3::splat(f64::MAX);
        let mut t_delta = DVec3::splat(f64::MAX);
        for axis in Axis::ALL {
            let d = axis.component(delta);
            if d == 0.0 {
                continue;
            }
            let sign = if d > 0.0 { 1 } else { -1 };
            let origin = axis.component(from);
            let fraction = origin - origin.floor();
            let per_cell = 1.0 / d.abs();
            step[axis.index()] = sign;
            t_delta = axis.with(t_delta, per_cell);
            t_max = axis.with(
                t_max,
                per_cell * if sign > 0 { 1.0 - fraction } else { fraction },
            );
        }
        Self {
            cell: block_containing(from),
            step,
            t_max,
            t_delta,
        }
    }

    fn within_segment(&self) -> bool {
        self.t_max.min_element() <= 1.0
    }

    fn advance(&mut self) {
        let axis = if self.t_max.x < self.t_max.y {
            if self.t_max.x < self.t_max.z {
                0
            } else {
                2
            }
        } else if self.t_max.y < self.t_max.z {
            1
        } else {
            2
        };
        self.cell[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];
    }
}

/// Visits every cell a point moving from `from` to `to` passes through,
/// starting cell included, until `visit` returns false.
pub fn walk_segment(from: DVec3, to: DVec3, mut visit: impl FnMut(BlockPos) -> bool) {
    let mut walk = VoxelWalk::new(from, to - from);
    if !visit(walk.cell) {
        return;
    }
    while walk.within_segment() {
        walk.advance();
        if !visit(walk.cell) {
            return;
        }
    }
}

/// Visits the cells touched by `aabb` (the box at `to`) while it travels from
/// `from` to `to`, tagging each with an increasing step index. Short
/// segments only visit the destination box, all at index 0. Returns false if
/// the visitor stopped the walk.
pub fn for_each_block_intersected_between(
    from: DVec3,
    to: DVec3,
    aabb: &Aabb,
    mut visit: impl FnMut(BlockPos, usize) -> bool,
) -> bool {
    let delta = to - from;
    let (box_min, box_max) = aabb.block_range();
    if delta.length_squared() < SHORT_SEGMENT * SHORT_SEGMENT {
        return cells_between(box_min, box_max).all(|pos| visit(pos, 0));
    }

    let mut seen = HashSet::new();
    let Some(index) = visit_along_travel(&mut seen, aabb.min - delta, aabb.min, aabb, &mut visit) else {
        return false;
    };
    cells_between(box_min, box_max)
        .filter(|pos| !seen.contains(pos))
        .all(|pos| visit(pos, index + 1))
}

fn visit_along_travel(
    seen: &mut HashSet<BlockPos>,
    from: DVec3,
    to: DVec3,
    aabb: &Aabb,
    visit: &mut impl FnMut(BlockPos, usize) -> bool,
) -> Option<usize> {
    let delta = to - from;
    let size = aabb.size();
    let mut walk = VoxelWalk::new(from, delta);
    let max_iterations = (delta.abs().element_sum().ceil() as usize).saturating_add(3);
    let mut index = 0;

    for _ in 0..max_iterations {
        if !walk.within_segment() {
            break;
        }
        walk.advance();
        let cell = walk.cell;
        let Some(hit) = Aabb::of_block(cell).clip(from, to) else {
            continue;
        };
        index += 1;
        let origin = block_origin(cell);
        let corner = hit.clamp(origin + CELL_MARGIN, origin + (1.0 - CELL_MARGIN));
        let far = block_containing(corner + size);
        for pos in cells_between(cell, far) {
            if seen.insert(pos) && !visit(pos, index) {
                return None;
            }
        }
    }
    Some(index)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::entity::testing::test_entity;
    use crate::entity::RemovalReason;
    use crate::world::behaviors::WaterFluid;
    use crate::world::{
        BlockBehavior, BlockDef, BlockRegistry, BlockState, FluidKind, FluidState, GridLevel,
    };

    #[derive(Debug, Default)]
    struct Recorder {
        contacts: Mutex<Vec<(BlockPos, bool)>>,
    }

    impl Recorder {
        fn contacts(&self) -> Vec<(BlockPos, bool)> {
            self.contacts.lock().expect("contacts").clone()
        }
    }

    impl BlockBehavior for Recorder {
        fn on_entity_entered_block(
            &self,
            pos: BlockPos,
            _state: BlockState,
            _entity: &mut Entity,
            _effects: &mut EffectCollector,
            precise_contact: bool,
        ) -> Result<(), BlockCallbackError> {
            self.contacts
                .lock()
                .expect("contacts")
                .push((pos, precise_contact));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Exploding;

    impl BlockBehavior for Exploding {
        fn on_entity_entered_block(
            &self,
            _pos: BlockPos,
            _state: BlockState,
            _entity: &mut Entity,
            _effects: &mut EffectCollector,
            _precise_contact: bool,
        ) -> Result<(), BlockCallbackError> {
            Err(BlockCallbackError::new("block entity missing"))
        }
    }

    #[derive(Debug)]
    struct Discarding;

    impl BlockBehavior for Discarding {
        fn on_entity_entered_block(
            &self,
            _pos: BlockPos,
            _state: BlockState,
            entity: &mut Entity,
            _effects: &mut EffectCollector,
            _precise_contact: bool,
        ) -> Result<(), BlockCallbackError> {
            entity.mark_removed(RemovalReason::Discarded);
            Ok(())
        }
    }

    struct Fixture {
        level: GridLevel,
        recorder: Arc<Recorder>,
        sensor: BlockState,
        core: BlockState,
    }

    fn fixture() -> Fixture {
        let recorder = Arc::new(Recorder::default());
        let mut registry = BlockRegistry::default();
        let sensor = registry
            .register(BlockDef::passable("sensor").with_behavior(recorder.clone()))
            .expect("sensor");
        let core = registry
            .register(
                BlockDef::passable("core")
                    .with_inside_shape(Shape::cell_box([6.0, 6.0, 6.0], [10.0, 10.0, 10.0]))
                    .with_behavior(recorder.clone()),
            )
            .expect("core");
        registry
            .register(BlockDef::passable("exploding").with_behavior(Arc::new(Exploding)))
            .expect("exploding");
        registry
            .register(BlockDef::passable("discarding").with_behavior(Arc::new(Discarding)))
            .expect("discarding");
        registry.set_fluid_behavior(FluidKind::Water, Arc::new(WaterFluid));
        Fixture {
            level: GridLevel::new(registry),
            recorder,
            sensor: BlockState::of(sensor),
            core: BlockState::of(core),
        }
    }

    fn along_x(from: f64, to: f64) -> Movement {
        Movement::straight(DVec3::new(from, 0.0, 0.5), DVec3::new(to, 0.0, 0.5))
    }

    #[test]
    fn block_is_entered_once_per_tick_despite_oscillation() {
        let mut fixture = fixture();
        fixture.level.set_block(IVec3::new(1, 0, 0), fixture.sensor);
        let mut entity = test_entity(DVec3::new(1.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        let movements = [along_x(0.5, 1.5), along_x(1.5, 0.5), along_x(0.5, 1.5)];
        let report = engine
            .apply_movements(&mut entity, &movements, &fixture.level, &mut effects)
            .expect("traversal");

        assert_eq!(fixture.recorder.contacts(), vec![(IVec3::new(1, 0, 0), true)]);
        assert_eq!(report.contacts, 1);

        engine
            .apply_movements(&mut entity, &[along_x(1.5, 1.5)], &fixture.level, &mut effects)
            .expect("next tick");
        assert_eq!(fixture.recorder.contacts().len(), 2);
    }

    #[test]
    fn short_move_only_checks_destination_cells() {
        let mut fixture = fixture();
        fixture.level.set_block(IVec3::new(3, 0, 0), fixture.sensor);
        fixture.level.set_block(IVec3::new(0, 1, 0), fixture.sensor);
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        engine
            .apply_movements(&mut entity, &[along_x(0.2, 0.5)], &fixture.level, &mut effects)
            .expect("traversal");

        assert_eq!(fixture.recorder.contacts(), vec![(IVec3::new(0, 1, 0), true)]);
    }

    #[test]
    fn fast_pass_through_small_shape_is_imprecise_contact() {
        let mut fixture = fixture();
        fixture.level.set_block(IVec3::new(2, 0, 0), fixture.core);
        let mut entity = test_entity(DVec3::new(4.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        engine
            .apply_movements(&mut entity, &[along_x(0.5, 4.5)], &fixture.level, &mut effects)
            .expect("traversal");

        assert_eq!(fixture.recorder.contacts(), vec![(IVec3::new(2, 0, 0), false)]);
    }

    #[test]
    fn axis_dependent_movement_ends_in_precise_contact() {
        let mut fixture = fixture();
        fixture.level.set_block(IVec3::new(0, 2, 0), fixture.core);
        fixture.level.set_block(IVec3::new(2, 0, 0), fixture.core);
        let mut entity = test_entity(DVec3::new(2.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        let movement = Movement {
            from: DVec3::new(0.5, 0.0, 0.5),
            to: DVec3::new(2.5, 0.0, 0.5),
            axis_dependent_original: Some(DVec3::new(2.0, 0.0, 0.0)),
        };
        engine
            .apply_movements(&mut entity, &[movement], &fixture.level, &mut effects)
            .expect("traversal");

        assert_eq!(fixture.recorder.contacts(), vec![(IVec3::new(2, 0, 0), true)]);
    }

    #[test]
    fn long_segment_is_bounded_and_still_checks_destination() {
        let mut fixture = fixture();
        fixture
            .level
            .fill(IVec3::new(1, 0, 0), IVec3::new(40, 0, 0), fixture.sensor)
            .expect("row");
        let mut entity = test_entity(DVec3::new(40.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        let report = engine
            .apply_movements(&mut entity, &[along_x(0.5, 40.5)], &fixture.level, &mut effects)
            .expect("traversal");

        let contacts = fixture.recorder.contacts();
        assert!(contacts.len() <= 17, "visited {} blocks", contacts.len());
        assert!(contacts.iter().any(|(pos, _)| pos.x == 40));
        assert!(!contacts.iter().any(|(pos, _)| pos.x == 30));
        assert_eq!(report.exhausted_movements, 1);
    }

    #[test]
    fn callback_failure_is_fatal_and_names_the_block() {
        let mut fixture = fixture();
        let exploding = BlockState::of(fixture.level.registry().id_of("exploding").expect("id"));
        fixture.level.set_block(IVec3::ZERO, exploding);
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        let err = engine
            .apply_movements(&mut entity, &[along_x(0.5, 0.5)], &fixture.level, &mut effects)
            .expect_err("callback error must surface");

        assert_eq!(err.block, "exploding");
        assert_eq!(err.block_pos, IVec3::ZERO);
        assert_eq!(err.entity, entity.id());
        assert!(err.to_string().contains("exploding"));
    }

    #[test]
    fn removal_during_traversal_stops_further_callbacks() {
        let mut fixture = fixture();
        let discarding = BlockState::of(fixture.level.registry().id_of("discarding").expect("id"));
        fixture.level.set_block(IVec3::new(1, 0, 0), discarding);
        fixture.level.set_block(IVec3::new(3, 0, 0), fixture.sensor);
        let mut entity = test_entity(DVec3::new(3.5, 0.0, 0.5));
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        engine
            .apply_movements(&mut entity, &[along_x(0.5, 3.5)], &fixture.level, &mut effects)
            .expect("traversal");

        assert!(entity.is_removed());
        assert!(fixture.recorder.contacts().is_empty());
    }

    #[test]
    fn water_contact_queues_extinguish() {
        let mut fixture = fixture();
        fixture
            .level
            .set_fluid(IVec3::ZERO, FluidState::source(FluidKind::Water));
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));
        entity.ignite_for_ticks(100);
        let mut engine = BlockTraversalEngine::default();
        let mut effects = EffectCollector::default();

        engine
            .apply_movements(&mut entity, &[along_x(0.5, 0.5)], &fixture.level, &mut effects)
            .expect("traversal");
        effects.apply_and_clear(&mut entity);

        assert_eq!(entity.remaining_fire_ticks(), 0);
    }

    #[test]
    fn segment_walk_visits_each_crossed_cell() {
        let mut cells = Vec::new();
        walk_segment(DVec3::new(0.5, 0.5, 0.5), DVec3::new(2.5, 1.5, 0.5), |pos| {
            cells.push(pos);
            true
        });
        assert_eq!(cells.first(), Some(&IVec3::new(0, 0, 0)));
        assert_eq!(cells.last(), Some(&IVec3::new(2, 1, 0)));
        assert_eq!(cells.len(), 4);
    }
}
