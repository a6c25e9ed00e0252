//! Tick driver: owns the entities of one level and advances them in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::DVec3;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, KernelConfig};
use crate::entity::{
    Entity, EntityId, EntityIdAllocator, EntityProfile, EntityUuid, MoverKind, RemovalReason,
    SimulationRole, TickAuthority,
};
use crate::events::{EventBus, EventSink, GameEventKind, KernelEvent, SoundKind};
use crate::leash::{
    LeashAttachment, LeashConstraintSolver, LeashOutcome, LeashState, PendingHolder,
};
use crate::math::{block_containing, block_origin, Aabb, BlockPos};
use crate::metrics::{MetricsHandle, TickCounters};
use crate::physics::effects::EffectCollector;
use crate::physics::fluid::FluidInteractionModel;
use crate::physics::movement::MoveContext;
use crate::physics::traversal::{BlockEffectFailure, BlockTraversalEngine};
use crate::recorder::MovementRecorder;
use crate::shape::Shape;
use crate::world::{
    BlockGetter, BlockRegistry, BlockState, CollisionGetter, FluidState, GridLevel, LevelReader,
    WorldBorder,
};

const PUSH_STRENGTH: f64 = 0.05;
const MIN_PUSH_SEPARATION: f64 = 0.01;
const KNOT_OFFSET: DVec3 = DVec3::new(0.5, 0.25, 0.5);

#[derive(Debug, Error)]
pub enum TickError {
    #[error("tick {tick} aborted: {source}")]
    BlockEffectFailure {
        tick: u64,
        #[source]
        source: BlockEffectFailure,
    },
}

/// Collision view for one moving entity: the level plus every other entity.
struct NeighborView<'a, L: ?Sized> {
    level: &'a L,
    before: &'a [Entity],
    after: &'a [Entity],
    mover_vehicle: Option<EntityId>,
}

impl<'a, L: ?Sized> NeighborView<'a, L> {
    fn others(&self) -> impl Iterator<Item = &'a Entity> {
        self.before.iter().chain(self.after)
    }

    fn find(&self, id: EntityId) -> Option<&'a Entity> {
        self.others().find(|entity| entity.id == id)
    }
}

impl<L: CollisionGetter + ?Sized> BlockGetter for NeighborView<'_, L> {
    fn block_state(&self, pos: BlockPos) -> BlockState {
        self.level.block_state(pos)
    }

    fn fluid_state(&self, pos: BlockPos) -> FluidState {
        self.level.fluid_state(pos)
    }

    fn registry(&self) -> &BlockRegistry {
        self.level.registry()
    }

    fn is_loaded(&self, pos: BlockPos) -> bool {
        self.level.is_loaded(pos)
    }
}

impl<L: CollisionGetter + ?Sized> LevelReader for NeighborView<'_, L> {
    fn world_border(&self) -> Option<&WorldBorder> {
        self.level.world_border()
    }

    fn min_y(&self) -> i32 {
        self.level.min_y()
    }
}

impl<L: CollisionGetter + ?Sized> CollisionGetter for NeighborView<'_, L> {
    fn block_collisions(&self, query: &Aabb, excluding: Option<EntityId>) -> Vec<Shape> {
        self.level.block_collisions(query, excluding)
    }

    fn entity_collisions(&self, query: &Aabb, excluding: Option<EntityId>) -> Vec<Shape> {
        let mut shapes = self.level.entity_collisions(query, excluding);
        shapes.extend(
            self.others()
                .filter(|other| other.profile.physics.solid_collider && !other.is_removed())
                .filter(|other| Some(other.id) != excluding && Some(other.id) != self.mover_vehicle)
                .filter(|other| excluding.is_none() || other.vehicle != excluding)
                .map(|other| other.bounding_box())
                .filter(|bbox| bbox.intersects(query))
                .map(Shape::from_box),
        );
        shapes
    }
}

fn split_current(entities: &mut [Entity], index: usize) -> Option<(&mut Entity, &[Entity], &[Entity])> {
    let (before, rest) = entities.split_at_mut(index);
    let (current, after) = rest.split_first_mut()?;
    Some((current, &*before, &*after))
}

fn pair_mut(entities: &mut [Entity], a: usize, b: usize) -> Option<(&mut Entity, &mut Entity)> {
    if a == b || a >= entities.len() || b >= entities.len() {
        return None;
    }
    if a < b {
        let (left, right) = entities.split_at_mut(b);
        Some((&mut left[a], &mut right[0]))
    } else {
        let (left, right) = entities.split_at_mut(a);
        Some((&mut right[0], &mut left[b]))
    }
}

fn find_mut<'a>(
    entities: &'a mut [Entity],
    pending: &'a mut [Entity],
    id: EntityId,
) -> Option<&'a mut Entity> {
    match entities.binary_search_by_key(&id, |entity| entity.id) {
        Ok(index) => Some(&mut entities[index]),
        Err(_) => pending.iter_mut().find(|entity| entity.id == id),
    }
}

fn shares_vehicle(a: &Entity, b: &Entity) -> bool {
    a.vehicle == Some(b.id)
        || b.vehicle == Some(a.id)
        || (a.vehicle.is_some() && a.vehicle == b.vehicle)
}

fn push_apart(a: &mut Entity, b: &mut Entity) {
    if shares_vehicle(a, b) {
        return;
    }
    let dx = b.position().x - a.position().x;
    let dz = b.position().z - a.position().z;
    let largest = dx.abs().max(dz.abs());
    if largest < MIN_PUSH_SEPARATION {
        return;
    }
    let root = largest.sqrt();
    let falloff = (1.0 / root).min(1.0);
    let impulse = DVec3::new(dx / root, 0.0, dz / root) * falloff * PUSH_STRENGTH;
    if a.passengers.is_empty() {
        a.push(-impulse);
    }
    if b.passengers.is_empty() {
        b.push(impulse);
    }
}

#[derive(Debug)]
pub struct Simulation<L = GridLevel> {
    config: KernelConfig,
    role: SimulationRole,
    level: L,
    allocator: Arc<EntityIdAllocator>,
    entities: Vec<Entity>,
    pending_spawns: Vec<Entity>,
    pending_despawns: Vec<EntityId>,
    by_uuid: HashMap<EntityUuid, EntityId>,
    knots: HashMap<BlockPos, EntityId>,
    knot_profile: Arc<EntityProfile>,
    game_time: u64,
    traversal: BlockTraversalEngine,
    effects: EffectCollector,
    events: EventBus,
    counters: TickCounters,
    metrics: MetricsHandle,
}

impl<L: CollisionGetter> Simulation<L> {
    pub fn new(
        config: KernelConfig,
        role: SimulationRole,
        level: L,
        allocator: Arc<EntityIdAllocator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            traversal: BlockTraversalEngine::new(&config.traversal),
            config,
            role,
            level,
            allocator,
            entities: Vec::new(),
            pending_spawns: Vec::new(),
            pending_despawns: Vec::new(),
            by_uuid: HashMap::new(),
            knots: HashMap::new(),
            knot_profile: Arc::new(EntityProfile::leash_knot()),
            game_time: 0,
            effects: EffectCollector::default(),
            events: EventBus::default(),
            counters: TickCounters::default(),
            metrics: MetricsHandle::default(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn role(&self) -> SimulationRole {
        self.role
    }

    pub fn level(&self) -> &L {
        &self.level
    }

    pub fn level_mut(&mut self) -> &mut L {
        &mut self.level
    }

    pub fn game_time(&self) -> u64 {
        self.game_time
    }

    pub fn metrics(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    pub fn counters(&self) -> TickCounters {
        self.counters
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<KernelEvent> {
        self.events.drain()
    }

    /// Queues a new entity; it joins the level at the next tick boundary.
    pub fn spawn(&mut self, profile: Arc<EntityProfile>, position: DVec3) -> Option<EntityId> {
        if !position.is_finite() {
            warn!(kind = %profile.kind, ?position, "rejected_spawn_position");
            return None;
        }
        let id = self.allocator.allocate();
        let mut entity = Entity::new(id, self.allocator.uuid_for(id), profile, position);
        entity.recorder = MovementRecorder::with_capacity(self.config.movement.recorder_capacity);
        self.pending_spawns.push(entity);
        Some(id)
    }

    pub fn apply_pending(&mut self) {
        if !self.pending_despawns.is_empty() {
            self.pending_despawns.sort();
            self.pending_despawns.dedup();
            let pending = &self.pending_despawns;
            self.entities
                .retain(|entity| pending.binary_search(&entity.id).is_err());
            self.by_uuid.retain(|_, id| pending.binary_search(id).is_err());
            self.knots.retain(|_, id| pending.binary_search(id).is_err());
            self.pending_despawns.clear();
        }

        if !self.pending_spawns.is_empty() {
            let spawns = std::mem::take(&mut self.pending_spawns);
            for entity in spawns.into_iter().filter(|entity| !entity.is_removed()) {
                self.insert_entity(entity);
            }
        }
    }

    fn insert_entity(&mut self, entity: Entity) {
        self.by_uuid.insert(entity.uuid, entity.id);
        let at = self.entities.partition_point(|existing| existing.id < entity.id);
        self.entities.insert(at, entity);
    }

    fn index_of(&self, id: EntityId) -> Option<usize> {
        self.entities
            .binary_search_by_key(&id, |entity| entity.id)
            .ok()
    }

    fn is_alive(&self, id: EntityId) -> bool {
        self.entity(id).is_some_and(|entity| !entity.is_removed())
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        match self.index_of(id) {
            Some(index) => self.entities.get(index),
            None => self.pending_spawns.iter().find(|entity| entity.id == id),
        }
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        find_mut(&mut self.entities, &mut self.pending_spawns, id)
    }

    pub fn find_by_uuid(&self, uuid: EntityUuid) -> Option<EntityId> {
        self.by_uuid.get(&uuid).copied()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Moves one entity outside its own tick (pistons, scripted shoves).
    pub fn move_entity(&mut self, id: EntityId, mover: MoverKind, delta: DVec3) -> Option<DVec3> {
        let index = self.index_of(id)?;
        let Self {
            config,
            level,
            entities,
            events,
            game_time,
            ..
        } = self;
        let (entity, before, after) = split_current(entities, index)?;
        let view = NeighborView {
            level: &*level,
            before,
            after,
            mover_vehicle: entity.vehicle,
        };
        let mut ctx = MoveContext {
            game_time: *game_time,
            config: &config.movement,
            events: &mut *events,
        };
        Some(entity.move_entity(mover, delta, &view, &mut ctx))
    }

    /// Marks the entity removed. The first reason sticks; the riding cascade
    /// runs on every call. Returns the reason in effect.
    pub fn remove(&mut self, id: EntityId, reason: RemovalReason) -> Option<RemovalReason> {
        let (effective, passengers, leashed) = {
            let entity = self.entity_mut(id)?;
            let (effective, _) = entity.mark_removed(reason);
            let leashed = entity.leash.state() != LeashState::Unattached;
            (effective, entity.passengers.clone(), leashed)
        };

        // Entities marked during their own tick reach here with the reason
        // already set; they still owe their event and despawn.
        if !self.pending_despawns.contains(&id) {
            self.counters.removals += 1;
            self.pending_despawns.push(id);
            self.events.emit(KernelEvent::EntityRemoved {
                entity: id,
                reason: effective,
            });
            info!(entity = %id, reason = ?effective, "entity_removed");
            if leashed && effective.destroys() {
                self.release_leash(id, self.config.rules.entity_drops);
            }
        }
        if effective.destroys() {
            self.stop_riding(id);
        }
        for passenger in passengers {
            self.stop_riding(passenger);
        }
        Some(effective)
    }

    pub fn start_riding(&mut self, passenger: EntityId, vehicle: EntityId) -> bool {
        if passenger == vehicle || !self.is_alive(passenger) || !self.is_alive(vehicle) {
            return false;
        }
        let mut cursor = Some(vehicle);
        let mut depth = 0;
        while let Some(current) = cursor {
            if current == passenger || depth > self.entities.len() {
                return false;
            }
            cursor = self.entity(current).and_then(|entity| entity.vehicle);
            depth += 1;
        }

        self.stop_riding(passenger);
        let Some(seat) = self.entity(vehicle).map(seat_position) else {
            return false;
        };
        if let Some(rider) = self.entity_mut(passenger) {
            rider.vehicle = Some(vehicle);
            rider.set_position(seat);
            rider.needs_sync = true;
        }
        if let Some(mount) = self.entity_mut(vehicle) {
            mount.passengers.push(passenger);
        }
        self.events.emit(KernelEvent::GameEvent {
            kind: GameEventKind::EntityMount,
            entity: passenger,
            position: seat,
        });
        true
    }

    pub fn stop_riding(&mut self, passenger: EntityId) -> bool {
        let (vehicle, position) = match self.entity_mut(passenger) {
            Some(rider) => match rider.vehicle.take() {
                Some(vehicle) => {
                    rider.needs_sync = true;
                    (vehicle, rider.position())
                }
                None => return false,
            },
            None => return false,
        };
        if let Some(mount) = self.entity_mut(vehicle) {
            mount.passengers.retain(|id| *id != passenger);
        }
        self.events.emit(KernelEvent::GameEvent {
            kind: GameEventKind::EntityDismount,
            entity: passenger,
            position,
        });
        true
    }

    pub fn set_leashed_to(&mut self, entity: EntityId, holder: EntityId) -> bool {
        if entity == holder || !self.is_alive(holder) || !self.is_leashable(entity) {
            return false;
        }
        let attachment = self.attachment_for(holder);
        let Some(leashed) = self.entity_mut(entity) else {
            return false;
        };
        leashed.leash.attach(holder);
        leashed.leash.remember(attachment);
        leashed.needs_sync = true;
        info!(entity = %entity, holder = %holder, "entity_leashed");
        true
    }

    /// Ties the leash to a knot at `pos`, creating the knot if needed.
    pub fn leash_to_anchor(&mut self, entity: EntityId, pos: BlockPos) -> Option<EntityId> {
        if !self.is_leashable(entity) {
            return None;
        }
        let knot = self.knot_at(pos);
        self.set_leashed_to(entity, knot).then_some(knot)
    }

    /// Releases the leash, dropping a lead when the world rules allow it.
    pub fn drop_leash(&mut self, entity: EntityId) -> bool {
        let leashed = self
            .entity(entity)
            .is_some_and(|entity| entity.leash.state() != LeashState::Unattached);
        if leashed {
            self.release_leash(entity, self.config.rules.entity_drops);
        }
        leashed
    }

    fn release_leash(&mut self, entity: EntityId, drop_item: bool) {
        let solver = LeashConstraintSolver::new(&self.config.leash, &self.config.rules);
        if let Some(leashed) = find_mut(&mut self.entities, &mut self.pending_spawns, entity) {
            solver.release(leashed, drop_item, &mut self.events);
        }
    }

    fn is_leashable(&self, id: EntityId) -> bool {
        self.entity(id)
            .is_some_and(|entity| !entity.is_removed() && entity.profile.leash.is_some())
    }

    /// Persisted form of the leash. A holder that already left the world is
    /// saved as it was last known.
    pub fn save_leash(&self, entity: EntityId) -> Option<LeashAttachment> {
        let leash = self.entity(entity)?.leash;
        match leash.state() {
            LeashState::Unattached => None,
            LeashState::Attached { holder } => self
                .attachment_for(holder)
                .or(leash.last_attachment()),
            LeashState::Pending { holder, .. } => match holder {
                PendingHolder::Uuid(uuid) => Some(LeashAttachment::Holder { uuid }),
                PendingHolder::Anchor(pos) => Some(LeashAttachment::anchor(pos)),
                PendingHolder::NetworkId(id) => self
                    .attachment_for(id)
                    .or(leash.last_attachment()),
            },
        }
    }

    fn attachment_for(&self, holder: EntityId) -> Option<LeashAttachment> {
        let holder = self.entity(holder)?;
        Some(if holder.profile.leash_knot {
            LeashAttachment::anchor(block_containing(holder.position()))
        } else {
            LeashAttachment::Holder { uuid: holder.uuid }
        })
    }

    /// Restores a persisted leash; the holder is resolved during later ticks.
    pub fn load_leash(&mut self, entity: EntityId, attachment: LeashAttachment) -> bool {
        self.set_pending_leash(entity, attachment.into_pending())
    }

    /// Mirrored copies learn their holder by network id before it may exist.
    pub fn set_pending_leash(&mut self, entity: EntityId, holder: PendingHolder) -> bool {
        if !self.is_leashable(entity) {
            return false;
        }
        let Some(leashed) = self.entity_mut(entity) else {
            return false;
        };
        let since = leashed.tick_count;
        leashed.leash.set_pending(holder, since);
        true
    }

    fn knot_at(&mut self, pos: BlockPos) -> EntityId {
        if let Some(id) = self.knots.get(&pos).copied().filter(|id| self.is_alive(*id)) {
            return id;
        }
        let id = self.allocator.allocate();
        let position = block_origin(pos) + KNOT_OFFSET;
        let knot = Entity::new(id, self.allocator.uuid_for(id), self.knot_profile.clone(), position);
        self.insert_entity(knot);
        self.knots.insert(pos, id);
        self.events.emit(KernelEvent::Sound {
            sound: SoundKind::LeashKnotPlace,
            position,
        });
        debug!(knot = %id, ?pos, "leash_knot_created");
        id
    }

    fn resolve_pending(&mut self, pending: PendingHolder) -> Option<EntityId> {
        match pending {
            PendingHolder::Uuid(uuid) => self.find_by_uuid(uuid).filter(|id| self.is_alive(*id)),
            PendingHolder::NetworkId(id) => Some(id).filter(|id| self.is_alive(*id)),
            PendingHolder::Anchor(pos) => Some(self.knot_at(pos)),
        }
    }

    /// Advances every entity by one tick. A block effect failure aborts the
    /// tick; the level should be treated as inconsistent afterwards.
    pub fn tick(&mut self) -> Result<(), TickError> {
        self.apply_pending();
        self.game_time += 1;
        self.counters.ticks += 1;

        let count = self.entities.len();
        for index in 0..count {
            if self.entities[index].is_removed() {
                continue;
            }
            match self.role.authority_for(self.entities[index].locally_controlled) {
                TickAuthority::Mirrored => self.tick_mirrored(index),
                TickAuthority::Authoritative => {
                    if let Err(source) = self.tick_authoritative(index) {
                        self.effects.clear();
                        return Err(TickError::BlockEffectFailure {
                            tick: self.game_time,
                            source,
                        });
                    }
                }
            }
        }

        self.discard_orphan_knots();
        self.apply_pending();
        self.metrics.publish(self.counters);
        Ok(())
    }

    fn tick_mirrored(&mut self, index: usize) {
        let entity = &mut self.entities[index];
        entity.position.save_old();
        entity.tick_count += 1;
        if let Some(mut interpolation) = entity.interpolation.take() {
            let (position, yaw, pitch, done) =
                interpolation.step(entity.position(), entity.yaw(), entity.pitch());
            entity.position.set_position(position);
            entity.position.set_rotation(yaw, pitch);
            if !done {
                entity.interpolation = Some(interpolation);
            }
        }
        entity.recorder.clear();
        entity.first_tick = false;
        self.counters.mirrored_ticks += 1;
    }

    fn tick_authoritative(&mut self, index: usize) -> Result<(), BlockEffectFailure> {
        {
            let Self {
                config,
                level,
                entities,
                traversal,
                effects,
                events,
                counters,
                game_time,
                ..
            } = self;
            let Some((entity, before, after)) = split_current(entities, index) else {
                return Ok(());
            };
            let view = NeighborView {
                level: &*level,
                before,
                after,
                mover_vehicle: entity.vehicle,
            };
            entity.position.save_old();
            entity.tick_count += 1;
            counters.entities_ticked += 1;

            let seat = entity
                .vehicle
                .and_then(|vehicle| view.find(vehicle))
                .filter(|vehicle| !vehicle.is_removed())
                .map(seat_position);
            match seat {
                Some(seat) => {
                    entity.set_position(seat);
                    entity.set_velocity(DVec3::ZERO);
                }
                None => {
                    let mut ctx = MoveContext {
                        game_time: *game_time,
                        config: &config.movement,
                        events: &mut *events,
                    };
                    entity.travel(&view, &mut ctx);
                }
            }

            if entity.is_no_physics() || entity.is_removed() {
                entity.recorder.clear();
            } else {
                let movements = entity
                    .recorder
                    .drain_or_synthesize(entity.position.old_position(), entity.position());
                let report = traversal.apply_movements(entity, &movements, &*level, effects)?;
                counters.blocks_visited += report.visited_cells as u64;
                counters.block_contacts += report.contacts as u64;
                effects.apply_and_clear(entity);
                FluidInteractionModel::new(&config.fluid).update(entity, &*level, &mut *events);
            }

            if entity.remaining_fire_ticks > 0 {
                entity.remaining_fire_ticks -= 1;
            }
            entity.first_tick = false;
            counters.rejected_inputs += u64::from(entity.position.take_rejected_inputs());
        }

        let entity = &self.entities[index];
        let floor = f64::from(self.level.min_y()) - self.config.movement.below_world_margin;
        if entity.position().y < floor {
            let id = entity.id;
            info!(entity = %id, y = entity.position().y, "entity_below_world");
            self.remove(id, RemovalReason::Discarded);
            return Ok(());
        }
        if let Some(reason) = entity.removal_reason() {
            let id = entity.id;
            self.remove(id, reason);
            return Ok(());
        }

        self.tick_leash(index);
        self.push_neighbours(index);
        Ok(())
    }

    fn tick_leash(&mut self, index: usize) {
        let holder = match self.entities[index].leash.state() {
            LeashState::Unattached => return,
            LeashState::Attached { holder } => holder,
            LeashState::Pending { holder, .. } => match self.resolve_pending(holder) {
                Some(resolved) => {
                    let attachment = self.attachment_for(resolved);
                    let entity = &mut self.entities[index];
                    entity.leash.attach(resolved);
                    entity.leash.remember(attachment);
                    debug!(entity = %entity.id, holder = %resolved, "leash_restored");
                    resolved
                }
                None => {
                    let solver = LeashConstraintSolver::new(&self.config.leash, &self.config.rules);
                    if solver.expire_pending(&mut self.entities[index], &mut self.events) {
                        self.counters.leashes_abandoned += 1;
                    }
                    return;
                }
            },
        };

        let solver = LeashConstraintSolver::new(&self.config.leash, &self.config.rules);
        match self.index_of(holder) {
            Some(holder_index) => {
                let Some((entity, holder)) = pair_mut(&mut self.entities, index, holder_index) else {
                    return;
                };
                if solver.solve(entity, holder, &mut self.events) == LeashOutcome::Snapped {
                    self.counters.leash_snaps += 1;
                }
            }
            None => solver.release(
                &mut self.entities[index],
                self.config.rules.entity_drops,
                &mut self.events,
            ),
        }
    }

    fn push_neighbours(&mut self, index: usize) {
        let entity = &self.entities[index];
        if !entity.profile.physics.pushable || entity.is_no_physics() {
            return;
        }
        let bbox = entity.bounding_box();
        let touching: Vec<usize> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(other, neighbour)| {
                *other != index
                    && !neighbour.is_removed()
                    && neighbour.profile.physics.pushable
                    && !neighbour.is_no_physics()
                    && neighbour.bounding_box().intersects(&bbox)
            })
            .map(|(other, _)| other)
            .collect();
        for other in touching {
            if let Some((entity, neighbour)) = pair_mut(&mut self.entities, index, other) {
                push_apart(entity, neighbour);
            }
        }
    }

    /// Knots only live while something is tied to them.
    fn discard_orphan_knots(&mut self) {
        if self.knots.is_empty() {
            return;
        }
        let mut referenced: HashSet<EntityId> = HashSet::new();
        for entity in self.entities.iter().filter(|entity| !entity.is_removed()) {
            match entity.leash.state() {
                LeashState::Attached { holder } => {
                    referenced.insert(holder);
                }
                LeashState::Pending {
                    holder: PendingHolder::Anchor(pos),
                    ..
                } => {
                    if let Some(knot) = self.knots.get(&pos) {
                        referenced.insert(*knot);
                    }
                }
                _ => {}
            }
        }
        let orphans: Vec<EntityId> = self
            .knots
            .values()
            .copied()
            .filter(|knot| !referenced.contains(knot))
            .collect();
        for knot in orphans {
            self.remove(knot, RemovalReason::Discarded);
        }
    }
}

fn seat_position(vehicle: &Entity) -> DVec3 {
    vehicle.position() + DVec3::new(0.0, vehicle.dimensions().height, 0.0)
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::*;
    use crate::entity::testing::test_profile;
    use crate::entity::{EntityDimensions, LeashProfile, PhysicsProfile};
    use crate::events::DroppedItem;
    use crate::leash::DefaultLeashHooks;
    use crate::world::{BlockBehavior, BlockCallbackError, BlockDef, FluidKind};

    fn floor_level() -> GridLevel {
        let mut registry = BlockRegistry::default();
        let stone = registry.register(BlockDef::solid("stone")).expect("stone");
        let mut level = GridLevel::new(registry);
        level
            .fill(IVec3::new(-16, -1, -16), IVec3::new(16, -1, 16), BlockState::of(stone))
            .expect("floor");
        level
    }

    fn simulation(level: GridLevel, role: SimulationRole) -> Simulation {
        Simulation::new(
            KernelConfig::default(),
            role,
            level,
            Arc::new(EntityIdAllocator::default()),
        )
        .expect("simulation")
    }

    fn walker() -> Arc<EntityProfile> {
        Arc::new(test_profile())
    }

    fn animal() -> Arc<EntityProfile> {
        Arc::new(test_profile().with_leash(LeashProfile {
            quad: false,
            snap_distance: None,
            elastic_distance: None,
            hooks: Arc::new(DefaultLeashHooks),
        }))
    }

    fn boat() -> Arc<EntityProfile> {
        Arc::new(
            EntityProfile::new("boat", EntityDimensions::new(1.375, 0.5625)).with_physics(
                PhysicsProfile {
                    pushable: false,
                    solid_collider: true,
                    ..PhysicsProfile::default()
                },
            ),
        )
    }

    fn spawn(sim: &mut Simulation, profile: Arc<EntityProfile>, position: DVec3) -> EntityId {
        let id = sim.spawn(profile, position).expect("spawn");
        sim.apply_pending();
        id
    }

    fn count_sounds(events: &[KernelEvent], kind: SoundKind) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, KernelEvent::Sound { sound, .. } if *sound == kind))
            .count()
    }

    #[test]
    fn removal_keeps_first_reason() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let id = spawn(&mut sim, walker(), DVec3::ZERO);

        assert_eq!(sim.remove(id, RemovalReason::Killed), Some(RemovalReason::Killed));
        assert_eq!(sim.remove(id, RemovalReason::Discarded), Some(RemovalReason::Killed));
        assert_eq!(
            sim.entity(id).and_then(Entity::removal_reason),
            Some(RemovalReason::Killed)
        );
        let removed_events = sim
            .drain_events()
            .into_iter()
            .filter(|event| matches!(event, KernelEvent::EntityRemoved { .. }))
            .count();
        assert_eq!(removed_events, 1);

        sim.apply_pending();
        assert!(sim.entity(id).is_none());
    }

    #[test]
    fn unloading_vehicle_still_ejects_passengers() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let vehicle = spawn(&mut sim, boat(), DVec3::new(0.5, 0.0, 0.5));
        let rider = spawn(&mut sim, walker(), DVec3::new(3.0, 0.0, 0.0));
        assert!(sim.start_riding(rider, vehicle));
        assert_eq!(sim.entity(rider).and_then(Entity::vehicle), Some(vehicle));

        sim.remove(vehicle, RemovalReason::UnloadedToChunk);

        assert_eq!(sim.entity(rider).and_then(Entity::vehicle), None);
        assert!(sim.entity(vehicle).is_some_and(|v| v.passengers().is_empty()));
        assert!(sim.drain_events().iter().any(|event| matches!(
            event,
            KernelEvent::GameEvent { kind: GameEventKind::EntityDismount, .. }
        )));
    }

    #[test]
    fn killed_passenger_stops_riding() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let vehicle = spawn(&mut sim, boat(), DVec3::new(0.5, 0.0, 0.5));
        let rider = spawn(&mut sim, walker(), DVec3::new(3.0, 0.0, 0.0));
        assert!(sim.start_riding(rider, vehicle));

        sim.remove(rider, RemovalReason::Killed);
        assert!(sim.entity(vehicle).is_some_and(|v| v.passengers().is_empty()));
    }

    #[test]
    fn riding_cycles_are_rejected_and_passengers_follow_vehicle() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let vehicle = spawn(&mut sim, boat(), DVec3::new(0.5, 0.0, 0.5));
        let rider = spawn(&mut sim, walker(), DVec3::new(3.0, 0.0, 0.0));
        assert!(sim.start_riding(rider, vehicle));
        assert!(!sim.start_riding(vehicle, rider));

        sim.entity_mut(vehicle)
            .expect("vehicle")
            .set_position(DVec3::new(2.5, 0.0, 0.5));
        sim.tick().expect("tick");

        let rider_position = sim.entity(rider).expect("rider").position();
        let vehicle_position = sim.entity(vehicle).expect("vehicle").position();
        assert!((rider_position.x - vehicle_position.x).abs() < 1e-9);
        assert!((rider_position.y - (vehicle_position.y + 0.5625)).abs() < 1e-9);
    }

    #[test]
    fn holder_teleport_snaps_leash_with_one_break_sound() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        let owner = spawn(&mut sim, walker(), DVec3::new(0.8, 0.0, 0.5));
        assert!(sim.set_leashed_to(pet, owner));
        sim.tick().expect("tick");
        assert!(sim.entity(pet).is_some_and(Entity::is_leashed));

        sim.entity_mut(owner)
            .expect("owner")
            .set_position(DVec3::new(13.8, 0.0, 0.5));
        sim.drain_events();
        sim.tick().expect("tick");

        assert_eq!(
            sim.entity(pet).map(|pet| pet.leash().state()),
            Some(LeashState::Unattached)
        );
        let events = sim.drain_events();
        assert_eq!(count_sounds(&events, SoundKind::LeashBreak), 1);
        assert_eq!(sim.counters().leash_snaps, 1);
    }

    #[test]
    fn killing_the_holder_releases_the_leash_next_tick() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        let owner = spawn(&mut sim, walker(), DVec3::new(3.5, 0.0, 0.5));
        assert!(sim.set_leashed_to(pet, owner));

        sim.remove(owner, RemovalReason::Killed);
        sim.tick().expect("tick");

        assert!(!sim.entity(pet).is_some_and(Entity::is_leashed));
        assert!(sim.drain_events().iter().any(|event| matches!(
            event,
            KernelEvent::ItemDropped { item: DroppedItem::Lead, .. }
        )));
    }

    #[test]
    fn persisted_holder_resolves_by_uuid() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        let owner = spawn(&mut sim, walker(), DVec3::new(2.5, 0.0, 0.5));
        assert!(sim.set_leashed_to(pet, owner));
        let saved = sim.save_leash(pet).expect("saved");
        let owner_uuid = sim.entity(owner).expect("owner").uuid();
        assert_eq!(saved, LeashAttachment::Holder { uuid: owner_uuid });

        let copy = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 2.5));
        assert!(sim.load_leash(copy, saved));
        assert_eq!(sim.save_leash(copy), Some(saved));
        sim.tick().expect("tick");

        assert_eq!(sim.entity(copy).and_then(|copy| copy.leash().holder()), Some(owner));
    }

    #[test]
    fn unloaded_holder_is_saved_as_last_known() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        let owner = spawn(&mut sim, walker(), DVec3::new(2.5, 0.0, 0.5));
        let owner_uuid = sim.entity(owner).expect("owner").uuid();
        assert!(sim.set_leashed_to(pet, owner));

        sim.remove(owner, RemovalReason::UnloadedToChunk);
        sim.apply_pending();
        assert!(sim.entity(owner).is_none());

        assert_eq!(
            sim.save_leash(pet),
            Some(LeashAttachment::Holder { uuid: owner_uuid })
        );
    }

    #[test]
    fn unresolved_holder_is_abandoned_after_grace_period() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        assert!(sim.load_leash(pet, LeashAttachment::Holder { uuid: EntityUuid(999) }));

        for _ in 0..100 {
            sim.tick().expect("tick");
        }
        assert!(sim.entity(pet).is_some_and(|pet| pet.leash().pending().is_some()));

        sim.drain_events();
        sim.tick().expect("tick");
        assert_eq!(
            sim.entity(pet).map(|pet| pet.leash().state()),
            Some(LeashState::Unattached)
        );
        assert!(sim.drain_events().iter().any(|event| matches!(
            event,
            KernelEvent::ItemDropped { item: DroppedItem::Lead, .. }
        )));
        assert_eq!(sim.counters().leashes_abandoned, 1);
    }

    #[test]
    fn anchor_knot_lives_while_leash_is_tied() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        let knot = sim
            .leash_to_anchor(pet, IVec3::new(3, 0, 3))
            .expect("knot");
        assert_eq!(sim.leash_to_anchor(pet, IVec3::new(3, 0, 3)), Some(knot));
        assert_eq!(
            sim.save_leash(pet),
            Some(LeashAttachment::Anchor { pos: [3, 0, 3] })
        );

        sim.tick().expect("tick");
        assert!(sim.entity(knot).is_some());

        assert!(sim.drop_leash(pet));
        sim.tick().expect("tick");
        assert!(sim.entity(knot).is_none());
        let events = sim.drain_events();
        assert_eq!(count_sounds(&events, SoundKind::LeashKnotPlace), 1);
    }

    #[test]
    fn persisted_anchor_recreates_knot() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let pet = spawn(&mut sim, animal(), DVec3::new(0.5, 0.0, 0.5));
        assert!(sim.load_leash(pet, LeashAttachment::anchor(IVec3::new(-2, 0, 1))));

        sim.tick().expect("tick");

        let holder = sim.entity(pet).and_then(|pet| pet.leash().holder()).expect("holder");
        let knot = sim.entity(holder).expect("knot");
        assert!(knot.profile().leash_knot);
        assert_eq!(block_containing(knot.position()), IVec3::new(-2, 0, 1));
    }

    #[test]
    fn unleashable_entities_reject_leashes() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let person = spawn(&mut sim, walker(), DVec3::ZERO);
        let other = spawn(&mut sim, walker(), DVec3::new(2.0, 0.0, 0.0));
        assert!(!sim.set_leashed_to(person, other));
        assert!(sim.leash_to_anchor(person, IVec3::ZERO).is_none());
        assert!(!sim.drop_leash(person));
    }

    #[test]
    fn falling_below_world_discards_entity() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let id = spawn(&mut sim, walker(), DVec3::new(0.0, -200.0, 0.0));

        sim.tick().expect("tick");

        assert!(sim.entity(id).is_none());
        assert!(sim.drain_events().contains(&KernelEvent::EntityRemoved {
            entity: id,
            reason: RemovalReason::Discarded,
        }));
    }

    #[test]
    fn client_mirrors_remote_entities_and_simulates_its_own() {
        let mut sim = simulation(GridLevel::new(BlockRegistry::default()), SimulationRole::Client);
        let remote = spawn(&mut sim, walker(), DVec3::new(0.0, 5.0, 0.0));
        let local = spawn(&mut sim, walker(), DVec3::new(4.0, 5.0, 0.0));
        sim.entity_mut(local).expect("local").set_locally_controlled(true);
        sim.entity_mut(remote)
            .expect("remote")
            .lerp_to(DVec3::new(0.0, 3.0, 0.0), 90.0, 0.0, 2);

        sim.tick().expect("tick");
        assert!((sim.entity(remote).expect("remote").position().y - 4.0).abs() < 1e-9);
        sim.tick().expect("tick");

        let remote = sim.entity(remote).expect("remote");
        assert!((remote.position().y - 3.0).abs() < 1e-9);
        assert!((remote.yaw() - 90.0).abs() < 1e-4);
        assert!(sim.entity(local).expect("local").position().y < 5.0);
        assert_eq!(sim.counters().mirrored_ticks, 2);
    }

    #[derive(Debug)]
    struct Corrupt;

    impl BlockBehavior for Corrupt {
        fn on_entity_entered_block(
            &self,
            _pos: BlockPos,
            _state: BlockState,
            _entity: &mut Entity,
            _effects: &mut EffectCollector,
            _precise_contact: bool,
        ) -> Result<(), BlockCallbackError> {
            Err(BlockCallbackError::new("missing block entity"))
        }
    }

    #[test]
    fn block_callback_failure_aborts_the_tick() {
        let mut level = floor_level();
        let corrupt = level
            .registry_mut()
            .register(BlockDef::passable("corrupt").with_behavior(Arc::new(Corrupt)))
            .expect("corrupt");
        level.set_block(IVec3::new(0, 0, 0), BlockState::of(corrupt));
        let mut sim = simulation(level, SimulationRole::Server);
        let id = spawn(&mut sim, walker(), DVec3::new(0.5, 0.0, 0.5));

        let err = sim.tick().expect_err("fatal");
        let TickError::BlockEffectFailure { tick, source } = err;
        assert_eq!(tick, 1);
        assert_eq!(source.block, "corrupt");
        assert_eq!(source.entity, id);
        assert_eq!(source.block_pos, IVec3::ZERO);
    }

    #[derive(Debug)]
    struct Shredder;

    impl BlockBehavior for Shredder {
        fn on_entity_entered_block(
            &self,
            _pos: BlockPos,
            _state: BlockState,
            entity: &mut Entity,
            _effects: &mut EffectCollector,
            _precise_contact: bool,
        ) -> Result<(), BlockCallbackError> {
            if entity.profile().kind == "boat" {
                entity.mark_removed(RemovalReason::Killed);
            }
            Ok(())
        }
    }

    #[test]
    fn removal_inside_block_callback_ejects_riders_and_despawns() {
        let mut level = floor_level();
        let shredder = level
            .registry_mut()
            .register(BlockDef::passable("shredder").with_behavior(Arc::new(Shredder)))
            .expect("shredder");
        level.set_block(IVec3::new(0, 0, 0), BlockState::of(shredder));
        let mut sim = simulation(level, SimulationRole::Server);
        let vehicle = spawn(&mut sim, boat(), DVec3::new(0.5, 0.0, 0.5));
        let rider = spawn(&mut sim, walker(), DVec3::new(3.0, 0.0, 0.0));
        assert!(sim.start_riding(rider, vehicle));
        sim.drain_events();

        sim.tick().expect("tick");

        assert!(sim.entity(vehicle).is_none());
        assert_eq!(sim.entity(rider).and_then(Entity::vehicle), None);
        let events = sim.drain_events();
        assert!(events.contains(&KernelEvent::EntityRemoved {
            entity: vehicle,
            reason: RemovalReason::Killed,
        }));
        assert!(events.iter().any(|event| matches!(
            event,
            KernelEvent::GameEvent { kind: GameEventKind::EntityDismount, .. }
        )));
        assert_eq!(sim.counters().removals, 1);
    }

    #[test]
    fn overlapping_entities_are_pushed_apart() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let a = spawn(&mut sim, walker(), DVec3::new(0.5, 0.0, 0.5));
        let b = spawn(&mut sim, walker(), DVec3::new(0.8, 0.0, 0.5));

        for _ in 0..3 {
            sim.tick().expect("tick");
        }

        let ax = sim.entity(a).expect("a").position().x;
        let bx = sim.entity(b).expect("b").position().x;
        assert!(bx - ax > 0.3, "separation {}", bx - ax);
    }

    #[test]
    fn solid_collider_entities_can_be_stood_on() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        spawn(&mut sim, boat(), DVec3::new(0.5, 0.0, 0.5));
        let rider = spawn(&mut sim, walker(), DVec3::new(0.5, 3.0, 0.5));

        for _ in 0..40 {
            sim.tick().expect("tick");
        }

        let rider = sim.entity(rider).expect("rider");
        assert!((rider.position().y - 0.5625).abs() < 1e-6, "y = {}", rider.position().y);
        assert!(rider.is_on_ground());
    }

    #[test]
    fn entity_in_water_is_flagged_after_tick() {
        let mut level = floor_level();
        level
            .fill_fluid(
                IVec3::new(-2, 0, -2),
                IVec3::new(2, 1, 2),
                FluidState::source(FluidKind::Water),
            )
            .expect("pool");
        let mut sim = simulation(level, SimulationRole::Server);
        let id = spawn(&mut sim, walker(), DVec3::new(0.5, 0.0, 0.5));

        sim.tick().expect("tick");
        assert!(sim.entity(id).is_some_and(Entity::is_in_water));
    }

    #[test]
    fn non_finite_spawn_is_rejected() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        assert!(sim.spawn(walker(), DVec3::new(f64::NAN, 0.0, 0.0)).is_none());
        sim.apply_pending();
        assert_eq!(sim.entity_count(), 0);
    }

    #[test]
    fn piston_moves_are_capped_per_tick() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        let id = spawn(&mut sim, walker(), DVec3::new(0.5, 0.0, 0.5));

        let first = sim
            .move_entity(id, MoverKind::Piston, DVec3::new(0.4, 0.0, 0.0))
            .expect("moved");
        let second = sim
            .move_entity(id, MoverKind::Piston, DVec3::new(0.4, 0.0, 0.0))
            .expect("moved");

        assert!((first.x - 0.4).abs() < 1e-9);
        assert!((second.x - 0.11).abs() < 1e-9);
    }

    #[test]
    fn metrics_handle_sees_published_totals() {
        let mut sim = simulation(floor_level(), SimulationRole::Server);
        spawn(&mut sim, walker(), DVec3::new(0.5, 0.0, 0.5));
        let handle = sim.metrics();

        for _ in 0..3 {
            sim.tick().expect("tick");
        }

        let totals = handle.snapshot();
        assert_eq!(totals.ticks, 3);
        assert_eq!(totals.entities_ticked, 3);
    }
}
