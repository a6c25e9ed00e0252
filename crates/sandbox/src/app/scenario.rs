//! Scripted demo level: a walker loops around a yard with a leashed pet,
//! crossing a flowing water channel, a slab ledge, a cobweb, a slime pad,
//! a magma patch and a fire that the channel later puts out.

use std::sync::Arc;

use glam::{DVec3, IVec3};
use motion_kernel::world::behaviors::{
    Cobweb, EffectBlock, FireBlock, LavaFluid, MagmaBlock, SlimeBlock, WaterFluid,
};
use motion_kernel::world::{LevelError, RegistryError};
use motion_kernel::{
    BlockDef, BlockRegistry, BlockState, ConfigError, DefaultLeashHooks, EntityDimensions,
    EntityId, EntityIdAllocator, EntityProfile, FluidKind, FluidState, GridLevel,
    InsideBlockEffect, KernelConfig, KernelEvent, LeashProfile, MoverKind, PhysicsProfile,
    Shape, Simulation, SimulationRole, SoundKind, TickCounters, TickError,
};
use thiserror::Error;
use tracing::{debug, info};

const YARD_HALF_EXTENT: i32 = 24;
const WALK_SPEED: f64 = 0.12;
const WAYPOINT_RADIUS: f64 = 0.5;
const WAYPOINTS: [DVec3; 4] = [
    DVec3::new(-6.5, 0.0, -6.5),
    DVec3::new(6.5, 0.0, -6.5),
    DVec3::new(6.5, 0.0, 6.5),
    DVec3::new(-6.5, 0.0, 6.5),
];
const TELEPORT_TICK: u64 = 200;
const TELEPORT_TARGET: DVec3 = DVec3::new(20.5, 0.0, 20.5);
const TIE_UP_TICK: u64 = 260;
const TIE_UP_POST: IVec3 = IVec3::new(0, 0, 0);
const UNTIE_TICK: u64 = 420;
const RAFT_SHOVE_INTERVAL: u64 = 100;

#[derive(Debug, Error)]
pub(crate) enum ScenarioError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Level(#[from] LevelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {kind}")]
    Spawn { kind: &'static str },
}

pub(crate) struct Scenario {
    sim: Simulation,
    walker: EntityId,
    pet: EntityId,
    raft: EntityId,
    next_waypoint: usize,
    ticks: u64,
}

impl Scenario {
    pub(crate) fn build(config: KernelConfig) -> Result<Self, ScenarioError> {
        let level = build_level()?;
        let mut sim = Simulation::new(
            config,
            SimulationRole::Server,
            level,
            Arc::new(EntityIdAllocator::default()),
        )?;

        let walker = spawn(&mut sim, walker_profile(), DVec3::new(-6.5, 0.0, -4.5), "walker")?;
        let pet = spawn(&mut sim, pet_profile(), DVec3::new(-7.5, 0.0, -3.5), "pet")?;
        let raft = spawn(&mut sim, raft_profile(), DVec3::new(-2.5, 0.0, 2.5), "raft")?;
        sim.apply_pending();
        sim.set_leashed_to(pet, walker);

        info!(
            entity_count = sim.entity_count(),
            walker = %walker,
            pet = %pet,
            "scenario_loaded"
        );
        Ok(Self {
            sim,
            walker,
            pet,
            raft,
            next_waypoint: 0,
            ticks: 0,
        })
    }

    pub(crate) fn step(&mut self) -> Result<(), TickError> {
        self.script();
        self.steer_walker();
        self.sim.tick()?;
        self.ticks += 1;
        for event in self.sim.drain_events() {
            log_event(&event);
        }
        Ok(())
    }

    pub(crate) fn counters(&self) -> TickCounters {
        self.sim.counters()
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.sim.entity_count()
    }

    pub(crate) fn log_summary(&self) {
        let counters = self.sim.counters();
        let pet = self.sim.entity(self.pet);
        info!(
            ticks = self.ticks,
            entity_count = self.sim.entity_count(),
            blocks_visited = counters.blocks_visited,
            block_contacts = counters.block_contacts,
            leash_snaps = counters.leash_snaps,
            removals = counters.removals,
            pet_leashed = pet.is_some_and(|pet| pet.is_leashed()),
            "sandbox_finished"
        );
    }

    fn script(&mut self) {
        let tick = self.ticks + 1;
        if tick == TELEPORT_TICK {
            if let Some(walker) = self.sim.entity_mut(self.walker) {
                walker.set_position(TELEPORT_TARGET);
                info!(walker = %self.walker, "walker_teleported");
            }
        }
        if tick == TIE_UP_TICK && !self.pet_leashed() {
            if let Some(knot) = self.sim.leash_to_anchor(self.pet, TIE_UP_POST) {
                info!(pet = %self.pet, knot = %knot, "pet_tied_up");
            }
        }
        if tick == UNTIE_TICK && self.sim.drop_leash(self.pet) {
            info!(pet = %self.pet, "pet_untied");
        }
        if tick % RAFT_SHOVE_INTERVAL == 0 {
            let moved = self
                .sim
                .move_entity(self.raft, MoverKind::Piston, DVec3::new(0.75, 0.0, 0.0));
            debug!(raft = %self.raft, ?moved, "raft_shoved");
        }
    }

    fn steer_walker(&mut self) {
        let Some(walker) = self.sim.entity_mut(self.walker) else {
            return;
        };
        let position = walker.position();
        let mut target = WAYPOINTS[self.next_waypoint];
        let offset = DVec3::new(target.x - position.x, 0.0, target.z - position.z);
        if offset.length() < WAYPOINT_RADIUS {
            self.next_waypoint = (self.next_waypoint + 1) % WAYPOINTS.len();
            target = WAYPOINTS[self.next_waypoint];
        }
        let heading = DVec3::new(target.x - position.x, 0.0, target.z - position.z).normalize_or_zero();
        let velocity = walker.velocity();
        walker.set_velocity(DVec3::new(
            heading.x * WALK_SPEED,
            velocity.y,
            heading.z * WALK_SPEED,
        ));
    }

    fn pet_leashed(&self) -> bool {
        self.sim.entity(self.pet).is_some_and(|pet| pet.is_leashed())
    }
}

fn spawn(
    sim: &mut Simulation,
    profile: EntityProfile,
    position: DVec3,
    kind: &'static str,
) -> Result<EntityId, ScenarioError> {
    sim.spawn(Arc::new(profile), position)
        .ok_or(ScenarioError::Spawn { kind })
}

fn walker_profile() -> EntityProfile {
    EntityProfile::new("walker", EntityDimensions::new(0.6, 1.8))
}

fn pet_profile() -> EntityProfile {
    EntityProfile::new("pet", EntityDimensions::new(0.9, 1.4)).with_leash(LeashProfile {
        quad: false,
        snap_distance: None,
        elastic_distance: None,
        hooks: Arc::new(DefaultLeashHooks),
    })
}

fn raft_profile() -> EntityProfile {
    EntityProfile::new("raft", EntityDimensions::new(1.375, 0.5625)).with_physics(PhysicsProfile {
        pushable: false,
        solid_collider: true,
        ..PhysicsProfile::default()
    })
}

fn build_level() -> Result<GridLevel, ScenarioError> {
    let mut registry = BlockRegistry::default();
    let stone = BlockState::of(registry.register(BlockDef::solid("stone"))?);
    let slab = BlockState::of(registry.register(
        BlockDef::solid("stone_slab")
            .with_collision(Shape::cell_box([0.0, 0.0, 0.0], [16.0, 8.0, 16.0]))
            .with_inside_shape(Shape::cell_box([0.0, 0.0, 0.0], [16.0, 8.0, 16.0])),
    )?);
    let slime = BlockState::of(registry.register(
        BlockDef::solid("slime_block")
            .with_friction(0.8)
            .with_behavior(Arc::new(SlimeBlock)),
    )?);
    let magma = BlockState::of(
        registry.register(BlockDef::solid("magma_block").with_behavior(Arc::new(MagmaBlock)))?,
    );
    let cobweb = BlockState::of(
        registry.register(BlockDef::passable("cobweb").with_behavior(Arc::new(Cobweb::default())))?,
    );
    let powder_snow = BlockState::of(registry.register(
        BlockDef::passable("powder_snow").with_behavior(Arc::new(EffectBlock {
            effect: InsideBlockEffect::Freeze,
        })),
    )?);
    let fire = BlockState::of(
        registry.register(BlockDef::passable("fire").with_behavior(Arc::new(FireBlock)))?,
    );
    registry.set_fluid_behavior(FluidKind::Water, Arc::new(WaterFluid));
    registry.set_fluid_behavior(FluidKind::Lava, Arc::new(LavaFluid));

    let mut level = GridLevel::new(registry);
    level.fill(
        IVec3::new(-YARD_HALF_EXTENT, -1, -YARD_HALF_EXTENT),
        IVec3::new(YARD_HALF_EXTENT, -1, YARD_HALF_EXTENT),
        stone,
    )?;
    level.fill_fluid(
        IVec3::new(2, 0, -YARD_HALF_EXTENT),
        IVec3::new(3, 0, YARD_HALF_EXTENT),
        FluidState::flowing(FluidKind::Water, 7, DVec3::Z),
    )?;
    level.fill(IVec3::new(-8, 0, 0), IVec3::new(-6, 0, 1), slab)?;
    level.fill(IVec3::new(-1, -1, -8), IVec3::new(1, -1, -6), slime)?;
    level.fill(IVec3::new(-8, -1, 5), IVec3::new(-6, -1, 7), magma)?;
    level.set_block(IVec3::new(6, 0, -1), cobweb);
    level.set_block(IVec3::new(6, 0, 0), cobweb);
    level.set_block(IVec3::new(-1, 0, 6), powder_snow);
    level.set_block(IVec3::new(5, 0, 6), fire);
    Ok(level)
}

fn log_event(event: &KernelEvent) {
    match event {
        KernelEvent::Sound {
            sound: SoundKind::LeashBreak,
            position,
        } => info!(?position, "leash_broke"),
        KernelEvent::EntityRemoved { entity, reason } => {
            info!(entity = %entity, ?reason, "entity_removed_event")
        }
        other => debug!(event = ?other, "kernel_event"),
    }
}

#[cfg(test)]
mod tests {
    use motion_kernel::BlockGetter;

    use super::*;

    fn scenario() -> Scenario {
        Scenario::build(KernelConfig::default()).expect("scenario")
    }

    #[test]
    fn scenario_starts_with_leashed_pet() {
        let scenario = scenario();
        assert_eq!(scenario.entity_count(), 3);
        assert_eq!(
            scenario
                .sim
                .entity(scenario.pet)
                .and_then(|pet| pet.leash().holder()),
            Some(scenario.walker)
        );
    }

    #[test]
    fn level_layout_places_hazards() {
        let level = build_level().expect("level");
        let registry = level.registry();
        assert_eq!(
            level.block_state(IVec3::new(6, 0, 0)).block,
            registry.id_of("cobweb").expect("cobweb")
        );
        assert_eq!(
            level.block_state(IVec3::new(YARD_HALF_EXTENT, -1, -YARD_HALF_EXTENT)).block,
            registry.id_of("stone").expect("stone")
        );
        assert!(level.fluid_state(IVec3::new(2, 0, 0)).is(FluidKind::Water));
        assert_eq!(
            level.block_state(IVec3::new(5, 0, 6)).block,
            registry.id_of("fire").expect("fire")
        );
        let slab = registry.def(level.block_state(IVec3::new(-7, 0, 0)).block);
        assert_eq!(slab.name, "stone_slab");
        assert!(!slab.collision.is_full_block());
    }

    #[test]
    fn teleporting_walker_snaps_the_leash() {
        let mut scenario = scenario();
        for _ in 0..TELEPORT_TICK {
            scenario.step().expect("step");
        }

        assert!(scenario.counters().leash_snaps >= 1);
        assert!(!scenario.pet_leashed());
        assert!(scenario.sim.entity(scenario.walker).is_some());
    }

    #[test]
    fn tied_pet_is_released_and_knot_discarded() {
        let mut scenario = scenario();
        for _ in 0..TIE_UP_TICK {
            scenario.step().expect("step");
        }
        assert!(scenario.pet_leashed());
        assert_eq!(scenario.entity_count(), 4);

        for _ in TIE_UP_TICK..UNTIE_TICK {
            scenario.step().expect("step");
        }
        assert!(!scenario.pet_leashed());
        assert_eq!(scenario.entity_count(), 3);
    }
}
