//! Entity movement, collision and per-tick effect traversal for voxel levels.

pub mod collision;
pub mod config;
pub mod entity;
pub mod events;
pub mod leash;
pub mod math;
pub mod metrics;
pub mod physics;
pub mod recorder;
pub mod shape;
pub mod simulation;
pub mod world;

pub use collision::{CollisionResolver, PistonLimiter};
pub use config::{load_config_file, parse_config_json, ConfigError, KernelConfig};
pub use entity::{
    DamageHooks, DamageSource, Entity, EntityDimensions, EntityId, EntityIdAllocator,
    EntityProfile, EntityUuid, FluidProfile, LeashProfile, MoverKind, PhysicsProfile, Pose,
    PositionState, RemovalReason, SimulationRole, TickAuthority,
};
pub use events::{DroppedItem, EventBus, EventSink, GameEventKind, KernelEvent, ParticleKind, SoundKind};
pub use leash::{
    DefaultLeashHooks, LeashAttachment, LeashConstraintSolver, LeashHooks, LeashOutcome,
    LeashRelease, LeashState, PendingHolder,
};
pub use math::{Aabb, Axis, BlockPos};
pub use metrics::{LoopMetricsSnapshot, MetricsAccumulator, MetricsHandle, TickCounters};
pub use physics::{
    BlockEffectFailure, BlockTraversalEngine, EffectCollector, FluidInteractionModel,
    InsideBlockEffect, MoveContext,
};
pub use recorder::{Movement, MovementRecorder};
pub use shape::Shape;
pub use simulation::{Simulation, TickError};
pub use world::{
    BlockBehavior, BlockCallbackError, BlockDef, BlockGetter, BlockRegistry, BlockState,
    CollisionGetter, FluidBehavior, FluidKind, FluidState, GridLevel, LevelReader, WorldBorder,
};
