use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glam::DVec3;
use thiserror::Error;

use crate::entity::{DamageSource, Entity};
use crate::math::{block_origin, Aabb, BlockPos};
use crate::physics::effects::EffectCollector;
use crate::shape::Shape;

use super::BlockGetter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockState {
    pub block: BlockId,
}

impl BlockState {
    pub const AIR: Self = Self {
        block: BlockId::AIR,
    };

    pub const fn of(block: BlockId) -> Self {
        Self { block }
    }

    pub fn is_air(self) -> bool {
        self.block == BlockId::AIR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FluidKind {
    Water,
    Lava,
}

pub const SOURCE_AMOUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FluidState {
    kind: Option<FluidKind>,
    amount: u8,
    flow: DVec3,
}

impl FluidState {
    pub const EMPTY: Self = Self {
        kind: None,
        amount: 0,
        flow: DVec3::ZERO,
    };

    pub fn source(kind: FluidKind) -> Self {
        Self {
            kind: Some(kind),
            amount: SOURCE_AMOUNT,
            flow: DVec3::ZERO,
        }
    }

    /// `amount` is clamped to `1..=8`; a non-finite flow is dropped.
    pub fn flowing(kind: FluidKind, amount: u8, flow: DVec3) -> Self {
        Self {
            kind: Some(kind),
            amount: amount.clamp(1, SOURCE_AMOUNT),
            flow: if flow.is_finite() { flow } else { DVec3::ZERO },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
    }

    pub fn kind(&self) -> Option<FluidKind> {
        self.kind
    }

    pub fn is(&self, kind: FluidKind) -> bool {
        self.kind == Some(kind)
    }

    pub fn amount(&self) -> u8 {
        self.amount
    }

    pub fn flow(&self) -> DVec3 {
        self.flow
    }

    pub fn own_height(&self) -> f64 {
        f64::from(self.amount) / 9.0
    }

    /// Surface height inside the cell; a column of the same fluid is full height.
    pub fn height<B: BlockGetter + ?Sized>(&self, level: &B, pos: BlockPos) -> f64 {
        let Some(kind) = self.kind else {
            return 0.0;
        };
        if level.fluid_state(pos + BlockPos::Y).is(kind) {
            1.0
        } else {
            self.own_height()
        }
    }

    pub fn aabb<B: BlockGetter + ?Sized>(&self, level: &B, pos: BlockPos) -> Aabb {
        let origin = block_origin(pos);
        Aabb::new(
            origin,
            origin + DVec3::new(1.0, self.height(level, pos), 1.0),
        )
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct BlockCallbackError {
    message: String,
}

impl BlockCallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-block reactions to entities. Every method has an inert default.
pub trait BlockBehavior: fmt::Debug + Send + Sync {
    fn on_entity_entered_block(
        &self,
        _pos: BlockPos,
        _state: BlockState,
        _entity: &mut Entity,
        _effects: &mut EffectCollector,
        _precise_contact: bool,
    ) -> Result<(), BlockCallbackError> {
        Ok(())
    }

    fn on_step_on(&self, _pos: BlockPos, _state: BlockState, _entity: &mut Entity) {}

    fn on_fall_on(&self, _pos: BlockPos, _state: BlockState, entity: &mut Entity, fall_distance: f64) {
        entity.cause_fall_damage(fall_distance, 1.0, DamageSource::Fall);
    }

    fn update_entity_movement_after_fall_on(&self, entity: &mut Entity) {
        let velocity = entity.velocity();
        entity.set_velocity(DVec3::new(velocity.x, 0.0, velocity.z));
    }
}

pub trait FluidBehavior: fmt::Debug + Send + Sync {
    fn on_entity_entered_fluid(
        &self,
        _pos: BlockPos,
        _fluid: FluidState,
        _entity: &mut Entity,
        _effects: &mut EffectCollector,
    ) -> Result<(), BlockCallbackError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InertBlock;

impl BlockBehavior for InertBlock {}

#[derive(Debug, Default)]
pub struct InertFluid;

impl FluidBehavior for InertFluid {}

#[derive(Debug, Clone)]
pub struct BlockDef {
    pub name: String,
    /// Collision geometry in cell-local coordinates.
    pub collision: Shape,
    /// Geometry that decides whether a traversed entity is "inside" the block.
    pub inside_shape: Shape,
    pub friction: f64,
    pub speed_factor: f64,
    pub behavior: Arc<dyn BlockBehavior>,
}

impl BlockDef {
    pub fn solid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collision: Shape::full_block(),
            inside_shape: Shape::full_block(),
            friction: 0.6,
            speed_factor: 1.0,
            behavior: Arc::new(InertBlock),
        }
    }

    pub fn passable(name: impl Into<String>) -> Self {
        Self {
            collision: Shape::empty(),
            ..Self::solid(name)
        }
    }

    pub fn with_collision(mut self, collision: Shape) -> Self {
        self.collision = collision;
        self
    }

    pub fn with_inside_shape(mut self, inside_shape: Shape) -> Self {
        self.inside_shape = inside_shape;
        self
    }

    pub fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    pub fn with_speed_factor(mut self, speed_factor: f64) -> Self {
        self.speed_factor = speed_factor;
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn BlockBehavior>) -> Self {
        self.behavior = behavior;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("block '{name}' is already registered")]
    DuplicateName { name: String },
    #[error("block registry is full ({capacity} entries)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone)]
pub struct BlockRegistry {
    defs: Vec<BlockDef>,
    by_name: HashMap<String, BlockId>,
    water: Arc<dyn FluidBehavior>,
    lava: Arc<dyn FluidBehavior>,
}

impl Default for BlockRegistry {
    fn default() -> Self {
        let air = BlockDef::passable("air").with_inside_shape(Shape::empty());
        let mut by_name = HashMap::new();
        by_name.insert(air.name.clone(), BlockId::AIR);
        Self {
            defs: vec![air],
            by_name,
            water: Arc::new(InertFluid),
            lava: Arc::new(InertFluid),
        }
    }
}

impl BlockRegistry {
    pub fn register(&mut self, def: BlockDef) -> Result<BlockId, RegistryError> {
        if self.by_name.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName { name: def.name });
        }
        let raw = u16::try_from(self.defs.len()).map_err(|_| RegistryError::Full {
            capacity: usize::from(u16::MAX),
        })?;
        let id = BlockId(raw);
        self.by_name.insert(def.name.clone(), id);
        self.defs.push(def);
        Ok(id)
    }

    pub fn set_fluid_behavior(&mut self, kind: FluidKind, behavior: Arc<dyn FluidBehavior>) {
        match kind {
            FluidKind::Water => self.water = behavior,
            FluidKind::Lava => self.lava = behavior,
        }
    }

    /// Unknown ids resolve to air.
    pub fn def(&self, id: BlockId) -> &BlockDef {
        self.defs
            .get(usize::from(id.0))
            .unwrap_or(&self.defs[usize::from(BlockId::AIR.0)])
    }

    pub fn id_of(&self, name: &str) -> Option<BlockId> {
        self.by_name.get(name).copied()
    }

    pub fn fluid_behavior(&self, kind: FluidKind) -> &dyn FluidBehavior {
        match kind {
            FluidKind::Water => self.water.as_ref(),
            FluidKind::Lava => self.lava.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_with_air_and_rejects_duplicates() {
        let mut registry = BlockRegistry::default();
        assert_eq!(registry.id_of("air"), Some(BlockId::AIR));

        let stone = registry
            .register(BlockDef::solid("stone"))
            .expect("stone registers");
        assert_eq!(stone, BlockId(1));
        assert!(registry.def(stone).collision.is_full_block());

        let err = registry
            .register(BlockDef::solid("stone"))
            .expect_err("duplicate must fail");
        assert_eq!(
            err,
            RegistryError::DuplicateName {
                name: "stone".to_string()
            }
        );
    }

    #[test]
    fn unknown_block_resolves_to_air() {
        let registry = BlockRegistry::default();
        assert_eq!(registry.def(BlockId(42)).name, "air");
    }

    #[test]
    fn flowing_fluid_clamps_amount() {
        let fluid = FluidState::flowing(FluidKind::Water, 30, DVec3::new(f64::NAN, 0.0, 0.0));
        assert_eq!(fluid.amount(), SOURCE_AMOUNT);
        assert_eq!(fluid.flow(), DVec3::ZERO);
        assert!((FluidState::source(FluidKind::Lava).own_height() - 8.0 / 9.0).abs() < 1e-12);
    }
}
