//! Stock block and fluid reactions.

use glam::DVec3;

use crate::entity::{DamageSource, Entity};
use crate::math::BlockPos;
use crate::physics::effects::{EffectCollector, InsideBlockEffect};

use super::{BlockBehavior, BlockCallbackError, BlockState, FluidBehavior, FluidState};

/// Slows anything inside it for the next move.
#[derive(Debug, Clone, Copy)]
pub struct Cobweb {
    pub multiplier: DVec3,
}

impl Default for Cobweb {
    fn default() -> Self {
        Self {
            multiplier: DVec3::new(0.25, 0.05, 0.25),
        }
    }
}

impl BlockBehavior for Cobweb {
    fn on_entity_entered_block(
        &self,
        _pos: BlockPos,
        _state: BlockState,
        entity: &mut Entity,
        _effects: &mut EffectCollector,
        _precise_contact: bool,
    ) -> Result<(), BlockCallbackError> {
        entity.make_stuck_in_block(self.multiplier);
        Ok(())
    }
}

/// Cancels fall damage and bounces entities that are not crouching.
#[derive(Debug, Default)]
pub struct SlimeBlock;

impl BlockBehavior for SlimeBlock {
    fn on_step_on(&self, _pos: BlockPos, _state: BlockState, entity: &mut Entity) {
        let velocity = entity.velocity();
        if velocity.y.abs() < 0.1 && !entity.is_crouching() {
            let damping = 0.4 + velocity.y.abs() * 0.2;
            entity.set_velocity(DVec3::new(velocity.x * damping, velocity.y, velocity.z * damping));
        }
    }

    fn on_fall_on(&self, _pos: BlockPos, _state: BlockState, entity: &mut Entity, fall_distance: f64) {
        let multiplier = if entity.is_crouching() { 1.0 } else { 0.0 };
        entity.cause_fall_damage(fall_distance, multiplier, DamageSource::Fall);
    }

    fn update_entity_movement_after_fall_on(&self, entity: &mut Entity) {
        let velocity = entity.velocity();
        if entity.is_crouching() || velocity.y >= 0.0 {
            entity.set_velocity(DVec3::new(velocity.x, 0.0, velocity.z));
        } else {
            entity.set_velocity(DVec3::new(velocity.x, -velocity.y, velocity.z));
        }
    }
}

/// Hurts entities walking on it unless they crouch.
#[derive(Debug, Default)]
pub struct MagmaBlock;

impl BlockBehavior for MagmaBlock {
    fn on_step_on(&self, _pos: BlockPos, _state: BlockState, entity: &mut Entity) {
        if !entity.is_crouching() {
            entity.hurt(DamageSource::HotFloor);
        }
    }
}

/// Thaws, then sets alight, anything standing in the flames.
#[derive(Debug, Default)]
pub struct FireBlock;

impl BlockBehavior for FireBlock {
    fn on_entity_entered_block(
        &self,
        _pos: BlockPos,
        _state: BlockState,
        _entity: &mut Entity,
        effects: &mut EffectCollector,
        _precise_contact: bool,
    ) -> Result<(), BlockCallbackError> {
        effects.apply(InsideBlockEffect::ClearFreeze);
        effects.apply(InsideBlockEffect::Ignite);
        Ok(())
    }
}

/// Emits a fixed inside-block effect on contact (powder snow).
#[derive(Debug, Clone, Copy)]
pub struct EffectBlock {
    pub effect: InsideBlockEffect,
}

impl BlockBehavior for EffectBlock {
    fn on_entity_entered_block(
        &self,
        _pos: BlockPos,
        _state: BlockState,
        _entity: &mut Entity,
        effects: &mut EffectCollector,
        _precise_contact: bool,
    ) -> Result<(), BlockCallbackError> {
        effects.apply(self.effect);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct WaterFluid;

impl FluidBehavior for WaterFluid {
    fn on_entity_entered_fluid(
        &self,
        _pos: BlockPos,
        _fluid: FluidState,
        _entity: &mut Entity,
        effects: &mut EffectCollector,
    ) -> Result<(), BlockCallbackError> {
        effects.apply(InsideBlockEffect::Extinguish);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LavaFluid;

impl FluidBehavior for LavaFluid {
    fn on_entity_entered_fluid(
        &self,
        _pos: BlockPos,
        _fluid: FluidState,
        _entity: &mut Entity,
        effects: &mut EffectCollector,
    ) -> Result<(), BlockCallbackError> {
        effects.apply(InsideBlockEffect::LavaIgnite);
        Ok(())
    }
}
