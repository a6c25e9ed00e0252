//! Read-only level access used by the kernel: block and fluid lookup,
//! static block collision and the dynamic collider query.

pub mod behaviors;
mod block;
mod border;
mod grid;

pub use block::{
    BlockBehavior, BlockCallbackError, BlockDef, BlockId, BlockRegistry, BlockState, FluidBehavior,
    FluidKind, FluidState, InertBlock, InertFluid, RegistryError, SOURCE_AMOUNT,
};
pub use border::WorldBorder;
pub use grid::{GridLevel, LevelError};

use crate::entity::EntityId;
use crate::math::{block_origin, cells_between, Aabb, BlockPos};
use crate::shape::{Shape, COLLISION_EPSILON};

pub trait BlockGetter {
    fn block_state(&self, pos: BlockPos) -> BlockState;

    fn fluid_state(&self, pos: BlockPos) -> FluidState;

    fn registry(&self) -> &BlockRegistry;

    fn is_loaded(&self, _pos: BlockPos) -> bool {
        true
    }

    fn block_def(&self, state: BlockState) -> &BlockDef {
        self.registry().def(state.block)
    }
}

pub trait LevelReader: BlockGetter {
    fn world_border(&self) -> Option<&WorldBorder> {
        None
    }

    fn min_y(&self) -> i32 {
        -64
    }
}

pub trait CollisionGetter: LevelReader {
    /// Static block shapes, in world space, intersecting `query`.
    fn block_collisions(&self, query: &Aabb, _excluding: Option<EntityId>) -> Vec<Shape> {
        let (min, max) = query.inflate_uniform(COLLISION_EPSILON).block_range();
        let mut shapes = Vec::new();
        for pos in cells_between(min, max) {
            if !self.is_loaded(pos) {
                continue;
            }
            let def = self.block_def(self.block_state(pos));
            if def.collision.is_empty() {
                continue;
            }
            let shape = def.collision.translate(block_origin(pos));
            if shape.intersects(query) {
                shapes.push(shape);
            }
        }
        shapes
    }

    /// Solid entities (boats, shulker-like colliders) intersecting `query`.
    fn entity_collisions(&self, query: &Aabb, excluding: Option<EntityId>) -> Vec<Shape>;
}
