use std::collections::HashMap;

use thiserror::Error;

use crate::entity::EntityId;
use crate::math::{cells_between, Aabb, BlockPos};
use crate::shape::Shape;

use super::{
    BlockGetter, BlockRegistry, BlockState, CollisionGetter, FluidState, LevelReader, WorldBorder,
};

const MAX_FILL_CELLS: i64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LevelError {
    #[error("fill region is inverted: {min} .. {max}")]
    InvertedRegion { min: BlockPos, max: BlockPos },
    #[error("fill region of {cells} cells exceeds limit of {limit}")]
    RegionTooLarge { cells: i64, limit: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Cell {
    block: BlockState,
    fluid: FluidState,
}

/// Sparse voxel level: unset cells are air with no fluid.
#[derive(Debug, Clone)]
pub struct GridLevel {
    registry: BlockRegistry,
    cells: HashMap<BlockPos, Cell>,
    loaded: Option<(BlockPos, BlockPos)>,
    border: Option<WorldBorder>,
    min_y: i32,
}

impl GridLevel {
    pub fn new(registry: BlockRegistry) -> Self {
        Self {
            registry,
            cells: HashMap::new(),
            loaded: None,
            border: None,
            min_y: -64,
        }
    }

    pub fn registry_mut(&mut self) -> &mut BlockRegistry {
        &mut self.registry
    }

    pub fn set_min_y(&mut self, min_y: i32) {
        self.min_y = min_y;
    }

    pub fn set_border(&mut self, border: Option<WorldBorder>) {
        self.border = border;
    }

    /// Restricts loaded cells to an inclusive region; `None` loads everything.
    pub fn set_loaded_region(&mut self, region: Option<(BlockPos, BlockPos)>) {
        self.loaded = region;
    }

    pub fn set_block(&mut self, pos: BlockPos, block: BlockState) {
        let cell = self.cells.entry(pos).or_default();
        cell.block = block;
        self.prune(pos);
    }

    pub fn set_fluid(&mut self, pos: BlockPos, fluid: FluidState) {
        let cell = self.cells.entry(pos).or_default();
        cell.fluid = fluid;
        self.prune(pos);
    }

    pub fn fill(&mut self, min: BlockPos, max: BlockPos, block: BlockState) -> Result<usize, LevelError> {
        let count = checked_region(min, max)?;
        for pos in cells_between(min, max) {
            self.set_block(pos, block);
        }
        Ok(count)
    }

    pub fn fill_fluid(&mut self, min: BlockPos, max: BlockPos, fluid: FluidState) -> Result<usize, LevelError> {
        let count = checked_region(min, max)?;
        for pos in cells_between(min, max) {
            self.set_fluid(pos, fluid);
        }
        Ok(count)
    }

    pub fn non_empty_cells(&self) -> usize {
        self.cells.len()
    }

    fn prune(&mut self, pos: BlockPos) {
        if self.cells.get(&pos).is_some_and(|cell| *cell == Cell::default()) {
            self.cells.remove(&pos);
        }
    }
}

fn checked_region(min: BlockPos, max: BlockPos) -> Result<usize, LevelError> {
    if min.cmpgt(max).any() {
        return Err(LevelError::InvertedRegion { min, max });
    }
    let span = (max - min).as_i64vec3() + glam::I64Vec3::ONE;
    let cells = span.x.saturating_mul(span.y).saturating_mul(span.z);
    if cells > MAX_FILL_CELLS {
        return Err(LevelError::RegionTooLarge {
            cells,
            limit: MAX_FILL_CELLS,
        });
    }
    Ok(cells as usize)
}

impl BlockGetter for GridLevel {
    fn block_state(&self, pos: BlockPos) -> BlockState {
        self.cells.get(&pos).map(|cell| cell.block).unwrap_or_default()
    }

    fn fluid_state(&self, pos: BlockPos) -> FluidState {
        self.cells.get(&pos).map(|cell| cell.fluid).unwrap_or_default()
    }

    fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    fn is_loaded(&self, pos: BlockPos) -> bool {
        match self.loaded {
            Some((min, max)) => pos.cmpge(min).all() && pos.cmple(max).all(),
            None => true,
        }
    }
}

impl LevelReader for GridLevel {
    fn world_border(&self) -> Option<&WorldBorder> {
        self.border.as_ref()
    }

    fn min_y(&self) -> i32 {
        self.min_y
    }
}

impl CollisionGetter for GridLevel {
    fn entity_collisions(&self, _query: &Aabb, _excluding: Option<EntityId>) -> Vec<Shape> {
        Vec::new()
    }
}
