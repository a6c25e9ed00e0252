pub mod effects;
pub mod fluid;
pub mod movement;
pub mod traversal;

pub use effects::{EffectCollector, InsideBlockEffect};
pub use fluid::{FluidInteractionModel, FluidSample};
pub use movement::MoveContext;
pub use traversal::{
    for_each_block_intersected_between, walk_segment, BlockEffectFailure, BlockTraversalEngine,
    TraversalReport,
};
