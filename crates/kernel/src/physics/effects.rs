use std::collections::BTreeSet;
use std::fmt;

use crate::entity::{DamageSource, Entity};

const FIRE_TICKS: i32 = 160;
const LAVA_FIRE_TICKS: i32 = 300;

/// Typed effects a block can request; applied at most once per traversal
/// step, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InsideBlockEffect {
    Freeze,
    ClearFreeze,
    Ignite,
    LavaIgnite,
    Extinguish,
}

impl InsideBlockEffect {
    fn apply_to(self, entity: &mut Entity) {
        match self {
            Self::Freeze => entity.freeze_step(),
            Self::ClearFreeze => entity.clear_freeze(),
            Self::Ignite => {
                entity.ignite_for_ticks(FIRE_TICKS);
                entity.hurt(DamageSource::Fire);
            }
            Self::LavaIgnite => {
                entity.ignite_for_ticks(LAVA_FIRE_TICKS);
                entity.hurt(DamageSource::Lava);
            }
            Self::Extinguish => entity.extinguish(),
        }
    }
}

type EntityAction = Box<dyn FnOnce(&mut Entity) + Send>;

#[derive(Default)]
struct Step {
    effects: BTreeSet<InsideBlockEffect>,
    before: Vec<EntityAction>,
    after: Vec<EntityAction>,
}

impl Step {
    fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.before.is_empty() && self.after.is_empty()
    }
}

/// Collects side effects of block contacts during one tick's traversal and
/// applies them afterwards, step by step.
#[derive(Default)]
pub struct EffectCollector {
    finished: Vec<Step>,
    current: Step,
    current_index: Option<usize>,
}

impl fmt::Debug for EffectCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectCollector")
            .field("finished_steps", &self.finished.len())
            .field("current_effects", &self.current.effects)
            .field("current_index", &self.current_index)
            .finish()
    }
}

impl EffectCollector {
    pub fn advance_step(&mut self, index: usize) {
        if self.current_index != Some(index) {
            self.flush();
            self.current_index = Some(index);
        }
    }

    pub fn apply(&mut self, effect: InsideBlockEffect) {
        self.current.effects.insert(effect);
    }

    pub fn run_before(&mut self, action: impl FnOnce(&mut Entity) + Send + 'static) {
        self.current.before.push(Box::new(action));
    }

    pub fn run_after(&mut self, action: impl FnOnce(&mut Entity) + Send + 'static) {
        self.current.after.push(Box::new(action));
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.finished.is_empty()
    }

    pub fn clear(&mut self) {
        self.finished.clear();
        self.current = Step::default();
        self.current_index = None;
    }

    pub fn apply_and_clear(&mut self, entity: &mut Entity) {
        self.flush();
        self.current_index = None;
        for step in self.finished.drain(..) {
            if entity.is_removed() {
                break;
            }
            for action in step.before {
                action(entity);
            }
            for effect in step.effects {
                effect.apply_to(entity);
            }
            for action in step.after {
                action(entity);
            }
        }
        self.finished.clear();
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.finished.push(std::mem::take(&mut self.current));
        }
    }
}
