use glam::DVec3;

use crate::math::{Aabb, Axis};

/// Motions and gaps below this magnitude are treated as zero.
pub const COLLISION_EPSILON: f64 = 1.0e-7;

/// Immutable collision geometry made of axis-aligned boxes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shape {
    boxes: Vec<Aabb>,
}

impl Shape {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full_block() -> Self {
        Self::from_box(Aabb::unit_cube())
    }

    pub fn from_box(aabb: Aabb) -> Self {
        Self { boxes: vec![aabb] }
    }

    pub fn from_boxes(boxes: Vec<Aabb>) -> Self {
        Self { boxes }
    }

    /// Box inside a unit cell given in sixteenths, the way block models are authored.
    pub fn cell_box(min: [f64; 3], max: [f64; 3]) -> Self {
        Self::from_box(Aabb::new(
            DVec3::from_array(min) / 16.0,
            DVec3::from_array(max) / 16.0,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn boxes(&self) -> &[Aabb] {
        &self.boxes
    }

    pub fn translate(&self, offset: DVec3) -> Self {
        Self {
            boxes: self.boxes.iter().map(|b| b.translate(offset)).collect(),
        }
    }

    pub fn is_full_block(&self) -> bool {
        match self.boxes.as_slice() {
            [only] => {
                (only.min - DVec3::ZERO).abs().max_element() < COLLISION_EPSILON
                    && (only.max - DVec3::ONE).abs().max_element() < COLLISION_EPSILON
            }
            _ => false,
        }
    }

    pub fn intersects(&self, aabb: &Aabb) -> bool {
        self.boxes.iter().any(|b| b.intersects(aabb))
    }

    /// Sorted, de-duplicated box faces along an axis.
    pub fn coords(&self, axis: Axis) -> Vec<f64> {
        let mut coords: Vec<f64> = self
            .boxes
            .iter()
            .flat_map(|b| [b.min_on(axis), b.max_on(axis)])
            .collect();
        coords.sort_by(f64::total_cmp);
        coords.dedup_by(|a, b| (*a - *b).abs() < COLLISION_EPSILON);
        coords
    }

    /// Clamps a one-axis motion of `moving` so it stops at the first face of
    /// this shape in its path.
    pub fn collide(&self, axis: Axis, moving: &Aabb, desired: f64) -> f64 {
        let mut allowed = desired;
        for obstacle in &self.boxes {
            if allowed.abs() < COLLISION_EPSILON {
                return 0.0;
            }
            allowed = clip_against(axis, obstacle, moving, allowed);
        }
        allowed
    }
}

fn clip_against(axis: Axis, obstacle: &Aabb, moving: &Aabb, desired: f64) -> f64 {
    if !moving.overlaps_across(obstacle, axis, COLLISION_EPSILON) {
        return desired;
    }
    if desired > 0.0 {
        let gap = obstacle.min_on(axis) - moving.max_on(axis);
        if gap >= -COLLISION_EPSILON && gap < desired {
            return gap.max(0.0);
        }
    } else if desired < 0.0 {
        let gap = obstacle.max_on(axis) - moving.min_on(axis);
        if gap <= COLLISION_EPSILON && gap > desired {
            return gap.min(0.0);
        }
    }
    desired
}
