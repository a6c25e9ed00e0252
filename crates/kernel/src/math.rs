use glam::{DVec3, IVec3};

/// Integer voxel coordinate of a block cell.
pub type BlockPos = IVec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn component(self, v: DVec3) -> f64 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }

    pub fn with(self, v: DVec3, value: f64) -> DVec3 {
        match self {
            Axis::X => DVec3::new(value, v.y, v.z),
            Axis::Y => DVec3::new(v.x, value, v.z),
            Axis::Z => DVec3::new(v.x, v.y, value),
        }
    }

    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    fn others(self) -> [Axis; 2] {
        match self {
            Axis::X => [Axis::Y, Axis::Z],
            Axis::Y => [Axis::X, Axis::Z],
            Axis::Z => [Axis::X, Axis::Y],
        }
    }
}

/// Order in which a movement is resolved one axis at a time: vertical first,
/// then the horizontal axis with the larger magnitude.
pub fn axis_step_order(movement: DVec3) -> [Axis; 3] {
    if movement.x.abs() < movement.z.abs() {
        [Axis::Y, Axis::Z, Axis::X]
    } else {
        [Axis::Y, Axis::X, Axis::Z]
    }
}

pub fn horizontal_length_squared(v: DVec3) -> f64 {
    v.x * v.x + v.z * v.z
}

pub fn block_origin(pos: BlockPos) -> DVec3 {
    pos.as_dvec3()
}

pub fn block_containing(point: DVec3) -> BlockPos {
    IVec3::new(
        point.x.floor() as i32,
        point.y.floor() as i32,
        point.z.floor() as i32,
    )
}

/// Every cell in the inclusive range `min..=max`, x-major.
pub fn cells_between(min: BlockPos, max: BlockPos) -> impl Iterator<Item = BlockPos> {
    (min.x..=max.x).flat_map(move |x| {
        (min.y..=max.y).flat_map(move |y| (min.z..=max.z).map(move |z| IVec3::new(x, y, z)))
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn unit_cube() -> Self {
        Self {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        }
    }

    pub fn of_block(pos: BlockPos) -> Self {
        let origin = block_origin(pos);
        Self {
            min: origin,
            max: origin + DVec3::ONE,
        }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn min_on(&self, axis: Axis) -> f64 {
        axis.component(self.min)
    }

    pub fn max_on(&self, axis: Axis) -> f64 {
        axis.component(self.max)
    }

    pub fn translate(&self, offset: DVec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Grows the box only on the sides the vector points to.
    pub fn expand_towards(&self, v: DVec3) -> Self {
        let mut min = self.min;
        let mut max = self.max;
        for axis in Axis::ALL {
            let d = axis.component(v);
            if d < 0.0 {
                min = axis.with(min, axis.component(min) + d);
            } else if d > 0.0 {
                max = axis.with(max, axis.component(max) + d);
            }
        }
        Self { min, max }
    }

    pub fn inflate(&self, amount: DVec3) -> Self {
        Self::new(self.min - amount, self.max + amount)
    }

    pub fn inflate_uniform(&self, amount: f64) -> Self {
        self.inflate(DVec3::splat(amount))
    }

    pub fn deflate(&self, amount: f64) -> Self {
        self.inflate_uniform(-amount)
    }

    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Strict overlap test; boxes that only share a face do not intersect.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    pub fn contains(&self, point: DVec3) -> bool {
        point.x >= self.min.x
            && point.x < self.max.x
            && point.y >= self.min.y
            && point.y < self.max.y
            && point.z >= self.min.z
            && point.z < self.max.z
    }

    /// True when the two boxes overlap on both axes other than `axis`,
    /// ignoring contact closer than `epsilon`.
    pub fn overlaps_across(&self, other: &Aabb, axis: Axis, epsilon: f64) -> bool {
        axis.others().into_iter().all(|other_axis| {
            self.min_on(other_axis) < other.max_on(other_axis) - epsilon
                && self.max_on(other_axis) > other.min_on(other_axis) + epsilon
        })
    }

    /// First point where the segment `from..to` enters the box (slab test).
    /// Returns `from` when the segment starts inside.
    pub fn clip(&self, from: DVec3, to: DVec3) -> Option<DVec3> {
        let delta = to - from;
        let mut t_enter = 0.0_f64;
        let mut t_exit = 1.0_f64;
        for axis in Axis::ALL {
            let origin = axis.component(from);
            let direction = axis.component(delta);
            let lo = self.min_on(axis);
            let hi = self.max_on(axis);
            if direction.abs() < 1.0e-12 {
                if origin < lo || origin > hi {
                    return None;
                }
                continue;
            }
            let inverse = 1.0 / direction;
            let mut t0 = (lo - origin) * inverse;
            let mut t1 = (hi - origin) * inverse;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_enter = t_enter.max(t0);
            t_exit = t_exit.min(t1);
            if t_enter > t_exit {
                return None;
            }
        }
        Some(from + delta * t_enter)
    }

    /// Minkowski test: does this box, swept along `motion`, touch any of `boxes`?
    pub fn collided_along_vector(&self, motion: DVec3, boxes: &[Aabb]) -> bool {
        let start = self.center();
        let end = start + motion;
        let half = self.size() * 0.5;
        boxes.iter().any(|obstacle| {
            let grown = obstacle.inflate(half);
            grown.contains(start) || grown.contains(end) || grown.clip(start, end).is_some()
        })
    }

    /// Inclusive block-cell range covered by the box.
    pub fn block_range(&self) -> (BlockPos, BlockPos) {
        (block_containing(self.min), block_containing(self.max))
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_order_puts_vertical_first_and_larger_horizontal_next() {
        assert_eq!(
            axis_step_order(DVec3::new(0.1, -2.0, 0.5)),
            [Axis::Y, Axis::Z, Axis::X]
        );
        assert_eq!(
            axis_step_order(DVec3::new(0.5, 0.0, 0.5)),
            [Axis::Y, Axis::X, Axis::Z]
        );
    }

    #[test]
    fn expand_towards_grows_only_in_motion_direction() {
        let aabb = Aabb::unit_cube().expand_towards(DVec3::new(-0.5, 2.0, 0.0));
        assert_eq!(aabb.min, DVec3::new(-0.5, 0.0, 0.0));
        assert_eq!(aabb.max, DVec3::new(1.0, 3.0, 1.0));
    }

    #[test]
    fn touching_faces_do_not_intersect() {
        let a = Aabb::unit_cube();
        let b = a.translate(DVec3::X);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&b.translate(DVec3::new(-0.01, 0.0, 0.0))));
    }

    #[test]
    fn clip_reports_entry_point() {
        let cell = Aabb::of_block(IVec3::new(2, 0, 0));
        let hit = cell
            .clip(DVec3::new(0.5, 0.5, 0.5), DVec3::new(4.5, 0.5, 0.5))
            .expect("segment crosses the cell");
        assert!((hit.x - 2.0).abs() < 1e-12);
        assert!(cell
            .clip(DVec3::new(0.5, 1.5, 0.5), DVec3::new(4.5, 1.5, 0.5))
            .is_none());
    }

    #[test]
    fn swept_box_detects_obstacle_between_endpoints() {
        let mover = Aabb::new(DVec3::new(0.0, 0.0, 0.0), DVec3::new(0.5, 0.5, 0.5));
        let wall = Aabb::of_block(IVec3::new(3, 0, 0));
        assert!(mover.collided_along_vector(DVec3::new(6.0, 0.0, 0.0), &[wall]));
        assert!(!mover.collided_along_vector(DVec3::new(0.0, 0.0, 6.0), &[wall]));
    }

    #[test]
    fn block_range_floors_both_corners() {
        let aabb = Aabb::new(DVec3::new(-0.3, 0.0, 1.2), DVec3::new(0.3, 1.8, 1.8));
        assert_eq!(
            aabb.block_range(),
            (IVec3::new(-1, 0, 1), IVec3::new(0, 1, 1))
        );
        assert_eq!(cells_between(IVec3::new(-1, 0, 1), IVec3::new(0, 1, 1)).count(), 4);
    }
}
