use glam::DVec3;

use crate::math::Aabb;
use crate::shape::Shape;

const OUTSIDE_EXTENT: f64 = 3.0e7;

/// Square, axis-aligned world border centred on `(center_x, center_z)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBorder {
    pub center_x: f64,
    pub center_z: f64,
    pub size: f64,
}

impl WorldBorder {
    pub fn new(center_x: f64, center_z: f64, size: f64) -> Self {
        Self {
            center_x,
            center_z,
            size: size.max(1.0),
        }
    }

    pub fn min_x(&self) -> f64 {
        self.center_x - self.size * 0.5
    }

    pub fn max_x(&self) -> f64 {
        self.center_x + self.size * 0.5
    }

    pub fn min_z(&self) -> f64 {
        self.center_z - self.size * 0.5
    }

    pub fn max_z(&self) -> f64 {
        self.center_z + self.size * 0.5
    }

    pub fn contains(&self, x: f64, z: f64) -> bool {
        x >= self.min_x() && x < self.max_x() && z >= self.min_z() && z < self.max_z()
    }

    pub fn distance_to_edge(&self, x: f64, z: f64) -> f64 {
        let dx = (x - self.min_x()).min(self.max_x() - x);
        let dz = (z - self.min_z()).min(self.max_z() - z);
        dx.min(dz)
    }

    fn within_bounds(&self, x: f64, z: f64, margin: f64) -> bool {
        x >= self.min_x() - margin
            && x < self.max_x() + margin
            && z >= self.min_z() - margin
            && z < self.max_z() + margin
    }

    /// True when an entity at `origin` sweeping `query` is close enough that
    /// the border has to take part in collision.
    pub fn is_inside_close_to_border(&self, origin: DVec3, query: &Aabb) -> bool {
        let size = query.size();
        let margin = size.x.abs().max(size.z.abs()).max(1.0);
        self.distance_to_edge(origin.x, origin.z) < margin * 2.0
            && self.within_bounds(origin.x, origin.z, margin)
    }

    /// The region outside the border as four slabs.
    pub fn collision_shape(&self) -> Shape {
        let (lo, hi) = (-OUTSIDE_EXTENT, OUTSIDE_EXTENT);
        Shape::from_boxes(vec![
            Aabb::new(DVec3::new(lo, lo, lo), DVec3::new(self.min_x(), hi, hi)),
            Aabb::new(DVec3::new(self.max_x(), lo, lo), DVec3::new(hi, hi, hi)),
            Aabb::new(DVec3::new(lo, lo, lo), DVec3::new(hi, hi, self.min_z())),
            Aabb::new(DVec3::new(lo, lo, self.max_z()), DVec3::new(hi, hi, hi)),
        ])
    }
}
