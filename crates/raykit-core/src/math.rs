//! Ray and triangle math for host-side traversal.

use glam::{Mat4, Vec3};

/// Determinants smaller than this are treated as a ray parallel to the triangle.
const PARALLEL_EPSILON: f32 = 1e-7;

/// Ray for host-side intersection queries.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    /// Ray origin
    pub origin: Vec3,
    /// Ray direction (normalized by `new`, not by `transform`)
    pub direction: Vec3,
}

impl Ray {
    /// Create a new ray with a normalized direction
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Get a point along the ray at distance t
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Transform ray by an affine matrix.
    ///
    /// The direction is not renormalized, so a hit distance measured against
    /// the transformed ray is the same `t` as on the original ray.
    #[inline]
    pub fn transform(&self, matrix: Mat4) -> Self {
        Self {
            origin: matrix.transform_point3(self.origin),
            direction: matrix.transform_vector3(self.direction),
        }
    }
}

/// Result of a ray-triangle intersection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleHit {
    /// Distance along the ray.
    pub t: f32,
    /// Barycentric weight of the second vertex.
    pub u: f32,
    /// Barycentric weight of the third vertex.
    pub v: f32,
    /// Whether the vertices appear clockwise seen from the ray origin.
    pub clockwise: bool,
}

/// Möller-Trumbore ray-triangle intersection.
///
/// Returns the hit if it lies inside the closed interval `[t_min, t_max]`.
/// Rays parallel to the triangle plane never hit.
pub fn intersect_triangle(
    ray: &Ray,
    vertices: [Vec3; 3],
    t_min: f32,
    t_max: f32,
) -> Option<TriangleHit> {
    let [v0, v1, v2] = vertices;
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let p = ray.direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(q) * inv_det;
    if t < t_min || t > t_max {
        return None;
    }

    // det > 0 means the counter-clockwise normal faces the ray origin
    Some(TriangleHit {
        t,
        u,
        v,
        clockwise: det < 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TRIANGLE: [Vec3; 3] = [
        Vec3::new(-1.0, -1.0, 0.0),
        Vec3::new(1.0, -1.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
    ];

    #[test]
    fn ray_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(3.0), Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn transform_keeps_parameterization() {
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        let moved = ray.transform(Mat4::from_scale(Vec3::splat(2.0)));
        assert_eq!(moved.direction, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(moved.at(1.0), Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn hits_triangle_head_on() {
        let ray = Ray::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z);
        let hit = intersect_triangle(&ray, TRIANGLE, 0.0, f32::MAX).unwrap();
        assert_relative_eq!(hit.t, 1.0);
        // Counter-clockwise in the XY plane, seen from -Z it appears clockwise
        assert!(hit.clockwise);
    }

    #[test]
    fn winding_flips_with_ray_side() {
        let ray = Ray::new(Vec3::new(0.0, 0.0, 1.0), -Vec3::Z);
        let hit = intersect_triangle(&ray, TRIANGLE, 0.0, f32::MAX).unwrap();
        assert!(!hit.clockwise);
    }

    #[test]
    fn misses_outside_and_parallel() {
        let outside = Ray::new(Vec3::new(5.0, 0.0, -1.0), Vec3::Z);
        assert!(intersect_triangle(&outside, TRIANGLE, 0.0, f32::MAX).is_none());

        let parallel = Ray::new(Vec3::new(0.0, 0.0, 0.0), Vec3::X);
        assert!(intersect_triangle(&parallel, TRIANGLE, 0.0, f32::MAX).is_none());
    }

    #[test]
    fn respects_interval() {
        let ray = Ray::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z);
        assert!(intersect_triangle(&ray, TRIANGLE, 0.0, 0.5).is_none());
        assert!(intersect_triangle(&ray, TRIANGLE, 1.5, f32::MAX).is_none());
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        let ray = Ray::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z);
        let at_max = intersect_triangle(&ray, TRIANGLE, 0.0, 1.0).unwrap();
        assert_eq!(at_max.t, 1.0);
        let at_min = intersect_triangle(&ray, TRIANGLE, 1.0, f32::MAX).unwrap();
        assert_eq!(at_min.t, 1.0);
    }

    #[test]
    fn barycentrics_at_vertex() {
        let ray = Ray::new(Vec3::new(0.0, 0.999, -1.0), Vec3::Z);
        let hit = intersect_triangle(&ray, TRIANGLE, 0.0, f32::MAX).unwrap();
        assert_relative_eq!(hit.v, 1.0, epsilon = 1e-3);
    }
}
