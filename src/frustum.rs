// View frustum - plane extraction and bounding-sphere test
//
// Planes are pulled straight out of the rows of the combined
// projection * view matrix (Gribb & Hartmann), so they live in world space.

use glam::{Mat4, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    Left = 0,
    Right = 1,
    Top = 2,
    Bottom = 3,
    Near = 4,
    Far = 5,
}

/// Six planes stored as `(normal.xyz, distance)` with unit-length normals
#[derive(Debug, Clone, Copy, Default)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_matrix(view_projection: Mat4) -> Self {
        let mut frustum = Self::default();
        frustum.update(view_projection);
        frustum
    }

    /// Re-extract the planes from a new view-projection matrix.
    ///
    /// The near plane is row 2 alone because our projections map depth to
    /// Vulkan's `[0, 1]` range. With a Y-flipped projection the top and
    /// bottom planes trade places, which the sphere test does not care about.
    pub fn update(&mut self, view_projection: Mat4) {
        let m = view_projection;
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));

        self.planes[PlaneSide::Left as usize] = r3 + r0;
        self.planes[PlaneSide::Right as usize] = r3 - r0;
        self.planes[PlaneSide::Top as usize] = r3 - r1;
        self.planes[PlaneSide::Bottom as usize] = r3 + r1;
        self.planes[PlaneSide::Near as usize] = r2;
        self.planes[PlaneSide::Far as usize] = r3 - r2;

        for plane in &mut self.planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }
    }

    /// Planes in `PlaneSide` order
    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Conservative test: `false` only when the sphere lies entirely behind
    /// one of the planes. Intersecting spheres count as visible.
    ///
    /// The near plane sits `near` units in front of the eye, so a sphere
    /// centred on the eye is only visible once its radius exceeds `near`.
    pub fn check_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w + radius > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const NEAR: f32 = 0.1;
    const FAR: f32 = 256.0;

    /// Camera at the origin looking down -Z with a 60 degree vertical FOV
    fn origin_frustum() -> Frustum {
        let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, NEAR, FAR);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        Frustum::from_matrix(projection * view)
    }

    fn plane(frustum: &Frustum, side: PlaneSide) -> Vec4 {
        frustum.planes()[side as usize]
    }

    #[test]
    fn plane_normals_are_unit_length() {
        let view = Mat4::look_at_rh(Vec3::new(3.0, 4.0, 10.0), Vec3::new(-1.0, 0.0, 0.0), Vec3::Y);
        let projection = Mat4::perspective_rh(45f32.to_radians(), 1.5, 0.5, 100.0);
        let frustum = Frustum::from_matrix(projection * view);

        for plane in frustum.planes() {
            assert_relative_eq!(plane.truncate().length(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn sphere_around_the_eye_is_visible() {
        let frustum = origin_frustum();
        // The near plane sits NEAR units ahead of the eye
        for radius in [0.11, 0.5, 1.0, 10.0, 1000.0] {
            assert!(frustum.check_sphere(Vec3::ZERO, radius), "radius {}", radius);
        }
    }

    #[test]
    fn sphere_inside_the_near_clip_is_culled() {
        let frustum = origin_frustum();
        for radius in [0.01, 0.05, NEAR * 0.99] {
            assert!(!frustum.check_sphere(Vec3::ZERO, radius), "radius {}", radius);
        }
        assert!(frustum.check_sphere(Vec3::ZERO, NEAR + 0.01));
    }

    #[test]
    fn far_plane_distance_matches_projection() {
        let frustum = origin_frustum();
        let far = plane(&frustum, PlaneSide::Far);
        assert!(far.truncate().abs_diff_eq(Vec3::Z, 1e-4));
        // Cancellation in r3 - r2 costs a few bits at this near/far ratio
        assert_relative_eq!(far.w, FAR, max_relative = 1e-2);

        let near = plane(&frustum, PlaneSide::Near);
        assert!(near.truncate().abs_diff_eq(Vec3::NEG_Z, 1e-4));
        assert_relative_eq!(near.w, -NEAR, epsilon = 1e-4);
    }

    #[test]
    fn sphere_beyond_far_plane_is_culled() {
        let frustum = origin_frustum();
        for radius in [0.5, 2.0, 20.0] {
            let center = Vec3::new(0.0, 0.0, -(FAR + radius + 1.0));
            assert!(!frustum.check_sphere(center, radius));
        }
        // Straddling the far plane is still visible
        assert!(frustum.check_sphere(Vec3::new(0.0, 0.0, -FAR - 1.0), 2.0));
    }

    #[test]
    fn object_far_off_to_the_side_is_culled() {
        let frustum = origin_frustum();
        assert!(!frustum.check_sphere(Vec3::new(1000.0, 0.0, 0.0), 1.0));
        assert!(!frustum.check_sphere(Vec3::new(0.0, 0.0, 50.0), 1.0));
        assert!(frustum.check_sphere(Vec3::new(0.0, 0.0, -50.0), 1.0));
    }

    #[test]
    fn sphere_crossing_a_side_plane_counts_as_visible() {
        let frustum = origin_frustum();
        let left = plane(&frustum, PlaneSide::Left);
        // Point just outside the left plane, 20 units ahead
        let inside = Vec3::new(0.0, 0.0, -20.0);
        let distance = left.truncate().dot(inside) + left.w;
        let outside = inside - left.truncate() * (distance + 0.5);

        assert!(!frustum.check_sphere(outside, 0.25));
        assert!(frustum.check_sphere(outside, 1.0));
    }

    #[test]
    fn default_frustum_accepts_everything() {
        let frustum = Frustum::default();
        assert!(frustum.check_sphere(Vec3::splat(1.0e6), 1.0));
    }
}
