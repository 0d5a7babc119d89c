// First-person camera
//
// Rotation is stored in degrees as (pitch, yaw, roll). The view matrix is
// rotation * translation, so `position` is the translation applied to the
// world, i.e. the negated eye position.

use glam::{Mat4, Vec3};

/// Movement keys currently held down
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveKeys {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
}

impl MoveKeys {
    pub fn any(&self) -> bool {
        self.forward || self.backward || self.left || self.right
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    rotation: Vec3,
    fov: f32,
    znear: f32,
    zfar: f32,
    aspect: f32,
    /// Negate clip-space Y so +Y is up on Vulkan's Y-down framebuffer
    flip_y: bool,
    pub movement_speed: f32,
    pub keys: MoveKeys,
    view: Mat4,
    projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        let mut camera = Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            fov: 60.0,
            znear: 0.1,
            zfar: 256.0,
            aspect: 1.0,
            flip_y: true,
            movement_speed: 5.0,
            keys: MoveKeys::default(),
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        };
        camera.update_projection();
        camera
    }
}

impl Camera {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        let mut camera = Self::default();
        camera.position = position;
        camera.rotation = rotation;
        camera.update_view_matrix();
        camera
    }

    pub fn set_flip_y(&mut self, flip_y: bool) {
        self.flip_y = flip_y;
        self.update_projection();
    }

    pub fn set_perspective(&mut self, fov: f32, aspect: f32, znear: f32, zfar: f32) {
        self.fov = fov;
        self.aspect = aspect;
        self.znear = znear;
        self.zfar = zfar;
        self.update_projection();
    }

    pub fn update_aspect_ratio(&mut self, aspect: f32) {
        self.aspect = aspect;
        self.update_projection();
    }

    /// Apply held movement keys. Returns true if the camera moved.
    pub fn update(&mut self, delta_time: f32) -> bool {
        if !self.keys.any() {
            return false;
        }

        let front = self.front();
        let side = front.cross(Vec3::Y).normalize_or_zero();
        let step = delta_time * self.movement_speed;

        if self.keys.forward {
            self.position += front * step;
        }
        if self.keys.backward {
            self.position -= front * step;
        }
        if self.keys.left {
            self.position -= side * step;
        }
        if self.keys.right {
            self.position += side * step;
        }

        self.update_view_matrix();
        true
    }

    fn front(&self) -> Vec3 {
        let (pitch, yaw) = (self.rotation.x.to_radians(), self.rotation.y.to_radians());
        Vec3::new(
            -pitch.cos() * yaw.sin(),
            pitch.sin(),
            pitch.cos() * yaw.cos(),
        )
        .normalize()
    }

    fn update_view_matrix(&mut self) {
        let rotation = Mat4::from_rotation_x(self.rotation.x.to_radians())
            * Mat4::from_rotation_y(self.rotation.y.to_radians())
            * Mat4::from_rotation_z(self.rotation.z.to_radians());

        self.view = rotation * Mat4::from_translation(self.position);
    }

    fn update_projection(&mut self) {
        self.projection =
            Mat4::perspective_rh(self.fov.to_radians(), self.aspect, self.znear, self.zfar);
        if self.flip_y {
            self.projection.y_axis.y *= -1.0;
        }
        self.update_view_matrix();
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// View-projection with the translation stripped, for skyboxes
    pub fn rotation_only_view_projection(&self) -> Mat4 {
        let mut view = self.view;
        view.w_axis = glam::Vec4::W;
        self.projection * view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frustum::Frustum;
    use approx::assert_relative_eq;

    fn eye(camera: &Camera) -> Vec3 {
        camera.view.inverse().w_axis.truncate()
    }

    #[test]
    fn eye_is_negated_translation() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, -32.5), Vec3::ZERO);
        let eye = eye(&camera);
        assert_relative_eq!(eye.z, 32.5, epsilon = 1e-4);
        assert_relative_eq!(eye.x, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn flip_y_negates_vertical_scale() {
        let mut camera = Camera::default();
        camera.set_flip_y(false);
        let upright = camera.projection;
        camera.set_flip_y(true);
        assert_relative_eq!(camera.projection.y_axis.y, -upright.y_axis.y);
    }

    #[test]
    fn sphere_at_eye_is_inside_camera_frustum() {
        let mut camera = Camera::new(Vec3::new(4.0, -2.0, -32.5), Vec3::new(10.0, 30.0, 0.0));
        camera.set_perspective(60.0, 16.0 / 9.0, 0.1, 256.0);
        let frustum = Frustum::from_matrix(camera.view_projection());
        assert!(frustum.check_sphere(eye(&camera), 0.5));
    }

    #[test]
    fn movement_keys_move_along_front() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::ZERO);
        camera.movement_speed = 2.0;
        assert!(!camera.update(1.0));

        camera.keys.forward = true;
        assert!(camera.update(0.5));
        // Front at zero rotation is +Z in translation space
        assert_relative_eq!(camera.view.w_axis.z, 1.0, epsilon = 1e-5);
    }
}
