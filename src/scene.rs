// Per-object scene state for the UFO swarm
//
// Objects are scattered on a ring around the origin and bob, wobble and spin
// independently. All of it is plain CPU data; the workers animate their own
// objects before deciding whether to record them.

use glam::{Mat4, Vec3};
use rand::Rng;
use std::f32::consts::PI;

/// Radius of the ring the objects are scattered on
pub const RING_RADIUS: f32 = 35.0;

/// Push constant block shared by the UFO and starfield shaders.
///
/// Matches `layout(push_constant) { mat4 mvp; vec3 color; }` with the
/// trailing float padding the block out to 80 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PushConstantBlock {
    pub mvp: Mat4,
    pub color: Vec3,
    _pad: f32,
}

impl PushConstantBlock {
    pub fn new(mvp: Mat4, color: Vec3) -> Self {
        Self {
            mvp,
            color,
            _pad: 0.0,
        }
    }
}

impl Default for PushConstantBlock {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Vec3::ONE)
    }
}

#[derive(Debug, Clone)]
pub struct ObjectData {
    pub model: Mat4,
    pub position: Vec3,
    /// Degrees
    pub rotation: Vec3,
    /// +1 or -1
    pub rotation_dir: f32,
    pub rotation_speed: f32,
    pub scale: f32,
    /// Animation phase in `[0, 1)`
    pub delta_t: f32,
    /// Result of this frame's frustum test
    pub visible: bool,
}

impl Default for ObjectData {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            rotation_dir: 1.0,
            rotation_speed: 0.0,
            scale: 1.0,
            delta_t: 0.0,
            visible: true,
        }
    }
}

impl ObjectData {
    /// Random object on the ring, paired with its tint
    pub fn scatter(rng: &mut impl Rng) -> (Self, Vec3) {
        let theta = 2.0 * PI * rng.gen::<f32>();
        let phi = (1.0 - 2.0 * rng.gen::<f32>()).acos();
        let position = Vec3::new(phi.sin() * theta.cos(), 0.0, phi.cos()) * RING_RADIUS;

        let rotation_dir = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let mut object = Self {
            position,
            rotation: Vec3::new(0.0, rng.gen::<f32>() * 360.0, 0.0),
            rotation_dir,
            rotation_speed: (2.0 + rng.gen::<f32>() * 4.0) * rotation_dir,
            scale: 0.75 + rng.gen::<f32>() * 0.5,
            delta_t: rng.gen(),
            ..Self::default()
        };
        object.animate(0.0);

        let color = Vec3::new(rng.gen(), rng.gen(), rng.gen());
        (object, color)
    }

    /// Advance the animation by `frame_timer` and rebuild the model matrix
    pub fn animate(&mut self, frame_timer: f32) {
        self.rotation.y += 2.5 * self.rotation_speed * frame_timer;
        if self.rotation.y > 360.0 {
            self.rotation.y -= 360.0;
        } else if self.rotation.y < 0.0 {
            self.rotation.y += 360.0;
        }

        self.delta_t += 0.15 * frame_timer;
        if self.delta_t > 1.0 {
            self.delta_t -= 1.0;
        }

        let phase = (self.delta_t * 360.0).to_radians();
        self.position.y = phase.sin() * 2.5;

        let wobble_axis = Vec3::new(self.rotation_dir, 0.0, 0.0);
        let spin_axis = Vec3::new(0.0, self.rotation_dir, 0.0);

        self.model = Mat4::from_translation(self.position)
            * Mat4::from_axis_angle(wobble_axis, -phase.sin() * 0.25)
            * Mat4::from_axis_angle(spin_axis, self.rotation.y.to_radians())
            * Mat4::from_axis_angle(spin_axis, phase)
            * Mat4::from_scale(Vec3::splat(self.scale));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn push_constant_block_is_80_bytes() {
        assert_eq!(std::mem::size_of::<PushConstantBlock>(), 80);
    }

    #[test]
    fn scattered_objects_lie_on_the_ring() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let (object, color) = ObjectData::scatter(&mut rng);
            let flat = Vec3::new(object.position.x, 0.0, object.position.z);
            assert!(flat.length() <= RING_RADIUS + 1e-3);
            assert!((0.75..=1.25).contains(&object.scale));
            assert!(object.rotation_speed.abs() >= 2.0 && object.rotation_speed.abs() <= 6.0);
            assert_eq!(object.rotation_speed.signum(), object.rotation_dir);
            assert!(color.min_element() >= 0.0 && color.max_element() <= 1.0);
        }
    }

    #[test]
    fn animation_wraps_and_bobs() {
        let mut object = ObjectData {
            rotation: Vec3::new(0.0, 359.0, 0.0),
            rotation_speed: 4.0,
            delta_t: 0.99,
            ..ObjectData::default()
        };
        object.animate(0.5);

        assert!(object.rotation.y >= 0.0 && object.rotation.y < 360.0);
        assert!(object.delta_t >= 0.0 && object.delta_t < 1.0);
        assert!(object.position.y.abs() <= 2.5);
        assert_relative_eq!(object.model.w_axis.truncate().x, object.position.x);
        assert_relative_eq!(object.model.w_axis.truncate().y, object.position.y);
    }

    #[test]
    fn zero_timer_keeps_phase() {
        let mut object = ObjectData {
            delta_t: 0.25,
            ..ObjectData::default()
        };
        object.animate(0.0);
        assert_relative_eq!(object.delta_t, 0.25);
        assert_relative_eq!(object.position.y, 2.5, epsilon = 1e-5);
    }
}
