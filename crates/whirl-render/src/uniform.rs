// SPDX-License-Identifier: CEPL-1.0
//! Per-frame model/view/projection payload.
use std::f32::consts::TAU;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use whirl_math::{look_at, perspective, Mat4, Vec3};

/// Matrix triple as laid out in the vertex shader's uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformPayload {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformPayload {
    /// Model rotates by `angle` around the camera's up axis (Z).
    pub fn compute(camera: &Camera, angle: f32, aspect: f32) -> Self {
        Self {
            model: Mat4::from_rotation_z(angle),
            view: look_at(camera.eye, camera.center, camera.up),
            proj: perspective(camera.fov_y, aspect, camera.near, camera.far),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub center: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(2.0, 2.0, 2.0),
            center: Vec3::ZERO,
            up: Vec3::Z,
            fov_y: 1.0,
            near: 0.1,
            far: 10.0,
        }
    }
}

/// Angle in `[0, 2π)` for a clock reading, one full turn per `period`.
pub fn rotation_angle(since_epoch: Duration, period: Duration) -> f32 {
    let period_ms = period.as_millis();
    if period_ms == 0 {
        return 0.0;
    }
    let phase = since_epoch.as_millis() % period_ms;
    TAU * phase as f32 / period_ms as f32
}

/// Samples the wall clock on every call; animation speed follows frame rate
/// only through how often it is sampled.
#[derive(Clone, Debug)]
pub struct UniformUpdater {
    pub camera: Camera,
    period: Duration,
}

impl UniformUpdater {
    pub fn new(period: Duration) -> Self {
        Self { camera: Camera::default(), period }
    }

    pub fn sample(&self, aspect: f32) -> UniformPayload {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.sample_at(now, aspect)
    }

    pub fn sample_at(&self, since_epoch: Duration, aspect: f32) -> UniformPayload {
        UniformPayload::compute(&self.camera, rotation_angle(since_epoch, self.period), aspect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const PERIOD: Duration = Duration::from_millis(7000);

    #[test]
    fn angle_covers_one_turn_per_period() {
        assert_eq!(rotation_angle(Duration::ZERO, PERIOD), 0.0);
        let half = rotation_angle(Duration::from_millis(3500), PERIOD);
        assert!((half - PI).abs() < 1e-5);
        assert_eq!(rotation_angle(Duration::from_millis(7000), PERIOD), 0.0);
        let wrapped = rotation_angle(Duration::from_millis(7000 * 1000 + 1750), PERIOD);
        assert!((wrapped - PI / 2.0).abs() < 1e-5);
    }

    #[test]
    fn zero_period_does_not_divide() {
        assert_eq!(rotation_angle(Duration::from_secs(42), Duration::ZERO), 0.0);
    }

    #[test]
    fn payload_matches_shader_block_size() {
        let p = UniformPayload::compute(&Camera::default(), 0.3, 4.0 / 3.0);
        assert_eq!(bytemuck::bytes_of(&p).len(), 3 * 16 * 4);
    }

    #[test]
    fn model_spins_around_z() {
        let p = UniformPayload::compute(&Camera::default(), PI / 2.0, 1.0);
        let x = p.model.transform_point3(Vec3::X);
        assert!((x - Vec3::Y).length() < 1e-5);
        let z = p.model.transform_point3(Vec3::Z);
        assert!((z - Vec3::Z).length() < 1e-6);
    }

    #[test]
    fn updater_uses_fixed_camera() {
        let u = UniformUpdater::new(PERIOD);
        let a = u.sample_at(Duration::from_millis(100), 1.5);
        let b = u.sample_at(Duration::from_millis(2100), 1.5);
        assert_eq!(a.view, b.view);
        assert_eq!(a.proj, b.proj);
        assert_ne!(a.model, b.model);
        assert!(u.sample(1.5).model.is_finite());
    }
}
