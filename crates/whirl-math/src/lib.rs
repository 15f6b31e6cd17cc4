// SPDX-License-Identifier: CEPL-1.0
//! Vector and matrix helpers for the camera.
//!
//! Convention: `glam` types, column-major storage (`Mat4::col(i)` is column `i`,
//! the layout GLSL expects), right-handed view space looking down `-Z`, and
//! Vulkan clip space (Y pointing down, depth in `[0, 1]`).
pub use glam::{Mat4, Vec3, Vec4};

#[inline]
pub fn cross(a: Vec3, b: Vec3) -> Vec3 {
    a.cross(b)
}

#[inline]
pub fn dot(a: Vec3, b: Vec3) -> f32 {
    a.dot(b)
}

/// Unit vector in the direction of `v`; the zero vector stays zero.
#[inline]
pub fn normalize(v: Vec3) -> Vec3 {
    v.normalize_or_zero()
}

/// View matrix placing `eye` at the origin looking at `center`.
///
/// `up` must not be parallel to `center - eye`; the result is degenerate otherwise.
pub fn look_at(eye: Vec3, center: Vec3, up: Vec3) -> Mat4 {
    let f = normalize(center - eye);
    let s = normalize(cross(f, up));
    let u = cross(s, f);

    Mat4::from_cols(
        Vec4::new(s.x, u.x, -f.x, 0.0),
        Vec4::new(s.y, u.y, -f.y, 0.0),
        Vec4::new(s.z, u.z, -f.z, 0.0),
        Vec4::new(-dot(s, eye), -dot(u, eye), dot(f, eye), 1.0),
    )
}

/// Perspective projection into Vulkan clip space.
///
/// `fov_y` is the vertical field of view in radians. `near` may be zero: the
/// only divisor besides the field of view is `near - far`, so `far` must differ
/// from `near`.
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    debug_assert!(far != near, "perspective: near and far planes coincide");
    debug_assert!(aspect > 0.0, "perspective: aspect must be positive");

    let t = 1.0 / (fov_y * 0.5).tan();
    let depth = near - far;

    Mat4::from_cols(
        Vec4::new(t / aspect, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -t, 0.0, 0.0),
        Vec4::new(0.0, 0.0, far / depth, -1.0),
        Vec4::new(0.0, 0.0, near * far / depth, 0.0),
    )
}
