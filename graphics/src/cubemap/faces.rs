//! Cube face orientation and the equirectangular mapping.
//!
//! Face `i` is array layer `i` of a cube image, in the order +X, -X, +Y, -Y,
//! +Z, -Z. Within a face, `s` grows along the face's right vector and `t`
//! (the row) along its down vector, as the cube addressing rules define.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

/// Face order of cube image layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    /// Array layer holding this face.
    pub fn layer(self) -> u32 {
        self as u32
    }

    /// Outward direction through the face centre.
    pub fn forward(self) -> Vec3 {
        match self {
            CubeFace::PositiveX => Vec3::X,
            CubeFace::NegativeX => Vec3::NEG_X,
            CubeFace::PositiveY => Vec3::Y,
            CubeFace::NegativeY => Vec3::NEG_Y,
            CubeFace::PositiveZ => Vec3::Z,
            CubeFace::NegativeZ => Vec3::NEG_Z,
        }
    }

    /// Direction of increasing `s` (columns).
    pub fn right(self) -> Vec3 {
        match self {
            CubeFace::PositiveX => Vec3::NEG_Z,
            CubeFace::NegativeX => Vec3::Z,
            CubeFace::PositiveY | CubeFace::NegativeY | CubeFace::PositiveZ => Vec3::X,
            CubeFace::NegativeZ => Vec3::NEG_X,
        }
    }

    /// Direction of increasing `t` (rows, top to bottom).
    pub fn down(self) -> Vec3 {
        match self {
            CubeFace::PositiveY => Vec3::Z,
            CubeFace::NegativeY => Vec3::NEG_Z,
            _ => Vec3::NEG_Y,
        }
    }

    /// World-to-view transform looking through this face.
    ///
    /// View space is right-handed with the camera looking down -Z; view +Y
    /// maps to the face's down vector because clip-space +Y points down the
    /// framebuffer.
    pub fn view_matrix(self) -> Mat4 {
        let rows = Mat3::from_cols(self.right(), self.down(), -self.forward()).transpose();
        Mat4::from_mat3(rows)
    }
}

/// Square 90 degree projection covering exactly one face.
pub fn face_projection() -> Mat4 {
    Mat4::perspective_rh(FRAC_PI_2, 1.0, 0.1, 10.0)
}

/// Unit direction through texel coordinates `(s, t)` in `[0, 1]` of `face`.
pub fn face_direction(face: CubeFace, s: f32, t: f32) -> Vec3 {
    let a = 2.0 * s - 1.0;
    let b = 2.0 * t - 1.0;
    (face.forward() + a * face.right() + b * face.down()).normalize()
}

/// Equirectangular coordinates of `direction`: `u` wraps around the Y axis,
/// `v` runs from +Y (0) to -Y (1).
pub fn direction_to_equirect_uv(direction: Vec3) -> Vec2 {
    let d = direction.normalize();
    let u = 0.5 + d.z.atan2(d.x) / TAU;
    let v = d.y.clamp(-1.0, 1.0).acos() / PI;
    Vec2::new(u, v)
}

/// Bilinear sample of tightly packed RGBA `texels` at `uv`, repeating in `u`
/// and clamping in `v`, with texel centres at half-integers.
pub fn sample_equirect(texels: &[Vec4], width: u32, height: u32, uv: Vec2) -> Vec4 {
    if texels.is_empty() || width == 0 || height == 0 {
        return Vec4::ZERO;
    }
    let x = uv.x * width as f32 - 0.5;
    let y = (uv.y * height as f32 - 0.5).clamp(0.0, (height - 1) as f32);
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);

    let column = |c: f32| (c as i64).rem_euclid(width as i64) as usize;
    let row = |r: f32| (r as usize).min(height as usize - 1);
    let texel = |c: f32, r: f32| texels[row(r) * width as usize + column(c)];

    let top = texel(x0, y0).lerp(texel(x0 + 1.0, y0), fx);
    let bottom = texel(x0, y0 + 1.0).lerp(texel(x0 + 1.0, y0 + 1.0), fx);
    top.lerp(bottom, fy)
}

/// Uniform block read by the conversion shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct CubeUniforms {
    pub projection: Mat4,
    pub views: [Mat4; 6],
}

static_assertions::const_assert_eq!(std::mem::size_of::<CubeUniforms>(), 448);

impl CubeUniforms {
    pub(crate) fn new() -> Self {
        Self {
            projection: face_projection(),
            views: CubeFace::ALL.map(CubeFace::view_matrix),
        }
    }
}
