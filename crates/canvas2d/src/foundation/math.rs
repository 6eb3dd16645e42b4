//! Math utilities and types
//!
//! Provides the small set of math types a 2D renderer needs. Everything is
//! built on nalgebra so matrices can be handed straight to the GPU.

pub use nalgebra::{Matrix4, Vector2, Vector4};

use serde::{Deserialize, Serialize};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Linear RGBA colour
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    /// Red channel
    pub r: f32,
    /// Green channel
    pub g: f32,
    /// Blue channel
    pub b: f32,
    /// Alpha channel
    pub a: f32,
}

impl Color {
    /// Opaque white
    pub const WHITE: Self = Self::rgba(1.0, 1.0, 1.0, 1.0);
    /// Opaque black
    pub const BLACK: Self = Self::rgba(0.0, 0.0, 0.0, 1.0);
    /// Opaque magenta, used to flag missing assets
    pub const MAGENTA: Self = Self::rgba(1.0, 0.0, 1.0, 1.0);
    /// Fully transparent black
    pub const TRANSPARENT: Self = Self::rgba(0.0, 0.0, 0.0, 0.0);

    /// Create a colour from its four channels
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Create an opaque colour
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::rgba(r, g, b, 1.0)
    }

    /// Channels as an array
    pub const fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Quantize to 8-bit RGBA
    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Position, rotation and scale in the plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2D {
    /// Translation in world units
    pub position: Vec2,
    /// Counter-clockwise rotation in radians
    pub rotation: f32,
    /// Per-axis scale
    pub scale: Vec2,
    /// Depth value written to `z`, useful only when depth testing is enabled
    pub depth: f32,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self {
            position: Vec2::zeros(),
            rotation: 0.0,
            scale: Vec2::new(1.0, 1.0),
            depth: 0.0,
        }
    }
}

impl Transform2D {
    /// Identity transform
    pub fn identity() -> Self {
        Self::default()
    }

    /// Transform with only a translation
    pub fn from_position(position: Vec2) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Builder-style rotation
    #[must_use]
    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    /// Builder-style scale
    #[must_use]
    pub fn with_scale(mut self, scale: Vec2) -> Self {
        self.scale = scale;
        self
    }

    /// Model matrix: scale, then rotate, then translate
    pub fn to_matrix(&self) -> Mat4 {
        let (sin, cos) = self.rotation.sin_cos();
        let (sx, sy) = (self.scale.x, self.scale.y);
        Mat4::new(
            cos * sx, -sin * sy, 0.0, self.position.x,
            sin * sx, cos * sy, 0.0, self.position.y,
            0.0, 0.0, 1.0, self.depth,
            0.0, 0.0, 0.0, 1.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_identity_matrix() {
        assert_relative_eq!(Transform2D::identity().to_matrix(), Mat4::identity(), epsilon = EPSILON);
    }

    #[test]
    fn test_transform_applies_scale_rotation_translation() {
        let transform = Transform2D::from_position(Vec2::new(10.0, 5.0))
            .with_rotation(std::f32::consts::FRAC_PI_2)
            .with_scale(Vec2::new(2.0, 2.0));
        let point = transform.to_matrix() * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(point.x, 10.0, epsilon = 1e-5);
        assert_relative_eq!(point.y, 7.0, epsilon = 1e-5);
    }

    #[test]
    fn test_color_quantization() {
        assert_eq!(Color::MAGENTA.to_rgba8(), [255, 0, 255, 255]);
        assert_eq!(Color::rgba(2.0, -1.0, 0.5, 1.0).to_rgba8(), [255, 0, 128, 255]);
    }
}
