//! 2D camera
//!
//! World space is y-down with units of pixels at zoom 1, which lines up with
//! Vulkan clip space without a flip. The camera position is the world point
//! shown at the centre of the viewport.

use crate::foundation::math::{Mat4, Vec2};

/// Orthographic camera over a viewport
#[derive(Debug, Clone, PartialEq)]
pub struct Camera2D {
    /// World point at the viewport centre
    pub position: Vec2,
    /// Magnification; 2.0 shows half as much of the world
    pub zoom: f32,
    /// Rotation of the view in radians
    pub rotation: f32,
    /// Viewport size in pixels
    pub viewport: Vec2,
}

impl Camera2D {
    /// Camera whose top-left world corner is the origin
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            position: Vec2::new(width * 0.5, height * 0.5),
            zoom: 1.0,
            rotation: 0.0,
            viewport: Vec2::new(width, height),
        }
    }

    /// Resize the viewport, keeping the camera centre
    pub fn set_viewport(&mut self, width: f32, height: f32) {
        if (self.viewport.x - width).abs() > f32::EPSILON || (self.viewport.y - height).abs() > f32::EPSILON {
            log::trace!("Camera viewport {}x{} -> {}x{}", self.viewport.x, self.viewport.y, width, height);
        }
        self.viewport = Vec2::new(width, height);
    }

    /// Builder-style zoom
    pub fn with_zoom(mut self, zoom: f32) -> Self {
        self.zoom = zoom;
        self
    }

    /// World to clip transform
    pub fn view_projection(&self) -> Mat4 {
        let width = self.viewport.x.max(1.0);
        let height = self.viewport.y.max(1.0);
        let sx = 2.0 * self.zoom / width;
        let sy = 2.0 * self.zoom / height;
        let (sin, cos) = (-self.rotation).sin_cos();
        let (px, py) = (self.position.x, self.position.y);

        // scale * rotate(-rotation) * translate(-position)
        let tx = -(cos * px - sin * py);
        let ty = -(sin * px + cos * py);
        Mat4::new(
            sx * cos, -sx * sin, 0.0, sx * tx,
            sy * sin, sy * cos, 0.0, sy * ty,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// World position under a viewport pixel
    pub fn screen_to_world(&self, screen: Vec2) -> Vec2 {
        let centered = (screen - self.viewport * 0.5) / self.zoom;
        let (sin, cos) = self.rotation.sin_cos();
        Vec2::new(
            cos * centered.x - sin * centered.y + self.position.x,
            sin * centered.x + cos * centered.y + self.position.y,
        )
    }
}

impl Default for Camera2D {
    fn default() -> Self {
        Self::new(800.0, 600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    fn clip(camera: &Camera2D, x: f32, y: f32) -> (f32, f32) {
        let p = camera.view_projection() * Vector4::new(x, y, 0.0, 1.0);
        (p.x, p.y)
    }

    #[test]
    fn test_viewport_corners_map_to_clip_corners() {
        let camera = Camera2D::new(800.0, 600.0);
        let (x, y) = clip(&camera, 0.0, 0.0);
        assert_relative_eq!(x, -1.0);
        assert_relative_eq!(y, -1.0);
        let (x, y) = clip(&camera, 800.0, 600.0);
        assert_relative_eq!(x, 1.0);
        assert_relative_eq!(y, 1.0);
    }

    #[test]
    fn test_zoom_shrinks_visible_area() {
        let camera = Camera2D::new(800.0, 600.0).with_zoom(2.0);
        let (x, _) = clip(&camera, 600.0, 300.0);
        assert_relative_eq!(x, 1.0);
    }

    #[test]
    fn test_screen_to_world_inverts_projection() {
        let mut camera = Camera2D::new(640.0, 480.0).with_zoom(1.5);
        camera.rotation = 0.3;
        camera.position = Vec2::new(10.0, -20.0);

        let world = camera.screen_to_world(Vec2::new(100.0, 50.0));
        let (x, y) = clip(&camera, world.x, world.y);
        // Back to pixels.
        assert_relative_eq!((x + 1.0) * 320.0, 100.0, epsilon = 1e-3);
        assert_relative_eq!((y + 1.0) * 240.0, 50.0, epsilon = 1e-3);
    }
}
