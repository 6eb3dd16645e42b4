//! What a draw call consumes

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{Color, Transform2D};
use crate::render::pipeline::PipelineFlags;
use crate::render::resources::{GeometryBuffer, Shader, Texture};

/// Placement and tint of one drawn copy of a geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance2D {
    /// World transform
    pub transform: Transform2D,
    /// Colour multiplied into every fragment
    pub tint: Color,
}

impl Instance2D {
    /// Untinted instance at `transform`
    pub fn new(transform: Transform2D) -> Self {
        Self {
            transform,
            tint: Color::WHITE,
        }
    }

    /// Replace the tint
    pub fn with_tint(mut self, tint: Color) -> Self {
        self.tint = tint;
        self
    }
}

impl Default for Instance2D {
    fn default() -> Self {
        Self::new(Transform2D::identity())
    }
}

/// Shader-side layout of one instance in the set 1 storage buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuInstance {
    /// Column-major model matrix
    pub model: [[f32; 4]; 4],
    /// Instance tint
    pub tint: [f32; 4],
}

impl From<&Instance2D> for GpuInstance {
    fn from(instance: &Instance2D) -> Self {
        Self {
            model: instance.transform.to_matrix().into(),
            tint: instance.tint.to_array(),
        }
    }
}

/// Geometry plus everything needed to draw it
#[derive(Debug, Clone, Copy)]
pub struct Drawable<'a> {
    /// Vertices and indices
    pub geometry: &'a GeometryBuffer,
    /// Sampled texture, white when `None`
    pub texture: Option<&'a Texture>,
    /// One entry per drawn copy
    pub instances: &'a [Instance2D],
    /// Bytes for the material uniform, zeroes when `None`
    pub material: Option<&'a [u8]>,
}

impl<'a> Drawable<'a> {
    /// Untextured drawable
    pub fn new(geometry: &'a GeometryBuffer, instances: &'a [Instance2D]) -> Self {
        Self {
            geometry,
            texture: None,
            instances,
            material: None,
        }
    }

    /// Sample `texture`
    pub fn with_texture(mut self, texture: &'a Texture) -> Self {
        self.texture = Some(texture);
        self
    }

    /// Material uniform bytes
    pub fn with_material(mut self, material: &'a [u8]) -> Self {
        self.material = Some(material);
        self
    }
}

/// Pipeline state chosen by the caller
///
/// Topology and polygon mode come from the drawn geometry; missing shaders
/// fall back to the instance defaults.
#[derive(Debug, Clone, Copy)]
pub struct RenderState<'a> {
    /// Vertex stage override
    pub vertex_shader: Option<&'a Shader>,
    /// Fragment stage override
    pub fragment_shader: Option<&'a Shader>,
    /// Blend and depth toggles
    pub flags: PipelineFlags,
    /// Rasterised line width
    pub line_width: f32,
}

impl<'a> RenderState<'a> {
    /// Use these shaders instead of the defaults
    pub fn with_shaders(mut self, vertex: &'a Shader, fragment: &'a Shader) -> Self {
        self.vertex_shader = Some(vertex);
        self.fragment_shader = Some(fragment);
        self
    }

    /// Replace the flags
    pub fn with_flags(mut self, flags: PipelineFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the line width
    pub fn with_line_width(mut self, line_width: f32) -> Self {
        self.line_width = line_width;
        self
    }
}

impl Default for RenderState<'_> {
    fn default() -> Self {
        Self {
            vertex_shader: None,
            fragment_shader: None,
            flags: PipelineFlags::BLEND,
            line_width: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec2;
    use std::mem::size_of;

    #[test]
    fn test_gpu_instance_layout() {
        assert_eq!(size_of::<GpuInstance>(), 80);
        let instance = Instance2D::new(Transform2D::from_position(Vec2::new(3.0, -2.0)))
            .with_tint(Color::rgba(0.5, 0.25, 1.0, 0.5));
        let gpu = GpuInstance::from(&instance);
        assert_eq!(gpu.model[3][0], 3.0);
        assert_eq!(gpu.model[3][1], -2.0);
        assert_eq!(gpu.model[0][0], 1.0);
        assert_eq!(gpu.tint, [0.5, 0.25, 1.0, 0.5]);
    }

    #[test]
    fn test_default_render_state_blends() {
        let state = RenderState::default();
        assert!(state.flags.contains(PipelineFlags::BLEND));
        assert_eq!(state.line_width, 1.0);
        assert!(state.vertex_shader.is_none());
    }
}
