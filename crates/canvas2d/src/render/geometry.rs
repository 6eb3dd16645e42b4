//! Vertex layout and CPU-side geometry

use ash::vk;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::mem::size_of;

use crate::foundation::math::Color;

/// Vertex of 2D geometry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position in object space
    pub position: [f32; 2],
    /// Texture coordinate
    pub uv: [f32; 2],
    /// Vertex colour, multiplied with the texture and instance tint
    pub color: [f32; 4],
}

impl Vertex {
    /// White vertex at `position` with texture coordinate `uv`
    pub fn new(position: [f32; 2], uv: [f32; 2]) -> Self {
        Self {
            position,
            uv,
            color: Color::WHITE.to_array(),
        }
    }

    /// Replace the colour
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color.to_array();
        self
    }

    /// Binding description for a per-vertex buffer at binding 0
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Position, uv and colour at locations 0, 1 and 2
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32_SFLOAT,
                offset: 8,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 16,
            },
        ]
    }
}

/// How vertices are assembled into primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Topology {
    /// Independent triangles
    #[default]
    TriangleList,
    /// Strip of triangles sharing edges
    TriangleStrip,
    /// Independent line segments
    LineList,
    /// Connected line segments
    LineStrip,
    /// Individual points
    PointList,
}

impl Topology {
    /// Vulkan equivalent
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

/// How primitives are rasterised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolygonMode {
    /// Filled
    #[default]
    Fill,
    /// Edges only
    Line,
    /// Vertices only
    Point,
}

impl PolygonMode {
    /// Vulkan equivalent
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
            Self::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Vertices, optional indices and how to draw them
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Geometry {
    /// Vertex data
    pub vertices: Vec<Vertex>,
    /// Indices into `vertices`; empty for non-indexed drawing
    pub indices: Vec<u32>,
    /// Primitive assembly
    pub topology: Topology,
    /// Rasterisation mode
    pub polygon_mode: PolygonMode,
}

impl Geometry {
    /// Indexed triangle list
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            vertices,
            indices,
            ..Default::default()
        }
    }

    /// Replace the topology
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Replace the polygon mode
    pub fn with_polygon_mode(mut self, polygon_mode: PolygonMode) -> Self {
        self.polygon_mode = polygon_mode;
        self
    }

    /// Whether an index buffer is used
    pub fn is_indexed(&self) -> bool {
        !self.indices.is_empty()
    }

    /// Unit quad centred on the origin, uv (0,0) at the top left
    pub fn quad() -> Self {
        let vertices = vec![
            Vertex::new([-0.5, -0.5], [0.0, 0.0]),
            Vertex::new([0.5, -0.5], [1.0, 0.0]),
            Vertex::new([0.5, 0.5], [1.0, 1.0]),
            Vertex::new([-0.5, 0.5], [0.0, 1.0]),
        ];
        Self::new(vertices, vec![0, 1, 2, 2, 3, 0])
    }

    /// Unit-diameter disc as a triangle fan around the centre
    ///
    /// `segments` is clamped to at least 3.
    pub fn circle(segments: u32) -> Self {
        let segments = segments.max(3);
        let mut vertices = Vec::with_capacity(segments as usize + 1);
        vertices.push(Vertex::new([0.0, 0.0], [0.5, 0.5]));
        for i in 0..segments {
            let angle = i as f32 / segments as f32 * std::f32::consts::TAU;
            let (sin, cos) = angle.sin_cos();
            vertices.push(Vertex::new([cos * 0.5, sin * 0.5], [0.5 + cos * 0.5, 0.5 + sin * 0.5]));
        }

        let mut indices = Vec::with_capacity(segments as usize * 3);
        for i in 0..segments {
            indices.extend_from_slice(&[0, i + 1, (i + 1) % segments + 1]);
        }
        Self::new(vertices, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        assert_eq!(size_of::<Vertex>(), 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 8);
        assert_eq!(attributes[2].offset, 16);
        assert_eq!(Vertex::binding_description().stride, 32);
    }

    #[test]
    fn test_circle_indices_in_range() {
        let circle = Geometry::circle(16);
        assert_eq!(circle.vertices.len(), 17);
        assert_eq!(circle.indices.len(), 48);
        assert!(circle.indices.iter().all(|&i| (i as usize) < circle.vertices.len()));
        assert_eq!(Geometry::circle(1).vertices.len(), 4);
    }

    #[test]
    fn test_quad_is_indexed() {
        let quad = Geometry::quad();
        assert!(quad.is_indexed());
        assert_eq!(quad.topology, Topology::TriangleList);
    }
}
