//! Ready-made drawables
//!
//! Each primitive owns its geometry and instance list and lends them out as a
//! [`Drawable`]. Textures and fonts are borrowed, so many primitives can share
//! one.

use crate::foundation::math::{Color, Transform2D, Vec2};
use crate::render::context::Context;
use crate::render::drawable::{Drawable, Instance2D};
use crate::render::error::RenderResult;
use crate::render::geometry::Geometry;
use crate::render::resources::{Font, GeometryBuffer, Texture};

/// Anything that can be handed to a surface
pub trait Primitive {
    /// Borrow the draw data
    fn drawable(&self) -> Drawable<'_>;
}

fn scaled(mut geometry: Geometry, width: f32, height: f32) -> Geometry {
    for vertex in &mut geometry.vertices {
        vertex.position[0] *= width;
        vertex.position[1] *= height;
    }
    geometry
}

/// Arbitrary geometry with any number of instances
pub struct Mesh<'a> {
    geometry: GeometryBuffer,
    texture: Option<&'a Texture>,
    instances: Vec<Instance2D>,
    material: Option<Vec<u8>>,
}

impl<'a> Mesh<'a> {
    /// Upload `geometry` as a mesh with one identity instance
    pub fn new(context: &Context, name: impl Into<String>, geometry: &Geometry) -> RenderResult<Self> {
        let mut buffer = GeometryBuffer::new(context, name);
        buffer.write(geometry)?;
        Ok(Self {
            geometry: buffer,
            texture: None,
            instances: vec![Instance2D::default()],
            material: None,
        })
    }

    /// Sample `texture`
    pub fn with_texture(mut self, texture: &'a Texture) -> Self {
        self.texture = Some(texture);
        self
    }

    /// Material uniform bytes
    pub fn with_material(mut self, material: impl Into<Vec<u8>>) -> Self {
        self.material = Some(material.into());
        self
    }

    /// Replace the geometry
    pub fn set_geometry(&mut self, geometry: &Geometry) -> RenderResult<()> {
        self.geometry.write(geometry)
    }

    /// Drawn copies
    pub fn instances(&self) -> &[Instance2D] {
        &self.instances
    }

    /// Drawn copies, for editing
    pub fn instances_mut(&mut self) -> &mut Vec<Instance2D> {
        &mut self.instances
    }
}

impl Primitive for Mesh<'_> {
    fn drawable(&self) -> Drawable<'_> {
        Drawable {
            geometry: &self.geometry,
            texture: self.texture,
            instances: &self.instances,
            material: self.material.as_deref(),
        }
    }
}

/// Single-instance primitives share this shape
macro_rules! single_instance {
    ($ty:ty) => {
        impl $ty {
            /// World transform
            pub fn transform(&self) -> Transform2D {
                self.instance[0].transform
            }

            /// Move, rotate or scale
            pub fn set_transform(&mut self, transform: Transform2D) {
                self.instance[0].transform = transform;
            }

            /// Move to `position`
            pub fn set_position(&mut self, position: Vec2) {
                self.instance[0].transform.position = position;
            }

            /// Replace the tint
            pub fn set_tint(&mut self, tint: Color) {
                self.instance[0].tint = tint;
            }
        }
    };
}

/// A texture drawn at its pixel size, centred on its position
pub struct Sprite<'a> {
    quad: GeometryBuffer,
    texture: &'a Texture,
    instance: [Instance2D; 1],
}

impl<'a> Sprite<'a> {
    /// Sprite showing all of `texture`
    pub fn new(context: &Context, texture: &'a Texture) -> RenderResult<Self> {
        let extent = texture.extent();
        let mut quad = GeometryBuffer::new(context, format!("sprite {}", texture.name()));
        if extent.width > 0 && extent.height > 0 {
            quad.write(&scaled(Geometry::quad(), extent.width as f32, extent.height as f32))?;
        }
        Ok(Self {
            quad,
            texture,
            instance: [Instance2D::default()],
        })
    }
}

single_instance!(Sprite<'_>);

impl Primitive for Sprite<'_> {
    fn drawable(&self) -> Drawable<'_> {
        Drawable::new(&self.quad, &self.instance).with_texture(self.texture)
    }
}

/// A solid rectangle centred on its position
pub struct Quad {
    geometry: GeometryBuffer,
    instance: [Instance2D; 1],
}

impl Quad {
    /// `width` x `height` rectangle of `color`
    pub fn new(context: &Context, width: f32, height: f32, color: Color) -> RenderResult<Self> {
        let mut geometry = GeometryBuffer::new(context, "quad");
        geometry.write(&scaled(Geometry::quad(), width, height))?;
        Ok(Self {
            geometry,
            instance: [Instance2D::default().with_tint(color)],
        })
    }
}

single_instance!(Quad);

impl Primitive for Quad {
    fn drawable(&self) -> Drawable<'_> {
        Drawable::new(&self.geometry, &self.instance)
    }
}

/// A solid disc centred on its position
pub struct Circle {
    geometry: GeometryBuffer,
    instance: [Instance2D; 1],
}

impl Circle {
    /// Disc of `radius` approximated by `segments` triangles
    pub fn new(context: &Context, radius: f32, segments: u32, color: Color) -> RenderResult<Self> {
        let mut geometry = GeometryBuffer::new(context, "circle");
        geometry.write(&scaled(Geometry::circle(segments), radius * 2.0, radius * 2.0))?;
        Ok(Self {
            geometry,
            instance: [Instance2D::default().with_tint(color)],
        })
    }
}

single_instance!(Circle);

impl Primitive for Circle {
    fn drawable(&self) -> Drawable<'_> {
        Drawable::new(&self.geometry, &self.instance)
    }
}

/// A run of text laid out with a [`Font`]
///
/// The first line's top-left corner sits at the position. Text is white
/// until tinted. Its glyphs must already be loaded into the font, with
/// [`Font::preload`] or [`Font::layout`]. Texts borrow the font shared, so any
/// number of them can use one font and its atlas cannot grow under them.
pub struct Text<'a> {
    font: &'a Font,
    text: String,
    geometry: GeometryBuffer,
    instance: [Instance2D; 1],
}

impl<'a> Text<'a> {
    /// Lay out `text` from glyphs `font` has already loaded
    ///
    /// Fails with `InvalidArgument` if a character was never loaded.
    pub fn new(context: &Context, font: &'a Font, text: impl Into<String>) -> RenderResult<Self> {
        let text = text.into();
        let layout = font.layout_cached(&text)?;
        let mut geometry = GeometryBuffer::new(context, "text");
        if !layout.vertices.is_empty() {
            geometry.write(&layout)?;
        }
        Ok(Self {
            font,
            text,
            geometry,
            instance: [Instance2D::default()],
        })
    }

    /// The laid out string
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Font the text was laid out with
    pub fn font(&self) -> &Font {
        self.font
    }
}

single_instance!(Text<'_>);

impl Primitive for Text<'_> {
    fn drawable(&self) -> Drawable<'_> {
        Drawable::new(&self.geometry, &self.instance).with_texture(self.font.texture())
    }
}

/// Any of the built-in primitives
pub enum Shape<'a> {
    /// See [`Mesh`]
    Mesh(Mesh<'a>),
    /// See [`Sprite`]
    Sprite(Sprite<'a>),
    /// See [`Text`]
    Text(Text<'a>),
    /// See [`Quad`]
    Quad(Quad),
    /// See [`Circle`]
    Circle(Circle),
}

impl Primitive for Shape<'_> {
    fn drawable(&self) -> Drawable<'_> {
        match self {
            Self::Mesh(mesh) => mesh.drawable(),
            Self::Sprite(sprite) => sprite.drawable(),
            Self::Text(text) => text.drawable(),
            Self::Quad(quad) => quad.drawable(),
            Self::Circle(circle) => circle.drawable(),
        }
    }
}

impl<'a> From<Mesh<'a>> for Shape<'a> {
    fn from(mesh: Mesh<'a>) -> Self {
        Self::Mesh(mesh)
    }
}

impl<'a> From<Sprite<'a>> for Shape<'a> {
    fn from(sprite: Sprite<'a>) -> Self {
        Self::Sprite(sprite)
    }
}

impl<'a> From<Text<'a>> for Shape<'a> {
    fn from(text: Text<'a>) -> Self {
        Self::Text(text)
    }
}

impl From<Quad> for Shape<'_> {
    fn from(quad: Quad) -> Self {
        Self::Quad(quad)
    }
}

impl From<Circle> for Shape<'_> {
    fn from(circle: Circle) -> Self {
        Self::Circle(circle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::resources::Bitmap;
    use approx::assert_relative_eq;

    #[test]
    fn test_quad_scaled_and_tinted() {
        let context = Context::headless();
        let quad = Quad::new(&context, 4.0, 2.0, Color::MAGENTA).unwrap();
        let drawable = quad.drawable();
        let corner = drawable.geometry.geometry().vertices[2].position;
        assert_relative_eq!(corner[0], 2.0);
        assert_relative_eq!(corner[1], 1.0);
        assert_eq!(drawable.instances[0].tint, Color::MAGENTA);
        assert!(drawable.texture.is_none());
    }

    #[test]
    fn test_sprite_matches_texture_size() {
        let context = Context::headless();
        let texture = Texture::from_bitmap(&context, "player", &Bitmap::filled(16, 8, Color::WHITE)).unwrap();
        let mut sprite = Sprite::new(&context, &texture).unwrap();
        sprite.set_position(Vec2::new(5.0, 6.0));

        let drawable = sprite.drawable();
        assert_relative_eq!(drawable.geometry.geometry().vertices[0].position[0], -8.0);
        assert_relative_eq!(drawable.geometry.geometry().vertices[0].position[1], -4.0);
        assert_eq!(drawable.instances[0].transform.position, Vec2::new(5.0, 6.0));
        assert!(drawable.texture.is_some());
    }

    #[test]
    fn test_shape_delegates() {
        let context = Context::headless();
        let mut mesh = Mesh::new(&context, "mesh", &Geometry::quad())
            .unwrap()
            .with_material(vec![1, 2, 3, 4]);
        mesh.instances_mut().push(Instance2D::default());

        let shapes: Vec<Shape<'_>> = vec![
            mesh.into(),
            Circle::new(&context, 3.0, 12, Color::WHITE).unwrap().into(),
        ];
        let drawable = shapes[0].drawable();
        assert_eq!(drawable.instances.len(), 2);
        assert_eq!(drawable.material, Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(shapes[1].drawable().geometry.vertex_count(), 13);
    }

    #[test]
    fn test_circle_radius() {
        let context = Context::headless();
        let circle = Circle::new(&context, 3.0, 4, Color::WHITE).unwrap();
        let drawable = circle.drawable();
        let geometry = drawable.geometry.geometry();
        assert_relative_eq!(geometry.vertices[1].position[0], 3.0);
        assert_eq!(geometry.vertices.len(), 5);
    }
}
