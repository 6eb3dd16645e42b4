//! GPU resource handles
//!
//! Every handle is built against a [`Context`](crate::render::Context) and
//! owns its device allocations. Dropping a handle hands those allocations to
//! the context's deferred queue, so frames still in flight can finish reading
//! them.
//!
//! A handle built against an inactive context is empty: `is_valid()` is
//! false and writes succeed without doing anything.

pub mod font;
pub mod geometry_buffer;
pub mod shader;
pub mod texture;

pub use font::{Font, Glyph, GlyphMetrics, LineMetrics};
pub use geometry_buffer::GeometryBuffer;
pub use shader::{Shader, ShaderRef, ShaderStage};
pub use texture::Texture;

use crate::foundation::math::Color;
use crate::render::error::{RenderError, RenderResult};

/// Tightly packed RGBA8 pixels
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitmap {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major RGBA8 data, `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Wrap pixel data, checking its length
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> RenderResult<Self> {
        let bitmap = Self { width, height, pixels };
        bitmap.validate()?;
        Ok(bitmap)
    }

    /// Bitmap filled with one colour
    pub fn filled(width: u32, height: u32, color: Color) -> Self {
        let texel = color.to_rgba8();
        let pixels = texel.repeat(width as usize * height as usize);
        Self { width, height, pixels }
    }

    /// Expand single-channel coverage into white RGBA with coverage as alpha
    pub fn from_coverage(width: u32, height: u32, coverage: &[u8]) -> Self {
        let pixels = coverage.iter().flat_map(|&alpha| [255, 255, 255, alpha]).collect();
        Self { width, height, pixels }
    }

    /// Byte length a bitmap of this extent must have
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Check for a non-zero extent and matching data length
    pub fn validate(&self) -> RenderResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::invalid(format!(
                "bitmap extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        let expected = Self::expected_len(self.width, self.height);
        if self.pixels.len() != expected {
            return Err(RenderError::invalid(format!(
                "bitmap {}x{} needs {} bytes, got {}",
                self.width,
                self.height,
                expected,
                self.pixels.len()
            )));
        }
        Ok(())
    }

    /// RGBA of the pixel at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * 4;
        let texel = self.pixels.get(start..start + 4)?;
        Some([texel[0], texel[1], texel[2], texel[3]])
    }
}

impl From<image::RgbaImage> for Bitmap {
    fn from(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }
}

impl TryFrom<Bitmap> for image::RgbaImage {
    type Error = RenderError;

    fn try_from(bitmap: Bitmap) -> RenderResult<Self> {
        let (width, height) = (bitmap.width, bitmap.height);
        image::RgbaImage::from_raw(width, height, bitmap.pixels)
            .ok_or_else(|| RenderError::invalid(format!("pixel data does not fill {width}x{height}")))
    }
}

/// Pixel rectangle inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Region {
    /// Rectangle with its top-left corner at `(x, y)`
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether the region lies entirely within `width` x `height`
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|right| right <= width)
            && self.y.checked_add(self.height).is_some_and(|bottom| bottom <= height)
    }

    /// Whether two regions share any pixel
    pub fn overlaps(&self, other: &Region) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_length_checked() {
        assert!(Bitmap::new(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(Bitmap::new(2, 2, vec![0; 15]), Err(RenderError::InvalidArgument(_))));
        assert!(matches!(Bitmap::new(0, 2, Vec::new()), Err(RenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_coverage_expands_to_white() {
        let bitmap = Bitmap::from_coverage(2, 1, &[0, 200]);
        assert_eq!(bitmap.pixel(1, 0), Some([255, 255, 255, 200]));
        assert_eq!(bitmap.pixel(2, 0), None);
    }

    #[test]
    fn test_rgba_image_conversion() {
        let bitmap = Bitmap::filled(3, 2, Color::MAGENTA);
        let image: image::RgbaImage = bitmap.clone().try_into().unwrap();
        assert_eq!(image.get_pixel(2, 1).0, [255, 0, 255, 255]);
        assert_eq!(Bitmap::from(image), bitmap);
    }

    #[test]
    fn test_region_bounds() {
        assert!(Region::new(0, 0, 8, 8).fits_within(8, 8));
        assert!(!Region::new(5, 5, 10, 10).fits_within(8, 8));
        assert!(!Region::new(u32::MAX, 0, 2, 1).fits_within(8, 8));
        assert!(Region::new(0, 0, 4, 4).overlaps(&Region::new(3, 3, 4, 4)));
        assert!(!Region::new(0, 0, 4, 4).overlaps(&Region::new(4, 0, 4, 4)));
    }
}
