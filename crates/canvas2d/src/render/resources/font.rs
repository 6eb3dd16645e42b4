//! Fonts rasterized on demand into a glyph atlas
//!
//! Glyphs are rasterized with `fontdue` the first time they are requested and
//! packed into the font's [`Atlas`]. Coverage becomes the alpha channel of a
//! white texel, so text is coloured by the instance tint.
//!
//! Layout runs in two passes: every missing glyph of the string is packed
//! first, then quads are built against the final atlas extent. Growing the
//! atlas rescales every UV, so quads built before a later glyph is added go
//! stale; [`Font::layout_cached`] only reads the cache and cannot grow it.

use fontdue::FontSettings;
use std::collections::HashMap;
use std::fmt;

use super::{Bitmap, Texture};
use crate::render::atlas::{Atlas, AtlasId, UvRect};
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::geometry::{Geometry, Vertex};

const INITIAL_ATLAS_EXTENT: u32 = 256;
const GLYPH_PADDING: u32 = 1;

/// Placement of a rasterized glyph relative to the pen
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlyphMetrics {
    /// Bitmap width in pixels
    pub width: u32,
    /// Bitmap height in pixels
    pub height: u32,
    /// Left edge relative to the pen
    pub xmin: i32,
    /// Bottom edge above the baseline
    pub ymin: i32,
    /// Horizontal pen advance
    pub advance_width: f32,
}

impl From<fontdue::Metrics> for GlyphMetrics {
    fn from(metrics: fontdue::Metrics) -> Self {
        Self {
            width: metrics.width as u32,
            height: metrics.height as u32,
            xmin: metrics.xmin,
            ymin: metrics.ymin,
            advance_width: metrics.advance_width,
        }
    }
}

/// A cached glyph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    /// Pen placement
    pub metrics: GlyphMetrics,
    /// Atlas entry, `None` for blank glyphs such as space
    pub id: Option<AtlasId>,
}

/// Vertical metrics of a line of text
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMetrics {
    /// Baseline offset from the top of the line
    pub ascent: f32,
    /// Distance between consecutive baselines
    pub line_height: f32,
}

/// Rasterized glyphs and the atlas holding them
struct GlyphCache {
    atlas: Atlas,
    glyphs: HashMap<char, Glyph>,
}

impl GlyphCache {
    fn new(atlas: Atlas) -> Self {
        Self {
            atlas,
            glyphs: HashMap::new(),
        }
    }

    /// Pack every uncached character of `chars`, rasterized by `raster`, in one upload
    fn preload(
        &mut self,
        chars: impl IntoIterator<Item = char>,
        mut raster: impl FnMut(char) -> (GlyphMetrics, Vec<u8>),
    ) -> RenderResult<()> {
        let mut bulk = self.atlas.bulk();
        for c in chars {
            if c == '\n' || self.glyphs.contains_key(&c) {
                continue;
            }
            let (metrics, coverage) = raster(c);
            let id = if metrics.width == 0 || metrics.height == 0 {
                None
            } else {
                Some(bulk.add(Bitmap::from_coverage(metrics.width, metrics.height, &coverage))?)
            };
            self.glyphs.insert(c, Glyph { metrics, id });
        }
        bulk.submit()
    }

    fn layout(&self, text: &str, line: LineMetrics) -> RenderResult<Geometry> {
        layout_with(text, line, |c| {
            let glyph = self
                .glyphs
                .get(&c)
                .ok_or_else(|| RenderError::invalid(format!("glyph {c:?} has not been loaded")))?;
            Ok((glyph.metrics, glyph.id.and_then(|id| self.atlas.get(id))))
        })
    }
}

/// A font at one pixel size
pub struct Font {
    font: fontdue::Font,
    px: f32,
    line: LineMetrics,
    cache: GlyphCache,
}

impl Font {
    /// Parse TrueType or OpenType data for rendering at `px` pixels
    pub fn new(context: &Context, bytes: &[u8], px: f32) -> RenderResult<Self> {
        if !(px.is_finite() && px > 0.0) {
            return Err(RenderError::invalid(format!("font size must be positive, got {px}")));
        }
        let font = fontdue::Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| RenderError::invalid(format!("cannot parse font: {e}")))?;

        let line = font.horizontal_line_metrics(px).map_or(
            LineMetrics {
                ascent: px,
                line_height: px,
            },
            |metrics| LineMetrics {
                ascent: metrics.ascent,
                line_height: metrics.new_line_size,
            },
        );
        let name = font.name().unwrap_or("font").to_owned();
        let atlas = Atlas::new(
            context,
            format!("{name} {px}px"),
            INITIAL_ATLAS_EXTENT,
            INITIAL_ATLAS_EXTENT,
            GLYPH_PADDING,
        )?;
        log::debug!("Loaded font '{}' at {}px", name, px);

        Ok(Self {
            font,
            px,
            line,
            cache: GlyphCache::new(atlas),
        })
    }

    /// Glyph for `c`, rasterizing it on first use
    pub fn glyph(&mut self, c: char) -> RenderResult<Glyph> {
        if let Some(glyph) = self.cache.glyphs.get(&c) {
            return Ok(*glyph);
        }
        let (metrics, coverage) = self.font.rasterize(c, self.px);
        let glyph = store_glyph(&mut self.cache.atlas, metrics.into(), &coverage)?;
        self.cache.glyphs.insert(c, glyph);
        Ok(glyph)
    }

    /// Cached glyph for `c`, if it has been loaded
    pub fn cached(&self, c: char) -> Option<Glyph> {
        self.cache.glyphs.get(&c).copied()
    }

    /// Rasterize every uncached character of `chars` in one upload
    pub fn preload(&mut self, chars: impl IntoIterator<Item = char>) -> RenderResult<()> {
        let Self { font, px, cache, .. } = self;
        cache.preload(chars, |c| {
            let (metrics, coverage) = font.rasterize(c, *px);
            (metrics.into(), coverage)
        })
    }

    /// Atlas UVs of a glyph against the current atlas extent
    pub fn uv(&self, glyph: &Glyph) -> Option<UvRect> {
        glyph.id.and_then(|id| self.cache.atlas.get(id))
    }

    /// Textured quads for `text`, top-left of the first line at the origin
    ///
    /// Loads the missing glyphs first. Newlines start a new line.
    /// Characters without ink only advance the pen.
    pub fn layout(&mut self, text: &str) -> RenderResult<Geometry> {
        self.preload(text.chars())?;
        self.layout_cached(text)
    }

    /// Quads for `text` from already loaded glyphs
    ///
    /// Fails with `InvalidArgument` if a character has not been loaded with
    /// [`Font::preload`] or [`Font::layout`].
    pub fn layout_cached(&self, text: &str) -> RenderResult<Geometry> {
        self.cache.layout(text, self.line)
    }

    /// Atlas texture holding the rasterized glyphs
    pub fn texture(&self) -> &Texture {
        self.cache.atlas.texture()
    }

    /// Pixel size
    pub fn px(&self) -> f32 {
        self.px
    }

    /// Vertical line metrics
    pub fn line_metrics(&self) -> LineMetrics {
        self.line
    }

    /// Number of cached glyphs
    pub fn cached_glyphs(&self) -> usize {
        self.cache.glyphs.len()
    }

    /// Whether the atlas lives on a live device
    pub fn is_valid(&self) -> bool {
        self.cache.atlas.texture().is_valid()
    }
}

impl fmt::Debug for Font {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Font")
            .field("name", &self.font.name())
            .field("px", &self.px)
            .field("glyphs", &self.cache.glyphs.len())
            .finish()
    }
}

fn store_glyph(atlas: &mut Atlas, metrics: GlyphMetrics, coverage: &[u8]) -> RenderResult<Glyph> {
    if metrics.width == 0 || metrics.height == 0 {
        return Ok(Glyph { metrics, id: None });
    }
    let id = atlas.add(&Bitmap::from_coverage(metrics.width, metrics.height, coverage))?;
    Ok(Glyph { metrics, id: Some(id) })
}

fn layout_with(
    text: &str,
    line: LineMetrics,
    mut glyph: impl FnMut(char) -> RenderResult<(GlyphMetrics, Option<UvRect>)>,
) -> RenderResult<Geometry> {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let mut pen_x = 0.0f32;
    let mut baseline = line.ascent;

    for c in text.chars() {
        if c == '\n' {
            pen_x = 0.0;
            baseline += line.line_height;
            continue;
        }
        let (metrics, uv) = glyph(c)?;
        if let Some(uv) = uv {
            let left = pen_x + metrics.xmin as f32;
            let right = left + metrics.width as f32;
            let bottom = baseline - metrics.ymin as f32;
            let top = bottom - metrics.height as f32;

            let base = vertices.len() as u32;
            vertices.extend_from_slice(&[
                Vertex::new([left, top], [uv.min.x, uv.min.y]),
                Vertex::new([right, top], [uv.max.x, uv.min.y]),
                Vertex::new([right, bottom], [uv.max.x, uv.max.y]),
                Vertex::new([left, bottom], [uv.min.x, uv.max.y]),
            ]);
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        pen_x += metrics.advance_width;
    }
    Ok(Geometry::new(vertices, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec2;
    use approx::assert_relative_eq;

    fn metrics(width: u32, height: u32, ymin: i32, advance_width: f32) -> GlyphMetrics {
        GlyphMetrics {
            width,
            height,
            xmin: 1,
            ymin,
            advance_width,
        }
    }

    #[test]
    fn test_invalid_font_data() {
        let context = Context::headless();
        assert!(matches!(
            Font::new(&context, b"not a font", 16.0),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(Font::new(&context, &[], 0.0), Err(RenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_glyph_coverage_lands_in_atlas() {
        let context = Context::headless();
        let mut atlas = Atlas::new(&context, "glyphs", 16, 16, 1).unwrap();
        let coverage: Vec<u8> = (0..6).map(|i| i * 40).collect();
        let glyph = store_glyph(&mut atlas, metrics(3, 2, 0, 4.0), &coverage).unwrap();

        let rect = atlas.rect(glyph.id.unwrap()).unwrap();
        let pixels = atlas.texture().read_pixels().unwrap();
        assert_eq!(pixels.get_pixel(rect.x + 2, rect.y + 1).0, [255, 255, 255, 200]);
    }

    #[test]
    fn test_blank_glyph_has_no_entry() {
        let context = Context::headless();
        let mut atlas = Atlas::new(&context, "glyphs", 16, 16, 1).unwrap();
        let glyph = store_glyph(&mut atlas, metrics(0, 0, 0, 5.0), &[]).unwrap();
        assert_eq!(glyph.id, None);
        assert!(atlas.is_empty());
    }

    fn square_glyphs(_: char) -> (GlyphMetrics, Vec<u8>) {
        (metrics(8, 8, 0, 9.0), vec![255; 64])
    }

    #[test]
    fn test_layout_uvs_follow_atlas_growth() {
        let context = Context::headless();
        let mut cache = GlyphCache::new(Atlas::new(&context, "glyphs", 16, 16, 1).unwrap());
        let line = LineMetrics {
            ascent: 8.0,
            line_height: 10.0,
        };
        cache.preload("abcdef".chars(), square_glyphs).unwrap();
        assert_ne!(cache.atlas.extent(), (16, 16));

        let geometry = cache.layout("abcdef", line).unwrap();
        let uv = cache.atlas.get(cache.glyphs[&'a'].id.unwrap()).unwrap();
        assert_relative_eq!(geometry.vertices[0].uv[0], uv.min.x);
        assert_relative_eq!(geometry.vertices[0].uv[1], uv.min.y);
        assert_relative_eq!(geometry.vertices[2].uv[0], uv.max.x);
        assert_relative_eq!(geometry.vertices[2].uv[1], uv.max.y);
    }

    #[test]
    fn test_cached_layout_requires_loaded_glyphs() {
        let context = Context::headless();
        let mut cache = GlyphCache::new(Atlas::new(&context, "glyphs", 64, 64, 1).unwrap());
        let line = LineMetrics {
            ascent: 8.0,
            line_height: 10.0,
        };
        assert!(matches!(cache.layout("hi", line), Err(RenderError::InvalidArgument(_))));

        cache.preload("hi\nhi".chars(), square_glyphs).unwrap();
        assert_eq!(cache.glyphs.len(), 2);
        let shared = &cache;
        let first = shared.layout("hi\nih", line).unwrap();
        let second = shared.layout("hi\nih", line).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.vertices.len(), 16);
    }

    #[test]
    fn test_layout_places_quads_on_baseline() {
        let line = LineMetrics {
            ascent: 10.0,
            line_height: 14.0,
        };
        let uv = UvRect {
            min: Vec2::new(0.0, 0.0),
            max: Vec2::new(0.5, 0.5),
        };
        let geometry = layout_with("a b\nc", line, |c| {
            Ok(match c {
                ' ' => (metrics(0, 0, 0, 3.0), None),
                _ => (metrics(4, 6, -2, 5.0), Some(uv)),
            })
        })
        .unwrap();

        assert_eq!(geometry.vertices.len(), 12);
        assert_eq!(geometry.indices.len(), 18);
        // 'a' spans baseline 10, descending 2 below it
        assert_relative_eq!(geometry.vertices[0].position[0], 1.0);
        assert_relative_eq!(geometry.vertices[0].position[1], 6.0);
        assert_relative_eq!(geometry.vertices[2].position[1], 12.0);
        // 'b' after 'a' and the space
        assert_relative_eq!(geometry.vertices[4].position[0], 9.0);
        // 'c' on the second line
        assert_relative_eq!(geometry.vertices[8].position[0], 1.0);
        assert_relative_eq!(geometry.vertices[8].position[1], 20.0);
        assert_eq!(geometry.indices[6], 4);
    }
}
