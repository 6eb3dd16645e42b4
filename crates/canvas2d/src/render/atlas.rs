//! Shelf-packed texture atlas
//!
//! Images are placed left to right along horizontal shelves, with `padding`
//! empty texels around every image and along the atlas border. When an image
//! does not fit on the current shelf a new shelf is opened below it, and when
//! the atlas runs out of rows its texture doubles in size. The old pixels are
//! blitted into the top left of the larger texture, so rects handed out
//! earlier keep their pixel position; only their UVs change.

use slotmap::SlotMap;
use std::fmt;

use crate::foundation::math::{Color, Vec2};
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::resources::{Bitmap, Region, Texture};

/// Largest width or height an atlas may reach
pub const MAX_ATLAS_EXTENT: u32 = 8192;

slotmap::new_key_type! {
    /// Key of one image in an [`Atlas`]
    pub struct AtlasId;
}

/// Normalized texture coordinates of an atlas entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRect {
    /// Top-left corner
    pub min: Vec2,
    /// Bottom-right corner
    pub max: Vec2,
}

impl UvRect {
    /// UVs of `region` inside a `width` x `height` image
    pub fn from_region(region: Region, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        Self {
            min: Vec2::new(region.x as f32 / w, region.y as f32 / h),
            max: Vec2::new((region.x + region.width) as f32 / w, (region.y + region.height) as f32 / h),
        }
    }
}

/// Where [`ShelfPacker::pack`] placed an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Pixel rect of the image
    pub region: Region,
    /// New atlas extent, when the atlas had to grow
    pub grown: Option<(u32, u32)>,
}

/// Shelf packing over a power-of-two canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfPacker {
    width: u32,
    height: u32,
    padding: u32,
    x: u32,
    shelf_y: u32,
    shelf_height: u32,
}

impl ShelfPacker {
    /// Empty packer, extents rounded up to powers of two
    pub fn new(width: u32, height: u32, padding: u32) -> RenderResult<Self> {
        let width = width.max(1).next_power_of_two();
        let height = height.max(1).next_power_of_two();
        if width > MAX_ATLAS_EXTENT || height > MAX_ATLAS_EXTENT {
            return Err(RenderError::invalid(format!(
                "atlas {width}x{height} exceeds the {MAX_ATLAS_EXTENT} limit"
            )));
        }
        Ok(Self {
            width,
            height,
            padding,
            x: padding,
            shelf_y: padding,
            shelf_height: 0,
        })
    }

    /// Current canvas extent
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Place a `width` x `height` image
    ///
    /// The packer is left untouched when the image cannot be placed without
    /// exceeding [`MAX_ATLAS_EXTENT`].
    pub fn pack(&mut self, width: u32, height: u32) -> RenderResult<Placement> {
        if width == 0 || height == 0 {
            return Err(RenderError::invalid("cannot pack an empty image"));
        }
        if width > MAX_ATLAS_EXTENT || height > MAX_ATLAS_EXTENT {
            return Err(RenderError::invalid(format!(
                "image {width}x{height} exceeds the {MAX_ATLAS_EXTENT} atlas limit"
            )));
        }

        let pad = self.padding;
        let mut next = self.clone();
        if next.x > pad && next.x + width + pad > next.width {
            next.shelf_y += next.shelf_height;
            next.x = pad;
            next.shelf_height = 0;
        }
        while next.x + width + pad > next.width {
            next.width *= 2;
        }
        while next.shelf_y + height + pad > next.height {
            next.height *= 2;
        }
        if next.width > MAX_ATLAS_EXTENT || next.height > MAX_ATLAS_EXTENT {
            return Err(RenderError::invalid(format!(
                "atlas would need {}x{}, over the {MAX_ATLAS_EXTENT} limit",
                next.width, next.height
            )));
        }

        let region = Region::new(next.x, next.shelf_y, width, height);
        next.x += width + pad;
        next.shelf_height = next.shelf_height.max(height + pad);

        let grown = (next.extent() != self.extent()).then(|| next.extent());
        *self = next;
        Ok(Placement { region, grown })
    }
}

/// A texture shared by many small images
pub struct Atlas {
    texture: Texture,
    packer: ShelfPacker,
    rects: SlotMap<AtlasId, Region>,
}

impl Atlas {
    /// Transparent atlas of at least `width` x `height`
    pub fn new(context: &Context, name: impl Into<String>, width: u32, height: u32, padding: u32) -> RenderResult<Self> {
        let packer = ShelfPacker::new(width, height, padding)?;
        let (width, height) = packer.extent();
        let mut texture = Texture::new(context, name);
        texture.write(&Bitmap::filled(width, height, Color::TRANSPARENT))?;
        Ok(Self {
            texture,
            packer,
            rects: SlotMap::with_key(),
        })
    }

    /// Pack `bitmap` and copy it in
    ///
    /// The shelf cursor only advances once the pixels are in. If the copy
    /// fails after the texture grew, the larger extent is kept and nothing
    /// else changes.
    pub fn add(&mut self, bitmap: &Bitmap) -> RenderResult<AtlasId> {
        let (packer, region) = self.plan(bitmap)?;
        self.texture.overwrite(bitmap, region)?;
        self.packer = packer;
        Ok(self.rects.insert(region))
    }

    /// Reserve space for `bitmap`, growing the texture when needed
    fn place(&mut self, bitmap: &Bitmap) -> RenderResult<Region> {
        let (packer, region) = self.plan(bitmap)?;
        self.packer = packer;
        Ok(region)
    }

    /// Packer state after placing `bitmap`, with the texture grown to match
    fn plan(&mut self, bitmap: &Bitmap) -> RenderResult<(ShelfPacker, Region)> {
        bitmap.validate()?;
        let mut packer = self.packer.clone();
        let placement = packer.pack(bitmap.width, bitmap.height)?;
        if let Some((width, height)) = placement.grown {
            self.texture.grow(width, height)?;
            self.packer.width = width;
            self.packer.height = height;
        }
        Ok((packer, placement.region))
    }

    /// UVs of an entry against the current extent
    pub fn get(&self, id: AtlasId) -> Option<UvRect> {
        let (width, height) = self.packer.extent();
        self.rects.get(id).map(|&region| UvRect::from_region(region, width, height))
    }

    /// Pixel rect of an entry
    pub fn rect(&self, id: AtlasId) -> Option<Region> {
        self.rects.get(id).copied()
    }

    /// Backing texture
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    /// Current extent
    pub fn extent(&self) -> (u32, u32) {
        self.packer.extent()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    /// Whether nothing has been added
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Batch several adds into one upload
    pub fn bulk(&mut self) -> Bulk<'_> {
        Bulk {
            atlas: self,
            pending: Vec::new(),
        }
    }
}

impl fmt::Debug for Atlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atlas")
            .field("texture", &self.texture)
            .field("packer", &self.packer)
            .field("entries", &self.rects.len())
            .finish()
    }
}

/// Pending atlas adds
///
/// Space is reserved as soon as an image is added, so ids and UVs are usable
/// immediately. The pixels are copied in one transfer submission on
/// [`Bulk::submit`] or drop.
pub struct Bulk<'a> {
    atlas: &'a mut Atlas,
    pending: Vec<(Bitmap, Region)>,
}

impl Bulk<'_> {
    /// Reserve space for `bitmap` and queue its upload
    pub fn add(&mut self, bitmap: Bitmap) -> RenderResult<AtlasId> {
        let region = self.atlas.place(&bitmap)?;
        self.pending.push((bitmap, region));
        Ok(self.atlas.rects.insert(region))
    }

    /// UVs of an entry, including queued ones
    pub fn get(&self, id: AtlasId) -> Option<UvRect> {
        self.atlas.get(id)
    }

    /// Number of queued uploads
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Upload everything queued
    pub fn submit(mut self) -> RenderResult<()> {
        self.flush()
    }

    fn flush(&mut self) -> RenderResult<()> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }
        let updates: Vec<(&Bitmap, Region)> = pending.iter().map(|(bitmap, region)| (bitmap, *region)).collect();
        self.atlas.texture.overwrite_many(&updates)
    }
}

impl Drop for Bulk<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Atlas bulk upload to '{}' failed: {}", self.atlas.texture.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::HeadlessDevice;
    use std::rc::Rc;

    #[test]
    fn test_shelf_wraps_and_grows() {
        let mut packer = ShelfPacker::new(16, 16, 0).unwrap();
        let a = packer.pack(10, 4).unwrap();
        let b = packer.pack(10, 6).unwrap();
        assert_eq!(a.region, Region::new(0, 0, 10, 4));
        assert_eq!(b.region, Region::new(0, 4, 10, 6));
        assert_eq!(b.grown, None);

        let c = packer.pack(4, 8).unwrap();
        assert_eq!(c.region, Region::new(10, 4, 4, 8));
        let d = packer.pack(8, 8).unwrap();
        assert_eq!(d.region, Region::new(0, 12, 8, 8));
        assert_eq!(d.grown, Some((16, 32)));
    }

    #[test]
    fn test_padding_separates_entries() {
        let mut packer = ShelfPacker::new(32, 32, 2).unwrap();
        let a = packer.pack(4, 4).unwrap().region;
        let b = packer.pack(4, 4).unwrap().region;
        assert_eq!(b.x, a.x + 6);
    }

    #[test]
    fn test_padding_borders_and_wraps() {
        let mut packer = ShelfPacker::new(16, 16, 2).unwrap();
        let a = packer.pack(10, 4).unwrap();
        assert_eq!(a.region, Region::new(2, 2, 10, 4));

        // 14 + 2 reaches the edge but leaves no room for the trailing pad
        let b = packer.pack(2, 2).unwrap();
        assert_eq!(b.region, Region::new(2, 8, 2, 2));
        assert_eq!(b.grown, None);

        let mut fresh = ShelfPacker::new(16, 16, 2).unwrap();
        assert_eq!(fresh.pack(12, 12).unwrap().grown, None);
        let mut fresh = ShelfPacker::new(16, 16, 2).unwrap();
        assert_eq!(fresh.pack(13, 1).unwrap().grown, Some((32, 16)));
    }

    #[test]
    fn test_extents_are_powers_of_two() {
        let packer = ShelfPacker::new(100, 3, 0).unwrap();
        assert_eq!(packer.extent(), (128, 4));
        assert!(ShelfPacker::new(MAX_ATLAS_EXTENT + 1, 1, 0).is_err());
    }

    #[test]
    fn test_oversized_image_leaves_packer_untouched() {
        let mut packer = ShelfPacker::new(64, 64, 0).unwrap();
        packer.pack(8, 8).unwrap();
        let before = packer.clone();
        assert!(matches!(packer.pack(MAX_ATLAS_EXTENT + 1, 1), Err(RenderError::InvalidArgument(_))));
        assert!(matches!(packer.pack(1, 0), Err(RenderError::InvalidArgument(_))));
        assert_eq!(packer, before);
    }

    #[test]
    fn test_entries_in_bounds_and_disjoint() {
        let context = Context::headless();
        let mut atlas = Atlas::new(&context, "atlas", 32, 32, 1).unwrap();
        let ids: Vec<AtlasId> = (1..=20)
            .map(|i| atlas.add(&Bitmap::filled(i % 7 + 1, i % 5 + 2, Color::WHITE)).unwrap())
            .collect();

        let (width, height) = atlas.extent();
        assert!(width.is_power_of_two() && height.is_power_of_two());
        for (i, &id) in ids.iter().enumerate() {
            let rect = atlas.rect(id).unwrap();
            assert!(rect.fits_within(width, height));
            let uv = atlas.get(id).unwrap();
            assert!(uv.min.x >= 0.0 && uv.min.y >= 0.0 && uv.max.x <= 1.0 && uv.max.y <= 1.0);
            for &other in &ids[i + 1..] {
                assert!(!rect.overlaps(&atlas.rect(other).unwrap()));
            }
        }
    }

    #[test]
    fn test_growth_preserves_pixels() {
        let context = Context::headless();
        let mut atlas = Atlas::new(&context, "atlas", 8, 8, 0).unwrap();
        let red = Color::rgb(1.0, 0.0, 0.0);
        let first = atlas.add(&Bitmap::filled(8, 6, red)).unwrap();
        let second = atlas.add(&Bitmap::filled(4, 4, Color::WHITE)).unwrap();

        assert_eq!(atlas.extent(), (8, 16));
        assert!(context.pending_releases() >= 1);
        let pixels = atlas.texture().read_pixels().unwrap();
        assert_eq!(pixels.dimensions(), (8, 16));
        assert_eq!(pixels.get_pixel(7, 5).0, [255, 0, 0, 255]);
        assert_eq!(pixels.get_pixel(0, 6).0, [255, 255, 255, 255]);
        assert_eq!(pixels.get_pixel(7, 15).0, [0, 0, 0, 0]);

        let uv = atlas.get(first).unwrap();
        approx::assert_relative_eq!(uv.max.y, 6.0 / 16.0);
        assert_eq!(atlas.rect(second), Some(Region::new(0, 6, 4, 4)));
    }

    #[test]
    fn test_bulk_submits_once() {
        let device = Rc::new(HeadlessDevice::new());
        let context = Context::new(device.clone(), 3);
        let mut atlas = Atlas::new(&context, "bulk", 64, 64, 0).unwrap();
        let before = device.submissions();

        let mut bulk = atlas.bulk();
        let ids: Vec<AtlasId> = (0..5)
            .map(|_| bulk.add(Bitmap::filled(8, 8, Color::WHITE)).unwrap())
            .collect();
        assert_eq!(bulk.pending(), 5);
        assert!(bulk.get(ids[4]).is_some());
        assert_eq!(device.submissions(), before);
        bulk.submit().unwrap();

        assert_eq!(device.submissions(), before + 1);
        assert_eq!(atlas.len(), 5);
        let pixels = atlas.texture().read_pixels().unwrap();
        assert_eq!(pixels.get_pixel(39, 7).0, [255, 255, 255, 255]);
        assert_eq!(pixels.get_pixel(40, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_bulk_flushes_on_drop() {
        let device = Rc::new(HeadlessDevice::new());
        let context = Context::new(device.clone(), 3);
        let mut atlas = Atlas::new(&context, "bulk", 16, 16, 0).unwrap();
        let before = device.submissions();
        {
            let mut bulk = atlas.bulk();
            bulk.add(Bitmap::filled(2, 2, Color::WHITE)).unwrap();
        }
        assert_eq!(device.submissions(), before + 1);
    }

    #[test]
    fn test_failed_copy_keeps_cursor() {
        let context = Context::headless();
        let mut atlas = Atlas {
            texture: Texture::new(&context, "blank"),
            packer: ShelfPacker::new(16, 16, 0).unwrap(),
            rects: SlotMap::with_key(),
        };
        let before = atlas.packer.clone();
        assert!(matches!(
            atlas.add(&Bitmap::filled(4, 4, Color::WHITE)),
            Err(RenderError::InvalidArgument(_))
        ));
        assert_eq!(atlas.packer, before);
        assert!(atlas.is_empty());
    }

    #[test]
    fn test_inactive_atlas_still_packs() {
        let mut atlas = Atlas::new(&Context::inactive(), "idle", 16, 16, 0).unwrap();
        let id = atlas.add(&Bitmap::filled(4, 4, Color::WHITE)).unwrap();
        assert!(!atlas.texture().is_valid());
        assert_eq!(atlas.rect(id), Some(Region::new(0, 0, 4, 4)));
    }
}
