use ash::vk;
use std::cell::OnceCell;
use std::fmt;
use std::path::Path;

use super::{Bitmap, Region};
use crate::foundation::math::Color;
use crate::render::backend::allocation::ImageCache;
use crate::render::backend::{GpuBuffer, GpuImage, GpuSampler, TransferOp};
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};

/// Pixel format of every texture
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

fn texture_usage() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC
}

/// A sampled RGBA8 image
pub struct Texture {
    context: Context,
    name: String,
    image: ImageCache,
    sampler: OnceCell<GpuSampler>,
    filter: vk::Filter,
}

impl Texture {
    /// Empty texture sampled with linear filtering
    pub fn new(context: &Context, name: impl Into<String>) -> Self {
        Self {
            context: context.clone(),
            name: name.into(),
            image: ImageCache::new(context, texture_usage()),
            sampler: OnceCell::new(),
            filter: vk::Filter::LINEAR,
        }
    }

    /// Use `filter` for magnification and minification
    pub fn with_filter(mut self, filter: vk::Filter) -> Self {
        if self.filter != filter {
            self.release_sampler();
            self.filter = filter;
        }
        self
    }

    /// Texture holding `bitmap`
    pub fn from_bitmap(context: &Context, name: impl Into<String>, bitmap: &Bitmap) -> RenderResult<Self> {
        if !context.is_active() {
            return Err(RenderError::InactiveInstance);
        }
        let mut texture = Self::new(context, name);
        texture.write(bitmap)?;
        Ok(texture)
    }

    /// Texture holding a decoded image
    pub fn from_image(context: &Context, name: impl Into<String>, image: image::RgbaImage) -> RenderResult<Self> {
        Self::from_bitmap(context, name, &Bitmap::from(image))
    }

    /// 1x1 texture of one colour
    pub fn solid(context: &Context, name: impl Into<String>, color: Color) -> RenderResult<Self> {
        Self::from_bitmap(context, name, &Bitmap::filled(1, 1, color))
    }

    /// Decode an image file
    pub fn load(context: &Context, path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let decoded = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(source) => RenderError::io(path, source),
            other => RenderError::invalid(format!("cannot decode {}: {}", path.display(), other)),
        })?;
        log::debug!("Decoded {} ({}x{})", path.display(), decoded.width(), decoded.height());
        Self::from_image(context, path.display().to_string(), decoded.to_rgba8())
    }

    /// Replace the contents with `bitmap`
    ///
    /// The image is reallocated when the extent changes. Fails with
    /// `InvalidArgument` for an empty or mis-sized bitmap.
    pub fn write(&mut self, bitmap: &Bitmap) -> RenderResult<()> {
        bitmap.validate()?;
        if !self.context.is_active() {
            return Ok(());
        }

        let extent = vk::Extent2D {
            width: bitmap.width,
            height: bitmap.height,
        };
        if self.image.refresh(extent, TEXTURE_FORMAT).is_none() {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        self.upload(&[(bitmap, Region::new(0, 0, bitmap.width, bitmap.height))])
    }

    /// Replace the pixels of `region` with `bitmap`
    ///
    /// The region must lie inside the texture and match the bitmap's extent;
    /// otherwise `InvalidArgument` is returned and nothing changes.
    pub fn overwrite(&mut self, bitmap: &Bitmap, region: Region) -> RenderResult<()> {
        self.overwrite_many(&[(bitmap, region)])
    }

    /// Several partial updates in one transfer submission
    ///
    /// All regions are checked before anything is written.
    pub fn overwrite_many(&mut self, updates: &[(&Bitmap, Region)]) -> RenderResult<()> {
        if !self.context.is_active() {
            return Ok(());
        }
        let Some(image) = self.image.get() else {
            return Err(RenderError::invalid(format!("texture '{}' has no contents", self.name)));
        };
        let extent = image.extent();

        for (bitmap, region) in updates {
            bitmap.validate()?;
            if !region.fits_within(extent.width, extent.height) {
                return Err(RenderError::invalid(format!(
                    "region {:?} outside {}x{} texture '{}'",
                    region, extent.width, extent.height, self.name
                )));
            }
            if bitmap.width != region.width || bitmap.height != region.height {
                return Err(RenderError::invalid(format!(
                    "bitmap {}x{} does not match region {}x{}",
                    bitmap.width, bitmap.height, region.width, region.height
                )));
            }
        }
        self.upload(updates)
    }

    fn upload(&self, updates: &[(&Bitmap, Region)]) -> RenderResult<()> {
        let (Some(backend), Some(image)) = (self.context.backend(), self.image.get()) else {
            return Ok(());
        };
        if updates.is_empty() {
            return Ok(());
        }

        // Staging buffers live until the synchronous submit returns.
        let staging = updates
            .iter()
            .map(|(bitmap, _)| GpuBuffer::with_data(backend, &bitmap.pixels, vk::BufferUsageFlags::TRANSFER_SRC))
            .collect::<RenderResult<Vec<_>>>()?;
        let ops: Vec<TransferOp<'_>> = staging
            .iter()
            .zip(updates)
            .map(|(src, (_, region))| TransferOp::Upload {
                src,
                dst: image,
                offset: [region.x, region.y],
                extent: vk::Extent2D {
                    width: region.width,
                    height: region.height,
                },
            })
            .collect();
        backend.submit_transfers(&ops)
    }

    /// Reallocate at `width` x `height`, keeping the old pixels at the top left
    ///
    /// The new area is cleared to transparent. The old image is deferred.
    pub fn grow(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let Some(backend) = self.context.backend().cloned() else {
            return Ok(());
        };
        let extent = vk::Extent2D { width, height };
        let clear = GpuBuffer::with_data(
            &backend,
            &vec![0; Bitmap::expected_len(width, height)],
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;

        let previous = self.image.replace(extent, TEXTURE_FORMAT);
        let Some(image) = self.image.get() else {
            if let Some(previous) = previous {
                self.context.defer(previous);
            }
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        };

        let mut ops = vec![TransferOp::Upload {
            src: &clear,
            dst: image,
            offset: [0, 0],
            extent,
        }];
        if let Some(previous) = previous.as_ref().filter(|previous| previous.is_valid()) {
            ops.push(TransferOp::Blit {
                src: previous,
                dst: image,
                dst_extent: previous.extent(),
            });
        }
        let result = backend.submit_transfers(&ops);
        drop(ops);

        if let Some(previous) = previous {
            self.context.defer(previous);
        }
        log::debug!("Texture '{}' grown to {}x{}", self.name, width, height);
        result
    }

    /// Copy into a new texture called `name`
    pub fn clone_named(&self, name: impl Into<String>) -> RenderResult<Texture> {
        let mut copy = Texture::new(&self.context, name).with_filter(self.filter);
        let (Some(backend), Some(source)) = (self.context.backend(), self.image.get()) else {
            return Ok(copy);
        };

        let Some(target) = copy.image.refresh(source.extent(), source.format()) else {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        };
        backend.submit_transfers(&[TransferOp::Copy { src: source, dst: target }])?;
        Ok(copy)
    }

    /// Read the pixels back from the device
    pub fn read_pixels(&self) -> RenderResult<image::RgbaImage> {
        let backend = self.context.backend().ok_or(RenderError::InactiveInstance)?;
        let image = self
            .image
            .get()
            .ok_or_else(|| RenderError::invalid(format!("texture '{}' has no contents", self.name)))?;
        let extent = image.extent();
        let pixels = backend.read_image(image)?;
        image::RgbaImage::from_raw(extent.width, extent.height, pixels)
            .ok_or_else(|| RenderError::invalid("readback size does not match the texture extent"))
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether there are pixels on a live device
    pub fn is_valid(&self) -> bool {
        self.context.is_active() && self.image.get().is_some_and(GpuImage::is_valid)
    }

    /// Pixel extent, zero when empty
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    /// Image view, null when empty
    pub fn view(&self) -> vk::ImageView {
        self.image.get().map_or(vk::ImageView::null(), GpuImage::view)
    }

    /// Sampler, created on first use
    pub fn sampler(&self) -> vk::Sampler {
        if self.sampler.get().is_none() {
            if let Some(backend) = self.context.backend() {
                match GpuSampler::new(backend, self.filter) {
                    Ok(sampler) => {
                        let _ = self.sampler.set(sampler);
                    }
                    Err(e) => log::error!("Sampler creation for '{}' failed: {}", self.name, e),
                }
            }
        }
        self.sampler.get().map_or(vk::Sampler::null(), GpuSampler::handle)
    }

    fn release_sampler(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            self.context.defer(sampler);
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.release_sampler();
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extent = self.extent();
        f.debug_struct("Texture")
            .field("name", &self.name)
            .field("extent", &(extent.width, extent.height))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: u32, height: u32) -> Bitmap {
        let mut pixels = Vec::with_capacity(Bitmap::expected_len(width, height));
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                pixels.extend_from_slice(&[v, x as u8, y as u8, 255]);
            }
        }
        Bitmap::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_write_then_read_back() {
        let context = Context::headless();
        let bitmap = checker(4, 3);
        let texture = Texture::from_bitmap(&context, "checker", &bitmap).unwrap();
        assert!(texture.is_valid());
        assert_eq!(texture.read_pixels().unwrap().into_raw(), bitmap.pixels);
    }

    #[test]
    fn test_out_of_bounds_overwrite_changes_nothing() {
        let context = Context::headless();
        let original = checker(8, 8);
        let mut texture = Texture::from_bitmap(&context, "target", &original).unwrap();

        let patch = Bitmap::filled(10, 10, Color::WHITE);
        let result = texture.overwrite(&patch, Region::new(5, 5, 10, 10));
        assert!(matches!(result, Err(RenderError::InvalidArgument(_))));
        assert_eq!(texture.read_pixels().unwrap().into_raw(), original.pixels);
    }

    #[test]
    fn test_overwrite_region() {
        let context = Context::headless();
        let mut texture = Texture::from_bitmap(&context, "target", &Bitmap::filled(4, 4, Color::BLACK)).unwrap();
        texture
            .overwrite(&Bitmap::filled(2, 1, Color::WHITE), Region::new(1, 2, 2, 1))
            .unwrap();

        let pixels = texture.read_pixels().unwrap();
        assert_eq!(pixels.get_pixel(1, 2).0, [255, 255, 255, 255]);
        assert_eq!(pixels.get_pixel(2, 2).0, [255, 255, 255, 255]);
        assert_eq!(pixels.get_pixel(0, 2).0, [0, 0, 0, 255]);
        assert_eq!(pixels.get_pixel(1, 1).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_mismatched_region_rejected() {
        let context = Context::headless();
        let mut texture = Texture::from_bitmap(&context, "target", &checker(8, 8)).unwrap();
        let result = texture.overwrite(&Bitmap::filled(2, 2, Color::WHITE), Region::new(0, 0, 3, 2));
        assert!(matches!(result, Err(RenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_clone_named_copies_pixels() {
        let context = Context::headless();
        let bitmap = checker(5, 5);
        let texture = Texture::from_bitmap(&context, "original", &bitmap).unwrap();
        let copy = texture.clone_named("copy").unwrap();

        assert_eq!(copy.name(), "copy");
        assert_ne!(copy.view(), texture.view());
        assert_eq!(copy.read_pixels().unwrap().into_raw(), bitmap.pixels);
        assert_eq!(context.stats().images_allocated, 2);
    }

    #[test]
    fn test_resize_defers_old_image() {
        let context = Context::headless();
        let mut texture = Texture::from_bitmap(&context, "t", &checker(2, 2)).unwrap();
        texture.write(&checker(4, 4)).unwrap();
        assert_eq!(context.pending_releases(), 1);

        texture.write(&checker(4, 4)).unwrap();
        assert_eq!(context.stats().images_allocated, 2);
    }

    #[test]
    fn test_grow_keeps_pixels_and_clears_rest() {
        let context = Context::headless();
        let mut texture = Texture::from_bitmap(&context, "grow", &Bitmap::filled(2, 2, Color::WHITE)).unwrap();
        texture.grow(4, 4).unwrap();

        let pixels = texture.read_pixels().unwrap();
        assert_eq!(pixels.dimensions(), (4, 4));
        assert_eq!(pixels.get_pixel(1, 1).0, [255, 255, 255, 255]);
        assert_eq!(pixels.get_pixel(3, 3).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_bitmap_rejected() {
        let context = Context::headless();
        let mut texture = Texture::new(&context, "bad");
        let bitmap = Bitmap {
            width: 2,
            height: 2,
            pixels: vec![0; 3],
        };
        assert!(matches!(texture.write(&bitmap), Err(RenderError::InvalidArgument(_))));
        assert!(!texture.is_valid());
    }

    #[test]
    fn test_inactive_context() {
        let context = Context::inactive();
        let mut texture = Texture::new(&context, "idle");
        assert!(texture.write(&checker(2, 2)).is_ok());
        assert!(!texture.is_valid());
        assert_eq!(texture.sampler(), vk::Sampler::null());
        assert!(matches!(
            Texture::solid(&context, "white", Color::WHITE),
            Err(RenderError::InactiveInstance)
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let context = Context::headless();
        let result = Texture::load(&context, "/definitely/not/here.png");
        assert!(matches!(result, Err(RenderError::Io { .. })));
    }
}
