//! Grow-on-demand buffer and image caches
//!
//! Both caches follow the same protocol:
//!
//! - `ready(request)` is a pure check that the current allocation already
//!   satisfies the request
//! - `make(request)` always replaces the allocation, handing the old one to
//!   the deferred queue
//! - `refresh(request)` is `ready` then `make` if needed, returning the
//!   current allocation
//!
//! Allocation failure leaves the cache empty and is logged; callers treat an
//! empty cache as "skip this operation".

use ash::vk;

use super::{GpuBuffer, GpuImage};
use crate::render::context::Context;

/// Smallest buffer `make` will allocate
pub const MIN_BUFFER_CAPACITY: u64 = 256;

/// Capacity allocated for a request of `size` bytes
///
/// Rounded up to a power of two so that steady growth reallocates rarely.
pub fn buffer_capacity(size: u64) -> u64 {
    size.max(MIN_BUFFER_CAPACITY).next_power_of_two()
}

/// A host-visible buffer that is replaced when it is too small
pub struct BufferCache {
    context: Context,
    buffer: Option<GpuBuffer>,
}

impl BufferCache {
    /// Empty cache on `context`
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            buffer: None,
        }
    }

    /// Whether the current buffer holds `size` bytes with at least `usage`
    pub fn ready(&self, size: u64, usage: vk::BufferUsageFlags) -> bool {
        self.buffer
            .as_ref()
            .is_some_and(|buffer| buffer.is_valid() && buffer.size() >= size && buffer.usage().contains(usage))
    }

    /// Replace the buffer with one holding at least `size` bytes
    pub fn make(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Option<&mut GpuBuffer> {
        self.release();
        if size == 0 {
            return None;
        }

        let backend = self.context.backend()?;
        match GpuBuffer::new(backend, buffer_capacity(size), usage) {
            Ok(buffer) => {
                log::trace!("Allocated {} byte buffer ({:?})", buffer.size(), usage);
                self.buffer = Some(buffer);
            }
            Err(e) => log::error!("Buffer allocation of {} bytes failed: {}", size, e),
        }
        self.buffer.as_mut()
    }

    /// Ensure capacity for `size` bytes, reallocating only when needed
    pub fn refresh(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Option<&mut GpuBuffer> {
        if self.ready(size, usage) {
            self.buffer.as_mut()
        } else {
            self.make(size, usage)
        }
    }

    /// Copy `bytes` to the start of the buffer
    ///
    /// Returns false when there is no buffer or it is too small; call
    /// `refresh` first.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        self.buffer.as_mut().is_some_and(|buffer| buffer.write(0, bytes))
    }

    /// The current buffer
    pub fn get(&self) -> Option<&GpuBuffer> {
        self.buffer.as_ref()
    }

    /// Native handle, null when empty
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.as_ref().map_or(vk::Buffer::null(), GpuBuffer::handle)
    }

    /// Current capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.buffer.as_ref().map_or(0, GpuBuffer::size)
    }

    /// Hand the current buffer to the deferred queue
    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if buffer.is_valid() {
                self.context.defer(buffer);
            }
        }
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.release();
    }
}

/// A device image that is replaced when its extent or format changes
pub struct ImageCache {
    context: Context,
    image: Option<GpuImage>,
    usage: vk::ImageUsageFlags,
}

impl ImageCache {
    /// Empty cache whose images are created with `usage`
    pub fn new(context: &Context, usage: vk::ImageUsageFlags) -> Self {
        Self {
            context: context.clone(),
            image: None,
            usage,
        }
    }

    /// Whether the current image has exactly this extent and format
    pub fn ready(&self, extent: vk::Extent2D, format: vk::Format) -> bool {
        self.image
            .as_ref()
            .is_some_and(|image| image.is_valid() && image.extent() == extent && image.format() == format)
    }

    /// Replace the image, returning the previous one to the caller
    ///
    /// Use this when the old contents must be copied across before the old
    /// image is released.
    pub fn replace(&mut self, extent: vk::Extent2D, format: vk::Format) -> Option<GpuImage> {
        let previous = self.image.take();
        if extent.width == 0 || extent.height == 0 {
            return previous;
        }

        if let Some(backend) = self.context.backend() {
            match GpuImage::new(backend, extent, format, self.usage) {
                Ok(image) => {
                    log::trace!("Allocated {}x{} image ({:?})", extent.width, extent.height, format);
                    self.image = Some(image);
                }
                Err(e) => log::error!(
                    "Image allocation of {}x{} {:?} failed: {}",
                    extent.width,
                    extent.height,
                    format,
                    e
                ),
            }
        }
        previous
    }

    /// Replace the image, deferring the old one
    pub fn make(&mut self, extent: vk::Extent2D, format: vk::Format) -> Option<&GpuImage> {
        if let Some(previous) = self.replace(extent, format) {
            if previous.is_valid() {
                self.context.defer(previous);
            }
        }
        self.image.as_ref()
    }

    /// Ensure an image of this extent and format exists
    pub fn refresh(&mut self, extent: vk::Extent2D, format: vk::Format) -> Option<&GpuImage> {
        if self.ready(extent, format) {
            self.image.as_ref()
        } else {
            self.make(extent, format)
        }
    }

    /// The current image
    pub fn get(&self) -> Option<&GpuImage> {
        self.image.as_ref()
    }

    /// Extent of the current image, zero when empty
    pub fn extent(&self) -> vk::Extent2D {
        self.image.as_ref().map_or_else(vk::Extent2D::default, GpuImage::extent)
    }

    /// Hand the current image to the deferred queue
    pub fn release(&mut self) {
        if let Some(image) = self.image.take() {
            if image.is_valid() {
                self.context.defer(image);
            }
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: vk::BufferUsageFlags = vk::BufferUsageFlags::VERTEX_BUFFER;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_refresh_twice_allocates_once() {
        let context = Context::headless();
        let mut cache = BufferCache::new(&context);
        assert!(!cache.ready(100, VERTEX));

        cache.refresh(100, VERTEX);
        cache.refresh(100, VERTEX);
        assert_eq!(context.stats().buffers_allocated, 1);
        assert!(cache.ready(100, VERTEX));
    }

    #[test]
    fn test_image_refresh_twice_allocates_once() {
        let context = Context::headless();
        let mut cache = ImageCache::new(&context, vk::ImageUsageFlags::SAMPLED);
        cache.refresh(extent(16, 16), vk::Format::R8G8B8A8_UNORM);
        cache.refresh(extent(16, 16), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(context.stats().images_allocated, 1);

        cache.refresh(extent(32, 16), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(context.stats().images_allocated, 2);
        assert_eq!(context.pending_releases(), 1);
    }

    #[test]
    fn test_growth_defers_old_buffer() {
        let context = Context::headless();
        let mut cache = BufferCache::new(&context);
        cache.refresh(16, VERTEX);
        let first = cache.handle();

        cache.refresh(4096, VERTEX);
        assert_ne!(cache.handle(), first);
        assert_eq!(cache.capacity(), 4096);
        assert_eq!(context.pending_releases(), 1);
        assert_eq!(context.stats().live_buffers, 2);

        for _ in 0..3 {
            context.end_frame();
        }
        assert_eq!(context.stats().live_buffers, 1);
    }

    #[test]
    fn test_usage_mismatch_is_not_ready() {
        let context = Context::headless();
        let mut cache = BufferCache::new(&context);
        cache.refresh(16, VERTEX);
        assert!(!cache.ready(16, vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(cache.ready(16, vk::BufferUsageFlags::empty()));
    }

    #[test]
    fn test_write_requires_capacity() {
        let context = Context::headless();
        let mut cache = BufferCache::new(&context);
        assert!(!cache.write(&[1, 2, 3]));

        cache.refresh(3, VERTEX);
        assert!(cache.write(&[1, 2, 3]));
        assert_eq!(&cache.get().unwrap().mapped().unwrap()[..3], &[1, 2, 3]);
        assert!(!cache.write(&vec![0u8; 1024]));
    }

    #[test]
    fn test_inactive_context_stays_empty() {
        let mut cache = BufferCache::new(&Context::inactive());
        assert!(cache.refresh(64, VERTEX).is_none());
        assert!(!cache.write(&[0]));
    }

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(buffer_capacity(1), MIN_BUFFER_CAPACITY);
        assert_eq!(buffer_capacity(300), 512);
        assert_eq!(buffer_capacity(1024), 1024);
    }

    #[test]
    fn test_drop_defers() {
        let context = Context::headless();
        {
            let mut cache = BufferCache::new(&context);
            cache.refresh(8, VERTEX);
        }
        assert_eq!(context.pending_releases(), 1);
        assert_eq!(context.stats().live_buffers, 1);
    }
}
