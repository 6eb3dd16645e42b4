//! Device backends
//!
//! Resource handles never talk to Vulkan directly. They allocate memory,
//! create samplers and shader modules, and submit transfer work through the
//! [`DeviceBackend`] trait. Two implementations exist:
//!
//! - [`vulkan::VulkanDevice`]: the real device, with memory from vk-mem
//! - [`headless::HeadlessDevice`]: a CPU emulation used for offscreen
//!   tooling and for tests that must not need a GPU
//!
//! Every object handed out by a backend is wrapped in an RAII type
//! ([`GpuBuffer`], [`GpuImage`], [`GpuSampler`], [`GpuShaderModule`]) that
//! returns it to the backend on drop. Dropping one of these directly frees
//! the GPU object at once; resource handles route them through the deferred
//! queue instead.

pub mod allocation;
pub mod headless;
pub mod vulkan;

use ash::vk;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::render::error::RenderResult;

/// Memory behind a buffer or image
pub enum MemoryBlock {
    /// Nothing allocated
    None,
    /// Device memory owned by vk-mem
    Vma(vk_mem::Allocation),
    /// CPU memory standing in for device memory
    Host(RefCell<Vec<u8>>),
}

impl Default for MemoryBlock {
    fn default() -> Self {
        Self::None
    }
}

/// Backend-level buffer description
pub struct RawBuffer {
    /// Native handle
    pub handle: vk::Buffer,
    /// Size in bytes
    pub size: u64,
    /// Usage the buffer was created with
    pub usage: vk::BufferUsageFlags,
    /// Persistent host mapping, null when not mapped
    pub mapped: *mut u8,
    /// Backing memory
    pub memory: MemoryBlock,
}

impl Default for RawBuffer {
    fn default() -> Self {
        Self {
            handle: vk::Buffer::null(),
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            mapped: std::ptr::null_mut(),
            memory: MemoryBlock::None,
        }
    }
}

/// Backend-level image description
pub struct RawImage {
    /// Native handle
    pub handle: vk::Image,
    /// View over the whole image
    pub view: vk::ImageView,
    /// Pixel extent
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage the image was created with
    pub usage: vk::ImageUsageFlags,
    /// Backing memory
    pub memory: MemoryBlock,
}

impl Default for RawImage {
    fn default() -> Self {
        Self {
            handle: vk::Image::null(),
            view: vk::ImageView::null(),
            extent: vk::Extent2D::default(),
            format: vk::Format::UNDEFINED,
            usage: vk::ImageUsageFlags::empty(),
            memory: MemoryBlock::None,
        }
    }
}

/// Allocation counters reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Buffers allocated over the backend's lifetime
    pub buffers_allocated: u64,
    /// Images allocated over the backend's lifetime
    pub images_allocated: u64,
    /// Buffers currently alive
    pub live_buffers: u64,
    /// Images currently alive
    pub live_images: u64,
}

/// Interior-mutable stats shared by backend implementations
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    buffers_allocated: Cell<u64>,
    images_allocated: Cell<u64>,
    live_buffers: Cell<u64>,
    live_images: Cell<u64>,
}

impl StatsCounter {
    pub(crate) fn buffer_allocated(&self) {
        self.buffers_allocated.set(self.buffers_allocated.get() + 1);
        self.live_buffers.set(self.live_buffers.get() + 1);
    }

    pub(crate) fn buffer_freed(&self) {
        self.live_buffers.set(self.live_buffers.get().saturating_sub(1));
    }

    pub(crate) fn image_allocated(&self) {
        self.images_allocated.set(self.images_allocated.get() + 1);
        self.live_images.set(self.live_images.get() + 1);
    }

    pub(crate) fn image_freed(&self) {
        self.live_images.set(self.live_images.get().saturating_sub(1));
    }

    pub(crate) fn snapshot(&self) -> AllocationStats {
        AllocationStats {
            buffers_allocated: self.buffers_allocated.get(),
            images_allocated: self.images_allocated.get(),
            live_buffers: self.live_buffers.get(),
            live_images: self.live_images.get(),
        }
    }
}

/// One unit of transfer work
pub enum TransferOp<'a> {
    /// Copy tightly packed pixels from a buffer into an image region
    Upload {
        /// Source pixels
        src: &'a GpuBuffer,
        /// Destination image
        dst: &'a GpuImage,
        /// Top-left corner of the region
        offset: [u32; 2],
        /// Region extent
        extent: vk::Extent2D,
    },
    /// Linear-filtered blit of all of `src` into the top-left `dst_extent` of `dst`
    Blit {
        /// Source image
        src: &'a GpuImage,
        /// Destination image
        dst: &'a GpuImage,
        /// Destination region extent
        dst_extent: vk::Extent2D,
    },
    /// Unfiltered copy of all of `src` into the top-left of `dst`
    Copy {
        /// Source image
        src: &'a GpuImage,
        /// Destination image
        dst: &'a GpuImage,
    },
}

/// The device operations resource handles depend on
pub trait DeviceBackend {
    /// Short backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Allocate a persistently mapped, host-visible buffer
    fn allocate_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> RenderResult<RawBuffer>;

    /// Return a buffer to the backend
    fn free_buffer(&self, buffer: RawBuffer);

    /// Allocate a device-local 2D image with a full view
    fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RenderResult<RawImage>;

    /// Return an image to the backend
    fn free_image(&self, image: RawImage);

    /// Create a clamp-to-edge sampler
    fn create_sampler(&self, filter: vk::Filter) -> RenderResult<vk::Sampler>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule>;

    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    /// Record `ops` into one submission and wait for it to complete
    ///
    /// Images end up in `SHADER_READ_ONLY_OPTIMAL`.
    fn submit_transfers(&self, ops: &[TransferOp<'_>]) -> RenderResult<()>;

    /// Read back tightly packed pixels of an image
    fn read_image(&self, image: &GpuImage) -> RenderResult<Vec<u8>>;

    /// Block until the device has no pending work
    fn wait_idle(&self);

    /// Allocation counters
    fn stats(&self) -> AllocationStats;
}

/// Bytes per pixel for the colour formats the renderer uses
pub fn bytes_per_pixel(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8_UNORM => 2,
        _ => 4,
    }
}

/// Host-visible buffer that returns itself to its backend on drop
pub struct GpuBuffer {
    backend: Rc<dyn DeviceBackend>,
    raw: RawBuffer,
}

impl GpuBuffer {
    /// Allocate through `backend`
    pub fn new(backend: &Rc<dyn DeviceBackend>, size: u64, usage: vk::BufferUsageFlags) -> RenderResult<Self> {
        let raw = backend.allocate_buffer(size, usage)?;
        Ok(Self {
            backend: backend.clone(),
            raw,
        })
    }

    /// Allocate and fill with `bytes`
    pub fn with_data(backend: &Rc<dyn DeviceBackend>, bytes: &[u8], usage: vk::BufferUsageFlags) -> RenderResult<Self> {
        let mut buffer = Self::new(backend, bytes.len() as u64, usage)?;
        buffer.write(0, bytes);
        Ok(buffer)
    }

    /// Native handle
    pub fn handle(&self) -> vk::Buffer {
        self.raw.handle
    }

    /// Capacity in bytes
    pub fn size(&self) -> u64 {
        self.raw.size
    }

    /// Usage flags
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.raw.usage
    }

    /// Liveness: a buffer is valid iff it has a non-zero size
    pub fn is_valid(&self) -> bool {
        self.raw.size > 0
    }

    /// Mapped contents
    pub fn mapped(&self) -> Option<&[u8]> {
        if self.raw.mapped.is_null() {
            return None;
        }
        // The mapping covers `size` bytes for the buffer's whole lifetime.
        Some(unsafe { std::slice::from_raw_parts(self.raw.mapped, self.raw.size as usize) })
    }

    /// Mapped contents, mutably
    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        if self.raw.mapped.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.raw.mapped, self.raw.size as usize) })
    }

    /// Copy `bytes` into the mapping at `offset`
    ///
    /// Returns false when unmapped or too small.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> bool {
        let Some(mapped) = self.mapped_mut() else {
            return false;
        };
        let start = offset as usize;
        let Some(end) = start.checked_add(bytes.len()).filter(|&end| end <= mapped.len()) else {
            return false;
        };
        mapped[start..end].copy_from_slice(bytes);
        true
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if self.raw.handle != vk::Buffer::null() || self.raw.size > 0 {
            self.backend.free_buffer(std::mem::take(&mut self.raw));
        }
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.raw.handle)
            .field("size", &self.raw.size)
            .field("usage", &self.raw.usage)
            .finish()
    }
}

/// Device-local image that returns itself to its backend on drop
pub struct GpuImage {
    backend: Rc<dyn DeviceBackend>,
    raw: RawImage,
    layout: Cell<vk::ImageLayout>,
}

impl GpuImage {
    /// Allocate through `backend`
    pub fn new(
        backend: &Rc<dyn DeviceBackend>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RenderResult<Self> {
        let raw = backend.allocate_image(extent, format, usage)?;
        Ok(Self {
            backend: backend.clone(),
            raw,
            layout: Cell::new(vk::ImageLayout::UNDEFINED),
        })
    }

    /// Take ownership of an image `backend` allocated
    pub(crate) fn from_raw(backend: &Rc<dyn DeviceBackend>, raw: RawImage) -> Self {
        Self {
            backend: backend.clone(),
            raw,
            layout: Cell::new(vk::ImageLayout::UNDEFINED),
        }
    }

    /// Native handle
    pub fn handle(&self) -> vk::Image {
        self.raw.handle
    }

    /// View over the whole image
    pub fn view(&self) -> vk::ImageView {
        self.raw.view
    }

    /// Pixel extent
    pub fn extent(&self) -> vk::Extent2D {
        self.raw.extent
    }

    /// Pixel format
    pub fn format(&self) -> vk::Format {
        self.raw.format
    }

    /// Usage flags
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.raw.usage
    }

    /// Liveness: an image is valid iff its extent is non-zero
    pub fn is_valid(&self) -> bool {
        self.raw.extent.width > 0 && self.raw.extent.height > 0
    }

    /// Layout after the last recorded transfer
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout.get()
    }

    pub(crate) fn set_layout(&self, layout: vk::ImageLayout) {
        self.layout.set(layout);
    }

    pub(crate) fn memory(&self) -> &MemoryBlock {
        &self.raw.memory
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if self.raw.handle != vk::Image::null() || self.is_valid() {
            self.backend.free_image(std::mem::take(&mut self.raw));
        }
    }
}

impl fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuImage")
            .field("handle", &self.raw.handle)
            .field("extent", &self.raw.extent)
            .field("format", &self.raw.format)
            .finish()
    }
}

/// Sampler that destroys itself on drop
pub struct GpuSampler {
    backend: Rc<dyn DeviceBackend>,
    sampler: vk::Sampler,
}

impl GpuSampler {
    /// Create a clamp-to-edge sampler with `filter`
    pub fn new(backend: &Rc<dyn DeviceBackend>, filter: vk::Filter) -> RenderResult<Self> {
        Ok(Self {
            backend: backend.clone(),
            sampler: backend.create_sampler(filter)?,
        })
    }

    /// Native handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for GpuSampler {
    fn drop(&mut self) {
        self.backend.destroy_sampler(self.sampler);
    }
}

/// Shader module that destroys itself on drop
pub struct GpuShaderModule {
    backend: Rc<dyn DeviceBackend>,
    module: vk::ShaderModule,
}

impl GpuShaderModule {
    /// Create from SPIR-V words
    pub fn new(backend: &Rc<dyn DeviceBackend>, code: &[u32]) -> RenderResult<Self> {
        Ok(Self {
            backend: backend.clone(),
            module: backend.create_shader_module(code)?,
        })
    }

    /// Native handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for GpuShaderModule {
    fn drop(&mut self) {
        self.backend.destroy_shader_module(self.module);
    }
}
