//! CPU implementation of [`DeviceBackend`]
//!
//! Buffers and images live in host memory and transfers are plain copies.
//! Handles are synthetic but unique, so code that compares or caches them
//! behaves the same as on a real device. Blits use nearest sampling, which
//! matches a linear blit exactly when source and destination sizes agree.

use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};

use super::{
    bytes_per_pixel, AllocationStats, DeviceBackend, GpuImage, MemoryBlock, RawBuffer, RawImage, StatsCounter,
    TransferOp,
};
use crate::render::error::{RenderError, RenderResult};

/// Device that never touches a GPU
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    next_handle: Cell<u64>,
    stats: StatsCounter,
    submissions: Cell<u64>,
}

impl HeadlessDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `submit_transfers` calls so far
    pub fn submissions(&self) -> u64 {
        self.submissions.get()
    }

    fn handle(&self) -> u64 {
        let next = self.next_handle.get() + 1;
        self.next_handle.set(next);
        next
    }
}

fn pixels(image: &GpuImage) -> RenderResult<&RefCell<Vec<u8>>> {
    match image.memory() {
        MemoryBlock::Host(pixels) => Ok(pixels),
        _ => Err(RenderError::invalid("image was not allocated by the headless device")),
    }
}

fn row_bytes(width: u32, bpp: u32) -> usize {
    (width * bpp) as usize
}

impl DeviceBackend for HeadlessDevice {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn allocate_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> RenderResult<RawBuffer> {
        if size == 0 {
            return Err(RenderError::invalid("buffer size must be non-zero"));
        }
        let mut memory = vec![0u8; size as usize];
        let mapped = memory.as_mut_ptr();
        self.stats.buffer_allocated();
        Ok(RawBuffer {
            handle: vk::Buffer::from_raw(self.handle()),
            size,
            usage,
            mapped,
            memory: MemoryBlock::Host(RefCell::new(memory)),
        })
    }

    fn free_buffer(&self, buffer: RawBuffer) {
        drop(buffer);
        self.stats.buffer_freed();
    }

    fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RenderResult<RawImage> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::invalid("image extent must be non-zero"));
        }
        let size = extent.width as usize * extent.height as usize * bytes_per_pixel(format) as usize;
        self.stats.image_allocated();
        Ok(RawImage {
            handle: vk::Image::from_raw(self.handle()),
            view: vk::ImageView::from_raw(self.handle()),
            extent,
            format,
            usage,
            memory: MemoryBlock::Host(RefCell::new(vec![0u8; size])),
        })
    }

    fn free_image(&self, image: RawImage) {
        drop(image);
        self.stats.image_freed();
    }

    fn create_sampler(&self, _filter: vk::Filter) -> RenderResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.handle()))
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {}

    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RenderError::invalid("empty shader module"));
        }
        Ok(vk::ShaderModule::from_raw(self.handle()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    fn submit_transfers(&self, ops: &[TransferOp<'_>]) -> RenderResult<()> {
        self.submissions.set(self.submissions.get() + 1);

        for op in ops {
            match op {
                TransferOp::Upload { src, dst, offset, extent } => {
                    let bpp = bytes_per_pixel(dst.format());
                    let source = src.mapped().ok_or_else(|| RenderError::invalid("staging buffer is not mapped"))?;
                    let needed = row_bytes(extent.width, bpp) * extent.height as usize;
                    if source.len() < needed
                        || offset[0] + extent.width > dst.extent().width
                        || offset[1] + extent.height > dst.extent().height
                    {
                        return Err(RenderError::invalid("upload region out of bounds"));
                    }

                    let mut target = pixels(dst)?.borrow_mut();
                    let dst_row = row_bytes(dst.extent().width, bpp);
                    let src_row = row_bytes(extent.width, bpp);
                    for y in 0..extent.height as usize {
                        let from = y * src_row;
                        let to = (offset[1] as usize + y) * dst_row + row_bytes(offset[0], bpp);
                        target[to..to + src_row].copy_from_slice(&source[from..from + src_row]);
                    }
                }
                TransferOp::Blit { src, dst, dst_extent } => {
                    let bpp = bytes_per_pixel(dst.format()) as usize;
                    let source = pixels(src)?.borrow();
                    let mut target = pixels(dst)?.borrow_mut();
                    let (sw, sh) = (src.extent().width as usize, src.extent().height as usize);
                    let dw = (dst_extent.width.min(dst.extent().width)) as usize;
                    let dh = (dst_extent.height.min(dst.extent().height)) as usize;
                    let dst_row = dst.extent().width as usize * bpp;
                    for y in 0..dh {
                        let sy = y * sh / dh;
                        for x in 0..dw {
                            let sx = x * sw / dw;
                            let from = (sy * sw + sx) * bpp;
                            let to = y * dst_row + x * bpp;
                            target[to..to + bpp].copy_from_slice(&source[from..from + bpp]);
                        }
                    }
                }
                TransferOp::Copy { src, dst } => {
                    let bpp = bytes_per_pixel(dst.format());
                    let source = pixels(src)?.borrow();
                    let mut target = pixels(dst)?.borrow_mut();
                    let width = src.extent().width.min(dst.extent().width);
                    let height = src.extent().height.min(dst.extent().height);
                    let src_row = row_bytes(src.extent().width, bpp);
                    let dst_row = row_bytes(dst.extent().width, bpp);
                    let span = row_bytes(width, bpp);
                    for y in 0..height as usize {
                        target[y * dst_row..y * dst_row + span]
                            .copy_from_slice(&source[y * src_row..y * src_row + span]);
                    }
                }
            }
        }

        for op in ops {
            let dst = match op {
                TransferOp::Upload { dst, .. } | TransferOp::Blit { dst, .. } | TransferOp::Copy { dst, .. } => dst,
            };
            dst.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        Ok(())
    }

    fn read_image(&self, image: &GpuImage) -> RenderResult<Vec<u8>> {
        Ok(pixels(image)?.borrow().clone())
    }

    fn wait_idle(&self) {}

    fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::GpuBuffer;
    use std::rc::Rc;

    fn device() -> Rc<dyn DeviceBackend> {
        Rc::new(HeadlessDevice::new())
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_handles_are_unique() {
        let backend = device();
        let a = GpuBuffer::new(&backend, 16, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        let b = GpuBuffer::new(&backend, 16, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(backend.stats().live_buffers, 2);
        drop(a);
        assert_eq!(backend.stats().live_buffers, 1);
        assert_eq!(backend.stats().buffers_allocated, 2);
    }

    #[test]
    fn test_upload_into_region() {
        let backend = device();
        let image = GpuImage::new(
            &backend,
            extent(4, 4),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST,
        )
        .unwrap();
        let red = [255u8, 0, 0, 255].repeat(4);
        let staging = GpuBuffer::with_data(&backend, &red, vk::BufferUsageFlags::TRANSFER_SRC).unwrap();

        backend
            .submit_transfers(&[TransferOp::Upload {
                src: &staging,
                dst: &image,
                offset: [1, 1],
                extent: extent(2, 2),
            }])
            .unwrap();

        let pixels = backend.read_image(&image).unwrap();
        let at = |x: usize, y: usize| &pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(at(1, 1), &[255, 0, 0, 255]);
        assert_eq!(at(2, 2), &[255, 0, 0, 255]);
        assert_eq!(at(0, 0), &[0, 0, 0, 0]);
        assert_eq!(at(3, 1), &[0, 0, 0, 0]);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_upload_out_of_bounds_is_rejected() {
        let backend = device();
        let image = GpuImage::new(&backend, extent(2, 2), vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::TRANSFER_DST)
            .unwrap();
        let staging = GpuBuffer::new(&backend, 64, vk::BufferUsageFlags::TRANSFER_SRC).unwrap();
        let result = backend.submit_transfers(&[TransferOp::Upload {
            src: &staging,
            dst: &image,
            offset: [1, 0],
            extent: extent(2, 2),
        }]);
        assert!(matches!(result, Err(RenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_zero_sized_allocations_fail() {
        let backend = device();
        assert!(backend.allocate_buffer(0, vk::BufferUsageFlags::VERTEX_BUFFER).is_err());
        assert!(backend
            .allocate_image(extent(0, 4), vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
            .is_err());
    }
}
