//! The Vulkan device backend
//!
//! Owns the instance, the presentation surface, the logical device and the
//! vk-mem allocator. Resource handles reach it through [`DeviceBackend`];
//! the rendering instance also uses it directly for swapchain and command
//! work.
//!
//! All queue submissions and presents go through [`VulkanDevice::submit`] and
//! [`VulkanDevice::present`], which serialize on one mutex.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use std::mem::ManuallyDrop;
use std::sync::{Mutex, PoisonError};
use vk_mem::Alloc;

use super::context::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance};
use super::sync::{color_subresource_layers, color_subresource_range, transition_image, Fence};
use crate::core::config::RendererConfig;
use crate::render::backend::{
    bytes_per_pixel, AllocationStats, DeviceBackend, GpuImage, MemoryBlock, RawBuffer, RawImage, StatsCounter,
    TransferOp,
};
use crate::render::error::{RenderError, RenderResult};
use crate::window::WindowSystem;

/// Vulkan implementation of [`DeviceBackend`]
pub struct VulkanDevice {
    allocator: ManuallyDrop<vk_mem::Allocator>,
    transfer_pool: vk::CommandPool,
    submit_lock: Mutex<()>,
    stats: StatsCounter,
    fence_timeout_ns: u64,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical: PhysicalDeviceInfo,
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Bring up Vulkan for `window`
    pub fn new(window: &dyn WindowSystem, config: &RendererConfig) -> RenderResult<Self> {
        let instance = VulkanInstance::new(window, config)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_surface(&instance.entry, &instance.instance)?;

        let physical = match PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader) {
            Ok(physical) => physical,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };
        let device = LogicalDevice::new(&instance.instance, &physical)?;

        let allocator = unsafe {
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
                &instance.instance,
                &device.device,
                physical.device,
            ))
        }
        .map_err(|e| RenderError::DeviceInitFailure(format!("Memory allocator creation failed: {e:?}")))?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(physical.graphics_family);
        let transfer_pool =
            unsafe { device.device.create_command_pool(&pool_info, None) }.map_err(RenderError::Vulkan)?;

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            transfer_pool,
            submit_lock: Mutex::new(()),
            stats: StatsCounter::default(),
            fence_timeout_ns: config.fence_timeout_ns,
            surface,
            surface_loader,
            physical,
            device,
            instance,
        })
    }

    /// Vulkan entry
    pub fn entry(&self) -> &Entry {
        &self.instance.entry
    }

    /// Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Selected physical device
    pub fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Presentation surface
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader
    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    /// Swapchain extension loader
    pub fn swapchain_loader(&self) -> &SwapchainLoader {
        &self.device.swapchain_loader
    }

    /// Fence timeout from the renderer config
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ns
    }

    /// Submit to the graphics queue under the submission lock
    pub fn submit(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> RenderResult<()> {
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { self.device.device.queue_submit(self.device.graphics_queue, submits, fence) }
            .map_err(RenderError::Vulkan)
    }

    /// Present under the submission lock
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(&self, present_info: &vk::PresentInfoKHR) -> Result<bool, vk::Result> {
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device
                .swapchain_loader
                .queue_present(self.device.present_queue, present_info)
        }
    }

    /// Record with `record` into a one-shot command buffer, submit and wait
    pub fn one_shot<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) -> RenderResult<()>,
    {
        let device = &self.device.device;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.transfer_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::Vulkan)?
            .into_iter()
            .next()
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;

        let result = (|| {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(command_buffer, &begin_info) }.map_err(RenderError::Vulkan)?;
            record(device, command_buffer)?;
            unsafe { device.end_command_buffer(command_buffer) }.map_err(RenderError::Vulkan)?;

            let fence = Fence::new(device.clone(), false)?;
            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
            self.submit(&[submit_info], fence.handle())?;
            fence.wait(self.fence_timeout_ns)
        })();

        unsafe { device.free_command_buffers(self.transfer_pool, &[command_buffer]) };
        result
    }

    /// Allocate a device-local image with `samples` per pixel
    ///
    /// Multisampled images back the colour target when MSAA is enabled.
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        samples: vk::SampleCountFlags,
    ) -> RenderResult<RawImage> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::invalid("image extent must be non-zero"));
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (handle, mut allocation) = unsafe { self.allocator.create_image(&image_info, &allocation_info) }
            .map_err(|e| {
                log::error!("Device image allocation {}x{} failed: {:?}", extent.width, extent.height, e);
                RenderError::Vulkan(e)
            })?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        let view = match unsafe { self.device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.allocator.destroy_image(handle, &mut allocation) };
                return Err(RenderError::Vulkan(e));
            }
        };

        self.stats.image_allocated();
        Ok(RawImage {
            handle,
            view,
            extent,
            format,
            usage,
            memory: MemoryBlock::Vma(allocation),
        })
    }

    fn record_transfer(device: &Device, command_buffer: vk::CommandBuffer, op: &TransferOp<'_>) {
        match op {
            TransferOp::Upload { src, dst, offset, extent } => {
                transition_image(device, command_buffer, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                let region = vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(color_subresource_layers())
                    .image_offset(vk::Offset3D {
                        x: offset[0] as i32,
                        y: offset[1] as i32,
                        z: 0,
                    })
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .build();
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        src.handle(),
                        dst.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                transition_image(device, command_buffer, dst, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
            TransferOp::Blit { src, dst, dst_extent } => {
                transition_image(device, command_buffer, src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                transition_image(device, command_buffer, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                let corner = |extent: vk::Extent2D| vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                };
                let blit = vk::ImageBlit::builder()
                    .src_subresource(color_subresource_layers())
                    .src_offsets([vk::Offset3D::default(), corner(src.extent())])
                    .dst_subresource(color_subresource_layers())
                    .dst_offsets([vk::Offset3D::default(), corner(*dst_extent)])
                    .build();
                unsafe {
                    device.cmd_blit_image(
                        command_buffer,
                        src.handle(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
                transition_image(device, command_buffer, src, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                transition_image(device, command_buffer, dst, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
            TransferOp::Copy { src, dst } => {
                transition_image(device, command_buffer, src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                transition_image(device, command_buffer, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                let copy = vk::ImageCopy::builder()
                    .src_subresource(color_subresource_layers())
                    .dst_subresource(color_subresource_layers())
                    .extent(vk::Extent3D {
                        width: src.extent().width.min(dst.extent().width),
                        height: src.extent().height.min(dst.extent().height),
                        depth: 1,
                    })
                    .build();
                unsafe {
                    device.cmd_copy_image(
                        command_buffer,
                        src.handle(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    );
                }
                transition_image(device, command_buffer, src, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                transition_image(device, command_buffer, dst, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        }
    }
}

impl DeviceBackend for VulkanDevice {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn allocate_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> RenderResult<RawBuffer> {
        if size == 0 {
            return Err(RenderError::invalid("buffer size must be non-zero"));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Auto,
            flags: vk_mem::AllocationCreateFlags::MAPPED
                | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ..Default::default()
        };

        let (handle, allocation) = unsafe { self.allocator.create_buffer(&buffer_info, &allocation_info) }
            .map_err(|e| {
                log::error!("Device buffer allocation of {} bytes failed: {:?}", size, e);
                RenderError::Vulkan(e)
            })?;
        let mapped = unsafe { self.allocator.get_allocation_info(&allocation) }.mapped_data.cast::<u8>();

        self.stats.buffer_allocated();
        Ok(RawBuffer {
            handle,
            size,
            usage,
            mapped,
            memory: MemoryBlock::Vma(allocation),
        })
    }

    fn free_buffer(&self, buffer: RawBuffer) {
        if let MemoryBlock::Vma(mut allocation) = buffer.memory {
            unsafe { self.allocator.destroy_buffer(buffer.handle, &mut allocation) };
            self.stats.buffer_freed();
        }
    }

    fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RenderResult<RawImage> {
        self.create_image(extent, format, usage, vk::SampleCountFlags::TYPE_1)
    }

    fn free_image(&self, image: RawImage) {
        if let MemoryBlock::Vma(mut allocation) = image.memory {
            unsafe {
                self.device.device.destroy_image_view(image.view, None);
                self.allocator.destroy_image(image.handle, &mut allocation);
            }
            self.stats.image_freed();
        }
    }

    fn create_sampler(&self, filter: vk::Filter) -> RenderResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .min_lod(0.0)
            .max_lod(0.0);

        unsafe { self.device.device.create_sampler(&sampler_info, None) }.map_err(RenderError::Vulkan)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.device.create_shader_module(&create_info, None) }.map_err(RenderError::Vulkan)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.device.destroy_shader_module(module, None) };
    }

    fn submit_transfers(&self, ops: &[TransferOp<'_>]) -> RenderResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        log::trace!("Submitting {} transfer op(s)", ops.len());
        self.one_shot(|device, command_buffer| {
            for op in ops {
                Self::record_transfer(device, command_buffer, op);
            }
            Ok(())
        })
    }

    fn read_image(&self, image: &GpuImage) -> RenderResult<Vec<u8>> {
        let extent = image.extent();
        let size = u64::from(extent.width) * u64::from(extent.height) * u64::from(bytes_per_pixel(image.format()));
        let staging = self.allocate_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;

        let result = self.one_shot(|device, command_buffer| {
            let restore = match image.layout() {
                vk::ImageLayout::UNDEFINED => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                layout => layout,
            };
            transition_image(device, command_buffer, image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            let region = vk::BufferImageCopy::builder()
                .image_subresource(color_subresource_layers())
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_image_to_buffer(
                    command_buffer,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    staging.handle,
                    &[region],
                );
            }
            transition_image(device, command_buffer, image, restore);
            Ok(())
        });

        let pixels = result.map(|()| {
            let bytes = unsafe { std::slice::from_raw_parts(staging.mapped, size as usize) };
            bytes.to_vec()
        });
        self.free_buffer(staging);
        pixels
    }

    fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device.device_wait_idle() } {
            log::error!("device_wait_idle failed: {:?}", e);
        }
    }

    fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan device");
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.device.device.destroy_command_pool(self.transfer_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // `device` then `instance` drop in declaration order.
    }
}
