//! Command buffer management
//!
//! Each buffered frame owns a primary command buffer that wraps the render
//! pass, and a secondary one the [`Surface`](crate::render::Surface) records
//! draws into.

use ash::{vk, Device};

use crate::render::error::{RenderError, RenderResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be reset individually
    pub fn new(device: Device, queue_family_index: u32) -> RenderResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool =
            unsafe { device.create_command_pool(&pool_create_info, None) }.map_err(RenderError::Vulkan)?;

        Ok(Self { device, command_pool })
    }

    /// Allocate one command buffer of `level`
    pub fn allocate(&self, level: vk::CommandBufferLevel) -> RenderResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(1);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::Vulkan)?
            .into_iter()
            .next()
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Frees every buffer allocated from the pool.
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Primary and secondary command buffers of one buffered frame
pub struct FrameCommands {
    device: Device,
    primary: vk::CommandBuffer,
    secondary: vk::CommandBuffer,
}

impl FrameCommands {
    /// Allocate both buffers from `pool`
    pub fn new(device: Device, pool: &CommandPool) -> RenderResult<Self> {
        Ok(Self {
            primary: pool.allocate(vk::CommandBufferLevel::PRIMARY)?,
            secondary: pool.allocate(vk::CommandBufferLevel::SECONDARY)?,
            device,
        })
    }

    /// The primary buffer
    pub fn primary(&self) -> vk::CommandBuffer {
        self.primary
    }

    /// The secondary buffer draws are recorded into
    pub fn secondary(&self) -> vk::CommandBuffer {
        self.secondary
    }

    /// Reset the secondary buffer and begin it inside `render_pass`
    pub fn begin_secondary(&self, render_pass: vk::RenderPass, framebuffer: vk::Framebuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.secondary, vk::CommandBufferResetFlags::empty())
                .map_err(RenderError::Vulkan)?;
        }

        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(render_pass)
            .subpass(0)
            .framebuffer(framebuffer);
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(
                vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .inheritance_info(&inheritance);

        unsafe { self.device.begin_command_buffer(self.secondary, &begin_info) }.map_err(RenderError::Vulkan)
    }

    /// End the secondary buffer and record the primary one around it
    pub fn record_primary(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> RenderResult<()> {
        let device = &self.device;
        unsafe {
            device.end_command_buffer(self.secondary).map_err(RenderError::Vulkan)?;
            device
                .reset_command_buffer(self.primary, vk::CommandBufferResetFlags::empty())
                .map_err(RenderError::Vulkan)?;

            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.primary, &begin_info)
                .map_err(RenderError::Vulkan)?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            }];
            let render_pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(
                self.primary,
                &render_pass_begin,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
            device.cmd_execute_commands(self.primary, &[self.secondary]);
            device.cmd_end_render_pass(self.primary);
            device.end_command_buffer(self.primary).map_err(RenderError::Vulkan)
        }
    }
}
