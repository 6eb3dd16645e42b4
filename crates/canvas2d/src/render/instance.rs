//! The rendering instance
//!
//! Owns the device, the swapchain and every piece of per-frame state. Only
//! one instance may be alive per process; a second `Instance::new` fails
//! with [`RenderError::DuplicateInstance`].
//!
//! A frame is `begin_render` → draws on the returned [`Surface`] → finish
//! (or drop) the surface. Ending the frame submits, presents, counts down
//! the deferred queue and rotates the frame slot.

use ash::vk;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::config::{RendererConfig, MAX_FRAMES_IN_FLIGHT};
use crate::foundation::math::Color;
use crate::render::backend::vulkan::render_pass::sample_count_flags;
use crate::render::backend::vulkan::{
    CommandPool, DescriptorAllocator, DescriptorSetLayoutBuilder, Fence, FrameCommands, RenderPass, Semaphore,
    Swapchain, VulkanDevice,
};
use crate::render::backend::{DeviceBackend, GpuImage};
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::pipeline::PipelineFactory;
use crate::render::resources::{Shader, ShaderStage, Texture};
use crate::render::rotator::Rotator;
use crate::render::shader_cache::ShaderCache;
use crate::render::surface::Surface;
use crate::window::WindowSystem;

static INSTANCE_ALIVE: AtomicBool = AtomicBool::new(false);

const SPRITE_VERT: &str = include_str!("../../shaders/sprite.vert");
const SPRITE_FRAG: &str = include_str!("../../shaders/sprite.frag");

/// Holds the process-wide instance slot; released on drop
struct InstanceClaim;

impl InstanceClaim {
    fn acquire() -> RenderResult<Self> {
        INSTANCE_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| RenderError::DuplicateInstance)
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        INSTANCE_ALIVE.store(false, Ordering::Release);
    }
}

/// Per-frame synchronization and command buffers
pub(crate) struct FrameResources {
    pub(crate) commands: FrameCommands,
    in_flight: Fence,
    image_available: Semaphore,
    render_finished: Semaphore,
}

impl FrameResources {
    fn new(device: &VulkanDevice, pool: &CommandPool) -> RenderResult<Self> {
        let raw = device.device();
        Ok(Self {
            commands: FrameCommands::new(raw.clone(), pool)?,
            in_flight: Fence::new(raw.clone(), true)?,
            image_available: Semaphore::new(raw.clone())?,
            render_finished: Semaphore::new(raw.clone())?,
        })
    }
}

/// A window's renderer
///
/// Field order is drop order: frame state and pipelines go before the
/// descriptor pools, the swapchain and finally the device.
pub struct Instance {
    pub(crate) frames: Rotator<FrameResources, MAX_FRAMES_IN_FLIGHT>,
    pub(crate) pipelines: PipelineFactory,
    pub(crate) scene_sets: DescriptorAllocator,
    pub(crate) instance_sets: DescriptorAllocator,
    pub(crate) material_sets: DescriptorAllocator,
    pub(crate) white: Texture,
    pub(crate) magenta: Texture,
    pub(crate) default_vertex: Option<Shader>,
    pub(crate) default_fragment: Option<Shader>,
    shader_cache: ShaderCache,
    msaa_target: Option<GpuImage>,
    pub(crate) swapchain: Swapchain,
    pub(crate) render_pass: RenderPass,
    command_pool: CommandPool,
    context: Context,
    pub(crate) device: Rc<VulkanDevice>,
    config: RendererConfig,
    window_extent: vk::Extent2D,
    needs_recreate: bool,
    frame_count: u64,
    _claim: InstanceClaim,
}

impl Instance {
    /// Bring up rendering for `window`
    pub fn new(window: &dyn WindowSystem, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        let claim = InstanceClaim::acquire()?;

        let (width, height) = window.framebuffer_size();
        let window_extent = vk::Extent2D { width, height };
        log::info!(
            "Creating rendering instance for '{}' at {}x{}",
            config.application_name,
            width,
            height
        );

        let device = Rc::new(VulkanDevice::new(window, &config)?);
        let backend: Rc<dyn DeviceBackend> = device.clone();
        let context = Context::new(backend.clone(), config.deferred_delay);

        let mut swapchain = Swapchain::new(&device, window_extent, config.vsync, vk::SwapchainKHR::null())?;
        let samples = choose_samples(&device, config.msaa_samples);
        let render_pass = RenderPass::new(device.device().clone(), swapchain.format().format, samples)?;
        let msaa_target = create_msaa_target(&device, &backend, &swapchain, &render_pass)?;
        swapchain.create_framebuffers(render_pass.handle(), msaa_target.as_ref().map(GpuImage::view))?;

        let command_pool = CommandPool::new(device.device().clone(), device.physical().graphics_family)?;
        let frames = (0..config.frames_in_flight)
            .map(|_| FrameResources::new(&device, &command_pool))
            .collect::<RenderResult<Vec<_>>>()?
            .into_iter()
            .collect();

        let raw = device.device();
        let scene_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(raw)?;
        let instance_layout = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(raw)?;
        let material_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .build(raw)?;

        let pipelines = PipelineFactory::new(
            raw.clone(),
            vec![scene_layout.handle(), instance_layout.handle(), material_layout.handle()],
        );
        let block_size = config.descriptor_block_size;
        let in_flight = config.frames_in_flight;
        let scene_sets = DescriptorAllocator::new(raw, &context, scene_layout, in_flight, block_size)?;
        let instance_sets = DescriptorAllocator::new(raw, &context, instance_layout, in_flight, block_size)?;
        let material_sets = DescriptorAllocator::new(raw, &context, material_layout, in_flight, block_size)?;

        let white = Texture::solid(&context, "white", Color::WHITE)?;
        let magenta = Texture::solid(&context, "missing", Color::MAGENTA)?;

        let shader_cache = ShaderCache::from_config(&config.shaders);
        let default_vertex = load_default_shader(
            &context,
            &shader_cache,
            &config.shaders.vertex_shader_path,
            ShaderStage::Vertex,
            SPRITE_VERT,
        );
        let default_fragment = load_default_shader(
            &context,
            &shader_cache,
            &config.shaders.fragment_shader_path,
            ShaderStage::Fragment,
            SPRITE_FRAG,
        );

        log::info!(
            "Rendering instance ready: {}x{} {:?}, {} frame(s) in flight, {} sample(s)",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.format().format,
            in_flight,
            render_pass.samples().as_raw()
        );

        Ok(Self {
            frames,
            pipelines,
            scene_sets,
            instance_sets,
            material_sets,
            white,
            magenta,
            default_vertex,
            default_fragment,
            shader_cache,
            msaa_target,
            swapchain,
            render_pass,
            command_pool,
            context,
            device,
            config,
            window_extent,
            needs_recreate: false,
            frame_count: 0,
            _claim: claim,
        })
    }

    /// Start a frame
    ///
    /// `None` when there is nothing to draw into this frame: the window is
    /// minimized or the swapchain had to be rebuilt.
    pub fn begin_render(&mut self) -> RenderResult<Option<Surface<'_>>> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            return Ok(None);
        }
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        let timeout = self.device.fence_timeout_ns();
        let frame = self.frames.get();
        frame.in_flight.wait(timeout)?;

        let image_index = match self.swapchain.acquire(frame.image_available.handle(), timeout) {
            Ok((index, suboptimal)) => {
                self.needs_recreate |= suboptimal;
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain()?;
                return Ok(None);
            }
            Err(e) => return Err(RenderError::Vulkan(e)),
        };

        let framebuffer = self
            .swapchain
            .framebuffer(image_index)
            .ok_or_else(|| RenderError::invalid(format!("no framebuffer for swapchain image {image_index}")))?;

        let frame = self.frames.get();
        frame.in_flight.reset()?;
        frame.commands.begin_secondary(self.render_pass.handle(), framebuffer)?;

        Ok(Some(Surface::new(self, image_index)))
    }

    /// Wrap, submit and present the frame recorded for `image_index`
    pub(crate) fn end_frame(&mut self, image_index: u32) -> RenderResult<()> {
        let framebuffer = self
            .swapchain
            .framebuffer(image_index)
            .ok_or_else(|| RenderError::invalid(format!("no framebuffer for swapchain image {image_index}")))?;

        let frame = self.frames.get();
        frame.commands.record_primary(
            self.render_pass.handle(),
            framebuffer,
            self.swapchain.extent(),
            self.config.clear_color.to_array(),
        )?;

        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle()];
        let command_buffers = [frame.commands.primary()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        self.device.submit(&[submit_info], frame.in_flight.handle())?;

        let swapchains = [self.swapchain.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match self.device.present(&present_info) {
            Ok(suboptimal) => self.needs_recreate |= suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.needs_recreate = true,
            Err(e) => return Err(RenderError::Vulkan(e)),
        }

        let released = self.context.end_frame();
        if released > 0 {
            log::trace!("Released {} deferred resource(s)", released);
        }
        self.scene_sets.next();
        self.instance_sets.next();
        self.material_sets.next();
        self.frames.next();
        self.frame_count += 1;

        if self.needs_recreate {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Tell the instance the window's framebuffer changed size
    ///
    /// The swapchain is rebuilt at the start of the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        if extent != self.window_extent {
            log::debug!("Window resized to {}x{}", width, height);
            self.window_extent = extent;
            self.needs_recreate = true;
        }
    }

    fn recreate_swapchain(&mut self) -> RenderResult<()> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            return Ok(());
        }
        self.device.wait_idle();

        let old_format = self.swapchain.format().format;
        let mut swapchain = Swapchain::new(
            &self.device,
            self.window_extent,
            self.config.vsync,
            self.swapchain.handle(),
        )?;

        if swapchain.format().format != old_format {
            log::info!("Surface format changed to {:?}", swapchain.format().format);
            let render_pass =
                RenderPass::new(self.device.device().clone(), swapchain.format().format, self.render_pass.samples())?;
            self.pipelines.evict(self.render_pass.handle());
            self.render_pass = render_pass;
        }

        let backend: Rc<dyn DeviceBackend> = self.device.clone();
        let msaa_target = create_msaa_target(&self.device, &backend, &swapchain, &self.render_pass)?;
        swapchain.create_framebuffers(self.render_pass.handle(), msaa_target.as_ref().map(GpuImage::view))?;

        self.swapchain = swapchain;
        self.msaa_target = msaa_target;
        self.needs_recreate = false;
        log::debug!(
            "Swapchain recreated at {}x{}",
            self.swapchain.extent().width,
            self.swapchain.extent().height
        );
        Ok(())
    }

    /// Handle for creating resources on this instance's device
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// GLSL compile cache
    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shader_cache
    }

    /// The configuration the instance was built with
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Frames submitted so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Whether another instance currently exists
    pub fn is_alive() -> bool {
        INSTANCE_ALIVE.load(Ordering::Acquire)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying rendering instance after {} frame(s)", self.frame_count);
        self.context.shutdown();
    }
}

fn choose_samples(device: &VulkanDevice, requested: u32) -> vk::SampleCountFlags {
    let samples = sample_count_flags(requested);
    if device.physical().supports_samples(samples) {
        samples
    } else {
        log::warn!("{} samples not supported, falling back to 1", requested);
        vk::SampleCountFlags::TYPE_1
    }
}

fn create_msaa_target(
    device: &VulkanDevice,
    backend: &Rc<dyn DeviceBackend>,
    swapchain: &Swapchain,
    render_pass: &RenderPass,
) -> RenderResult<Option<GpuImage>> {
    if !render_pass.is_multisampled() {
        return Ok(None);
    }
    let raw = device.create_image(
        swapchain.extent(),
        swapchain.format().format,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
        render_pass.samples(),
    )?;
    Ok(Some(GpuImage::from_raw(backend, raw)))
}

/// Precompiled SPIR-V from `path`, else the bundled GLSL
fn load_default_shader(
    context: &Context,
    cache: &ShaderCache,
    path: &str,
    stage: ShaderStage,
    source: &str,
) -> Option<Shader> {
    if Path::new(path).exists() {
        match Shader::from_file(context, cache, path) {
            Ok(shader) => return Some(shader),
            Err(e) => log::warn!("Failed to load default shader {}: {}", path, e),
        }
    }
    match Shader::from_glsl(context, cache, format!("default {:?}", stage), stage, source) {
        Ok(shader) => Some(shader),
        Err(e) => {
            log::warn!("No default {:?} shader available: {}", stage, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        // Only this test touches the claim, no Instance is built in unit tests
        let first = InstanceClaim::acquire().unwrap();
        assert!(Instance::is_alive());
        assert!(matches!(InstanceClaim::acquire(), Err(RenderError::DuplicateInstance)));
        drop(first);
        assert!(!Instance::is_alive());
        let again = InstanceClaim::acquire().unwrap();
        drop(again);
    }

    #[test]
    fn test_default_shader_falls_back_to_none() {
        let context = Context::headless();
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path()).with_compiler(dir.path().join("no-such-glslc"));
        let shader = load_default_shader(
            &context,
            &cache,
            "does/not/exist.spv",
            ShaderStage::Vertex,
            SPRITE_VERT,
        );
        assert!(shader.is_none());
    }
}
