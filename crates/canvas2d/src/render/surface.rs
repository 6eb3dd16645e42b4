//! Per-frame draw recorder
//!
//! A [`Surface`] is handed out by [`Instance::begin_render`] and records into
//! the frame's secondary command buffer. Draws are recorded in call order.
//! Finishing or dropping the surface ends the frame: the instance wraps the
//! recording in the render pass, submits, presents and rotates its per-frame
//! state.
//!
//! Descriptor sets used per draw:
//! - set 0: scene uniform with the camera's view-projection matrix
//! - set 1: storage buffer of [`GpuInstance`]s
//! - set 2: material uniform (binding 0) and sampled texture (binding 1)

use ash::vk;
use smallvec::SmallVec;
use std::borrow::Cow;

use crate::render::camera::Camera2D;
use crate::render::drawable::{Drawable, GpuInstance, Instance2D, RenderState};
use crate::render::error::RenderResult;
use crate::render::geometry::{PolygonMode, Topology};
use crate::render::instance::Instance;
use crate::render::pipeline::{PipelineId, PipelineSpec};
use crate::render::primitives::Primitive;
use crate::render::resources::{Shader, Texture};

/// Size of the material uniform block the bundled shaders declare
pub const MATERIAL_SIZE: usize = 64;

/// Where a surface is in its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No pipeline bound yet
    Unbound,
    /// A pipeline is bound and draws may be recorded
    Bound,
    /// The frame was submitted
    Ended,
}

impl RecorderState {
    /// Whether binds, camera changes and draws are still recorded
    pub fn is_recording(self) -> bool {
        self != Self::Ended
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    id: PipelineId,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// Commands needed to move from one bound pipeline to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rebind {
    pipeline: bool,
    scene: bool,
}

impl Rebind {
    /// Set 0 is rebound whenever the layout changes
    fn between(previous: Option<BoundPipeline>, next: BoundPipeline) -> Self {
        Self {
            pipeline: previous.map(|bound| bound.pipeline) != Some(next.pipeline),
            scene: previous.map(|bound| bound.layout) != Some(next.layout),
        }
    }
}

/// Pipeline to bind and the commands it takes
///
/// `None` leaves the surface as it was: after the frame ended nothing is
/// resolved, and a pipeline that fails to resolve keeps the previous binding.
fn plan_bind(
    state: RecorderState,
    previous: Option<BoundPipeline>,
    resolve: impl FnOnce() -> Option<BoundPipeline>,
) -> Option<(Rebind, BoundPipeline)> {
    if !state.is_recording() {
        return None;
    }
    let next = resolve()?;
    Some((Rebind::between(previous, next), next))
}

/// Records one frame of draws
pub struct Surface<'a> {
    instance: &'a mut Instance,
    image_index: u32,
    command_buffer: vk::CommandBuffer,
    state: RecorderState,
    bound: Option<BoundPipeline>,
    scene_set: vk::DescriptorSet,
    camera: Camera2D,
    draws: u32,
}

impl<'a> Surface<'a> {
    pub(crate) fn new(instance: &'a mut Instance, image_index: u32) -> Self {
        let extent = instance.swapchain.extent();
        let command_buffer = instance.frames.get().commands.secondary();
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            let device = instance.device.device();
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }

        let mut surface = Self {
            instance,
            image_index,
            command_buffer,
            state: RecorderState::Unbound,
            bound: None,
            scene_set: vk::DescriptorSet::null(),
            camera: Camera2D::new(extent.width as f32, extent.height as f32),
            draws: 0,
        };
        surface.write_scene();
        if !surface.bind(&RenderState::default()) {
            log::debug!("Default pipeline unavailable, surface starts unbound");
        }
        surface
    }

    /// Current state
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Target size in pixels
    pub fn extent(&self) -> vk::Extent2D {
        self.instance.swapchain.extent()
    }

    /// Camera the scene set was last written with
    pub fn camera(&self) -> &Camera2D {
        &self.camera
    }

    /// Draws recorded so far
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    /// Bind the pipeline for `state` with triangle-list fill
    ///
    /// Returns false and keeps the previous binding if the pipeline cannot be
    /// resolved.
    pub fn bind(&mut self, state: &RenderState<'_>) -> bool {
        self.bind_with(state, Topology::default(), PolygonMode::default())
    }

    fn bind_with(&mut self, state: &RenderState<'_>, topology: Topology, polygon_mode: PolygonMode) -> bool {
        let Some((rebind, next)) = plan_bind(self.state, self.bound, || self.resolve(state, topology, polygon_mode))
        else {
            return false;
        };

        if rebind.pipeline {
            let device = self.instance.device.device();
            unsafe { device.cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, next.pipeline) };
        }
        if rebind.scene {
            self.bind_scene(next.layout);
        }
        self.bound = Some(next);
        self.state = RecorderState::Bound;
        true
    }

    fn resolve(
        &mut self,
        state: &RenderState<'_>,
        topology: Topology,
        polygon_mode: PolygonMode,
    ) -> Option<BoundPipeline> {
        let instance = &mut *self.instance;
        let vertex = state.vertex_shader.or(instance.default_vertex.as_ref()).and_then(Shader::module_ref);
        let fragment = state
            .fragment_shader
            .or(instance.default_fragment.as_ref())
            .and_then(Shader::module_ref);
        let (Some(vertex), Some(fragment)) = (vertex, fragment) else {
            log::warn!("No shaders to bind, draw skipped");
            return None;
        };

        let spec = PipelineSpec {
            vertex: vertex.clone(),
            fragment: fragment.clone(),
            topology,
            polygon_mode,
            line_width: state.line_width,
            samples: instance.render_pass.samples().as_raw(),
            flags: state.flags,
        };
        let id = match instance.pipelines.get_or_load(&spec) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Pipeline layout creation failed: {}", e);
                return None;
            }
        };
        let pipeline = instance.pipelines.pipeline(id, instance.render_pass.handle())?;
        let layout = instance.pipelines.layout(id)?;
        Some(BoundPipeline { id, pipeline, layout })
    }

    fn write_scene(&mut self) -> bool {
        let matrix: [[f32; 4]; 4] = self.camera.view_projection().into();
        let Some(mut writer) = self.instance.scene_sets.post_increment() else {
            log::warn!("No scene descriptor set available");
            return false;
        };
        if !writer.write(0, bytemuck::bytes_of(&matrix)) {
            log::warn!("Scene uniform write failed");
            return false;
        }
        self.scene_set = writer.set();
        true
    }

    fn bind_scene(&self, layout: vk::PipelineLayout) {
        if self.scene_set == vk::DescriptorSet::null() {
            return;
        }
        unsafe {
            self.instance.device.device().cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[self.scene_set],
                &[],
            );
        }
    }

    /// Use `camera` for the following draws
    pub fn set_camera(&mut self, camera: &Camera2D) -> bool {
        if !self.state.is_recording() {
            return false;
        }
        self.camera = camera.clone();
        if !self.write_scene() {
            return false;
        }
        if let Some(bound) = self.bound {
            self.bind_scene(bound.layout);
        }
        true
    }

    /// Record one instanced draw
    ///
    /// Binds the pipeline for `state` and the geometry's topology first.
    /// Returns false when the draw was skipped.
    pub fn draw(&mut self, drawable: &Drawable<'_>, state: &RenderState<'_>) -> bool {
        if !self.state.is_recording() {
            return false;
        }
        let geometry = drawable.geometry;
        if !geometry.is_valid() {
            log::warn!("Skipping draw of empty geometry '{}'", geometry.name());
            return false;
        }
        if drawable.instances.is_empty() {
            return true;
        }
        if !self.bind_with(state, geometry.topology(), geometry.geometry().polygon_mode) {
            return false;
        }
        let Some(bound) = self.bound else {
            return false;
        };

        let instance = &mut *self.instance;
        let gpu = gpu_instances(drawable.instances);
        let instance_set = {
            let Some(mut writer) = instance.instance_sets.post_increment() else {
                log::warn!("No instance descriptor set available, draw skipped");
                return false;
            };
            if !writer.write(0, bytemuck::cast_slice(&gpu)) {
                log::warn!("Instance data write failed, draw skipped");
                return false;
            }
            writer.set()
        };

        let texture = choose_texture(drawable.texture, &instance.white, &instance.magenta);
        let material = material_bytes(drawable.material);
        let material_set = {
            let Some(mut writer) = instance.material_sets.post_increment() else {
                log::warn!("No material descriptor set available, draw skipped");
                return false;
            };
            if !writer.write(0, &material) || !writer.update(1, texture.sampler(), texture.view()) {
                log::warn!("Material write for '{}' failed, draw skipped", texture.name());
                return false;
            }
            writer.set()
        };

        let device = instance.device.device();
        let count = gpu.len() as u32;
        unsafe {
            device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                bound.layout,
                1,
                &[instance_set, material_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(self.command_buffer, 0, &[geometry.vertex_buffer()], &[0]);
            if geometry.index_count() > 0 {
                device.cmd_bind_index_buffer(self.command_buffer, geometry.index_buffer(), 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(self.command_buffer, geometry.index_count(), count, 0, 0, 0);
            } else {
                device.cmd_draw(self.command_buffer, geometry.vertex_count(), count, 0, 0);
            }
        }
        log::trace!("Draw {} with pipeline {}", self.draws, bound.id.index());
        self.draws += 1;
        true
    }

    /// Draw a primitive
    pub fn draw_primitive<P: Primitive + ?Sized>(&mut self, primitive: &P, state: &RenderState<'_>) -> bool {
        self.draw(&primitive.drawable(), state)
    }

    /// Submit and present the frame
    pub fn finish(mut self) -> RenderResult<()> {
        self.end()
    }

    fn end(&mut self) -> RenderResult<()> {
        self.state = RecorderState::Ended;
        self.instance.end_frame(self.image_index)
    }
}

impl Drop for Surface<'_> {
    fn drop(&mut self) {
        if self.state != RecorderState::Ended {
            if let Err(e) = self.end() {
                log::error!("Frame submission failed: {}", e);
            }
        }
    }
}

fn gpu_instances(instances: &[Instance2D]) -> SmallVec<[GpuInstance; 8]> {
    instances.iter().map(GpuInstance::from).collect()
}

/// Material uniform contents, zero padded to the block size
fn material_bytes(material: Option<&[u8]>) -> Cow<'_, [u8]> {
    match material {
        Some(bytes) if bytes.len() >= MATERIAL_SIZE => Cow::Borrowed(bytes),
        Some(bytes) => {
            let mut padded = bytes.to_vec();
            padded.resize(MATERIAL_SIZE, 0);
            Cow::Owned(padded)
        }
        None => Cow::Owned(vec![0; MATERIAL_SIZE]),
    }
}

/// Texture a draw samples: its own, magenta if that is unusable, white if none
fn choose_texture<'t>(texture: Option<&'t Texture>, white: &'t Texture, magenta: &'t Texture) -> &'t Texture {
    match texture {
        Some(texture) if texture.is_valid() => texture,
        Some(texture) => {
            log::warn!("Texture '{}' is not loaded, drawing the fallback", texture.name());
            magenta
        }
        None => white,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Color;
    use ash::vk::Handle;
    use crate::render::context::Context;

    #[test]
    fn test_instances_spill_past_eight() {
        let few = gpu_instances(&[Instance2D::default(); 8]);
        assert!(!few.spilled());
        let many = gpu_instances(&[Instance2D::default().with_tint(Color::BLACK); 9]);
        assert!(many.spilled());
        assert_eq!(many[8].tint, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_material_padding() {
        assert_eq!(&*material_bytes(None), &[0u8; MATERIAL_SIZE][..]);
        let short = material_bytes(Some(&[7u8, 8][..]));
        assert_eq!(short.len(), MATERIAL_SIZE);
        assert_eq!(&short[..3], &[7, 8, 0]);
        let long = vec![1u8; MATERIAL_SIZE + 16];
        assert!(matches!(material_bytes(Some(&long)), Cow::Borrowed(_)));
    }

    fn bound(id: usize, pipeline: u64, layout: u64) -> BoundPipeline {
        BoundPipeline {
            id: PipelineId(id),
            pipeline: vk::Pipeline::from_raw(pipeline),
            layout: vk::PipelineLayout::from_raw(layout),
        }
    }

    #[test]
    fn test_rebind_skips_unchanged_state() {
        let a = bound(0, 1, 10);
        let same_layout = bound(1, 2, 10);
        let other_layout = bound(2, 3, 11);

        let first = Rebind::between(None, a);
        assert!(first.pipeline && first.scene);
        assert_eq!(Rebind::between(Some(a), a), Rebind { pipeline: false, scene: false });
        assert_eq!(Rebind::between(Some(a), same_layout), Rebind { pipeline: true, scene: false });
        assert_eq!(Rebind::between(Some(same_layout), other_layout), Rebind { pipeline: true, scene: true });
    }

    #[test]
    fn test_ended_surface_refuses_binds() {
        assert!(RecorderState::Unbound.is_recording());
        assert!(RecorderState::Bound.is_recording());
        assert!(!RecorderState::Ended.is_recording());
        assert!(plan_bind(RecorderState::Ended, None, || panic!("resolved after the frame ended")).is_none());
    }

    #[test]
    fn test_failed_resolve_keeps_binding() {
        let a = bound(0, 1, 10);
        assert!(plan_bind(RecorderState::Bound, Some(a), || None).is_none());

        let (rebind, next) = plan_bind(RecorderState::Unbound, None, || Some(a)).unwrap();
        assert_eq!(next.id, a.id);
        assert!(rebind.pipeline && rebind.scene);
    }

    #[test]
    fn test_texture_fallbacks() {
        let context = Context::headless();
        let white = Texture::solid(&context, "white", Color::WHITE).unwrap();
        let magenta = Texture::solid(&context, "magenta", Color::MAGENTA).unwrap();
        let loaded = Texture::solid(&context, "loaded", Color::BLACK).unwrap();
        let empty = Texture::new(&context, "empty");

        assert_eq!(choose_texture(None, &white, &magenta).name(), "white");
        assert_eq!(choose_texture(Some(&empty), &white, &magenta).name(), "magenta");
        assert_eq!(choose_texture(Some(&loaded), &white, &magenta).name(), "loaded");
    }
}
