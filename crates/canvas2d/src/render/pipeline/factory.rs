//! Vulkan pipeline creation behind the [`PipelineCache`]

use ash::{vk, Device};
use std::ffi::CStr;

use super::{PipelineCache, PipelineFlags, PipelineId, PipelineSpec};
use crate::render::backend::vulkan::render_pass::sample_count_flags;
use crate::render::error::{RenderError, RenderResult};
use crate::render::geometry::Vertex;

/// Creates and owns every graphics pipeline of a device
pub struct PipelineFactory {
    device: Device,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    cache: PipelineCache<vk::PipelineLayout, vk::Pipeline>,
}

impl PipelineFactory {
    /// Factory whose layouts use `set_layouts` as sets 0, 1, 2 and so on
    pub fn new(device: Device, set_layouts: Vec<vk::DescriptorSetLayout>) -> Self {
        Self {
            device,
            set_layouts,
            cache: PipelineCache::new(),
        }
    }

    /// Id for `spec`, creating its pipeline layout on first sight
    pub fn get_or_load(&mut self, spec: &PipelineSpec) -> RenderResult<PipelineId> {
        let Self {
            device,
            set_layouts,
            cache,
        } = self;
        cache.get_or_insert_with(spec, || {
            let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
            let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(RenderError::Vulkan)?;
            log::debug!(
                "New pipeline spec: {:?} {:?}, {} samples, {:?}",
                spec.topology,
                spec.polygon_mode,
                spec.samples,
                spec.flags
            );
            Ok(layout)
        })
    }

    /// Pipeline of `id` for `render_pass`, compiled on first use
    ///
    /// `None` if the pipeline failed to compile; the failure is logged once.
    pub fn pipeline(&mut self, id: PipelineId, render_pass: vk::RenderPass) -> Option<vk::Pipeline> {
        let device = &self.device;
        self.cache
            .get_or_compile(id, render_pass, |spec, layout| compile(device, spec, layout, render_pass))
    }

    /// Layout of `id`
    pub fn layout(&self, id: PipelineId) -> Option<vk::PipelineLayout> {
        self.cache.layout(id)
    }

    /// Spec of `id`
    pub fn spec(&self, id: PipelineId) -> Option<&PipelineSpec> {
        self.cache.spec(id)
    }

    /// Destroy every pipeline compiled for `render_pass`
    ///
    /// The device must be idle.
    pub fn evict(&mut self, render_pass: vk::RenderPass) {
        for pipeline in self.cache.evict_render_pass(render_pass) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    /// Number of distinct specs
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no spec was loaded yet
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Drop for PipelineFactory {
    fn drop(&mut self) {
        for (layout, pipelines) in self.cache.drain() {
            unsafe {
                for pipeline in pipelines {
                    self.device.destroy_pipeline(pipeline, None);
                }
                self.device.destroy_pipeline_layout(layout, None);
            }
        }
    }
}

fn compile(
    device: &Device,
    spec: &PipelineSpec,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> RenderResult<vk::Pipeline> {
    let entry = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(spec.vertex.handle())
            .name(entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(spec.fragment.handle())
            .name(entry)
            .build(),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(spec.topology.to_vk())
        .primitive_restart_enable(false);

    // Viewport and scissor are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(spec.polygon_mode.to_vk())
        .line_width(spec.line_width)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(sample_count_flags(spec.samples));

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(spec.flags.contains(PipelineFlags::DEPTH_TEST))
        .depth_write_enable(spec.flags.contains(PipelineFlags::DEPTH_WRITE))
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = if spec.flags.contains(PipelineFlags::BLEND) {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };
    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
            .map_err(|(_, e)| RenderError::Vulkan(e))?
    };
    pipelines
        .into_iter()
        .next()
        .ok_or(RenderError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))
}
