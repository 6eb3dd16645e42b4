//! Graphics pipeline specs and their cache
//!
//! A [`PipelineSpec`] names everything that distinguishes one pipeline from
//! another. Specs are kept in a [`PipelineCache`], which owns one layout per
//! spec and compiles the pipeline itself lazily, once per render pass it is
//! used with. The cache bookkeeping does not know about Vulkan; the
//! [`PipelineFactory`] plugs in the device calls.

pub mod factory;

pub use factory::PipelineFactory;

use ash::vk;
use bitflags::bitflags;
use std::fmt::Display;

use crate::render::geometry::{PolygonMode, Topology};
use crate::render::resources::ShaderRef;

bitflags! {
    /// Fixed-function state toggles
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineFlags: u32 {
        /// Straight alpha blending
        const BLEND = 1 << 0;
        /// Depth testing
        const DEPTH_TEST = 1 << 1;
        /// Depth writes
        const DEPTH_WRITE = 1 << 2;
    }
}

impl Default for PipelineFlags {
    fn default() -> Self {
        Self::BLEND
    }
}

/// Everything that makes a pipeline distinct
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    /// Vertex stage
    pub vertex: ShaderRef,
    /// Fragment stage
    pub fragment: ShaderRef,
    /// Primitive assembly
    pub topology: Topology,
    /// Rasterisation mode
    pub polygon_mode: PolygonMode,
    /// Rasterised line width
    pub line_width: f32,
    /// Samples per pixel of the target
    pub samples: u32,
    /// Blend and depth toggles
    pub flags: PipelineFlags,
}

/// Index of a spec in a [`PipelineCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub(crate) usize);

impl PipelineId {
    /// Position in the cache
    pub fn index(self) -> usize {
        self.0
    }
}

struct Entry<L, P> {
    spec: PipelineSpec,
    layout: L,
    // `None` records a failed compile so it is not retried every frame
    pipelines: Vec<(vk::RenderPass, Option<P>)>,
}

/// Specs with their layouts and per-render-pass pipelines
///
/// Specs are few, so lookup is a linear scan comparing values.
pub struct PipelineCache<L, P> {
    entries: Vec<Entry<L, P>>,
}

impl<L, P> Default for PipelineCache<L, P> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<L: Copy, P: Copy> PipelineCache<L, P> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of a spec already in the cache
    pub fn find(&self, spec: &PipelineSpec) -> Option<PipelineId> {
        self.entries.iter().position(|entry| entry.spec == *spec).map(PipelineId)
    }

    /// Id of `spec`, creating its layout on a miss
    pub fn get_or_insert_with<E>(
        &mut self,
        spec: &PipelineSpec,
        make_layout: impl FnOnce() -> Result<L, E>,
    ) -> Result<PipelineId, E> {
        if let Some(id) = self.find(spec) {
            return Ok(id);
        }
        let layout = make_layout()?;
        self.entries.push(Entry {
            spec: spec.clone(),
            layout,
            pipelines: Vec::new(),
        });
        Ok(PipelineId(self.entries.len() - 1))
    }

    /// Spec behind `id`
    pub fn spec(&self, id: PipelineId) -> Option<&PipelineSpec> {
        self.entries.get(id.0).map(|entry| &entry.spec)
    }

    /// Layout behind `id`
    pub fn layout(&self, id: PipelineId) -> Option<L> {
        self.entries.get(id.0).map(|entry| entry.layout)
    }

    /// Pipeline of `id` for `render_pass`, compiling it on first request
    ///
    /// A failed compile is logged once and remembered; later calls return
    /// `None` without compiling again.
    pub fn get_or_compile<E: Display>(
        &mut self,
        id: PipelineId,
        render_pass: vk::RenderPass,
        compile: impl FnOnce(&PipelineSpec, L) -> Result<P, E>,
    ) -> Option<P> {
        let entry = self.entries.get_mut(id.0)?;
        if let Some((_, pipeline)) = entry.pipelines.iter().find(|(pass, _)| *pass == render_pass) {
            return *pipeline;
        }

        let pipeline = match compile(&entry.spec, entry.layout) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                log::warn!("Pipeline {} failed to compile: {}", id.0, e);
                None
            }
        };
        entry.pipelines.push((render_pass, pipeline));
        pipeline
    }

    /// Forget pipelines compiled for `render_pass`, returning them
    pub fn evict_render_pass(&mut self, render_pass: vk::RenderPass) -> Vec<P> {
        let mut evicted = Vec::new();
        for entry in &mut self.entries {
            entry.pipelines.retain(|(pass, pipeline)| {
                if *pass != render_pass {
                    return true;
                }
                evicted.extend(*pipeline);
                false
            });
        }
        evicted
    }

    /// Number of specs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no spec was ever loaded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, yielding each layout with its compiled pipelines
    pub fn drain(&mut self) -> Vec<(L, Vec<P>)> {
        self.entries
            .drain(..)
            .map(|entry| (entry.layout, entry.pipelines.into_iter().filter_map(|(_, p)| p).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::context::Context;
    use crate::render::resources::shader::tests::fake_spirv;
    use crate::render::resources::{Shader, ShaderStage};
    use ash::vk::Handle;

    fn shaders(context: &Context) -> (Shader, Shader) {
        (
            Shader::from_spirv(context, ShaderStage::Vertex, &fake_spirv()).unwrap(),
            Shader::from_spirv(context, ShaderStage::Fragment, &fake_spirv()).unwrap(),
        )
    }

    fn spec(vertex: &Shader, fragment: &Shader) -> PipelineSpec {
        PipelineSpec {
            vertex: vertex.module_ref().unwrap().clone(),
            fragment: fragment.module_ref().unwrap().clone(),
            topology: Topology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            line_width: 1.0,
            samples: 1,
            flags: PipelineFlags::default(),
        }
    }

    #[test]
    fn test_equal_specs_share_an_entry() {
        let context = Context::headless();
        let (vertex, fragment) = shaders(&context);
        let mut cache: PipelineCache<u32, u64> = PipelineCache::new();
        let mut layouts = 0;

        let a = cache
            .get_or_insert_with(&spec(&vertex, &fragment), || {
                layouts += 1;
                Ok::<_, String>(7)
            })
            .unwrap();
        let b = cache
            .get_or_insert_with(&spec(&vertex, &fragment), || {
                layouts += 1;
                Ok::<_, String>(8)
            })
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(layouts, 1);
        assert_eq!(cache.layout(a), Some(7));
    }

    #[test]
    fn test_distinct_state_gets_new_entry() {
        let context = Context::headless();
        let (vertex, fragment) = shaders(&context);
        let (_, other_fragment) = shaders(&context);
        let mut cache: PipelineCache<u32, u64> = PipelineCache::new();

        let base = spec(&vertex, &fragment);
        let mut lines = base.clone();
        lines.topology = Topology::LineList;
        let mut opaque = base.clone();
        opaque.flags = PipelineFlags::empty();
        let swapped = spec(&vertex, &other_fragment);

        let ids: Vec<PipelineId> = [&base, &lines, &opaque, &swapped]
            .into_iter()
            .map(|s| cache.get_or_insert_with(s, || Ok::<_, String>(0)).unwrap())
            .collect();
        assert_eq!(cache.len(), 4);
        assert_eq!(ids.iter().map(|id| id.index()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(cache.spec(ids[1]).map(|s| s.topology), Some(Topology::LineList));
    }

    #[test]
    fn test_pipeline_compiled_once_per_render_pass() {
        let context = Context::headless();
        let (vertex, fragment) = shaders(&context);
        let mut cache: PipelineCache<u32, u64> = PipelineCache::new();
        let id = cache
            .get_or_insert_with(&spec(&vertex, &fragment), || Ok::<_, String>(3))
            .unwrap();
        let first = vk::RenderPass::from_raw(1);
        let second = vk::RenderPass::from_raw(2);
        let mut compiles = 0;

        for _ in 0..3 {
            let pipeline = cache.get_or_compile(id, first, |_, layout| {
                compiles += 1;
                Ok::<_, String>(layout as u64 * 10)
            });
            assert_eq!(pipeline, Some(30));
        }
        assert_eq!(cache.get_or_compile(id, second, |_, _| Ok::<_, String>(31)), Some(31));
        assert_eq!(compiles, 1);

        assert_eq!(cache.evict_render_pass(first), vec![30]);
        assert_eq!(cache.drain(), vec![(3, vec![31])]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_compile_is_not_retried() {
        let context = Context::headless();
        let (vertex, fragment) = shaders(&context);
        let mut cache: PipelineCache<u32, u64> = PipelineCache::new();
        let id = cache
            .get_or_insert_with(&spec(&vertex, &fragment), || Ok::<_, String>(0))
            .unwrap();
        let pass = vk::RenderPass::from_raw(9);
        let mut attempts = 0;

        for _ in 0..2 {
            let pipeline = cache.get_or_compile(id, pass, |_, _| {
                attempts += 1;
                Err::<u64, _>("bad shader")
            });
            assert_eq!(pipeline, None);
        }
        assert_eq!(attempts, 1);
        assert_eq!(cache.get_or_compile(PipelineId(5), pass, |_, _| Ok::<_, String>(1)), None);
    }
}
