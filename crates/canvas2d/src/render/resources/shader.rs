//! Shader modules
//!
//! A [`Shader`] owns one SPIR-V module for one stage. Pipelines refer to it
//! through a [`ShaderRef`], which keeps the module alive for as long as a
//! cached pipeline may still need to compile against it.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::render::backend::GpuShaderModule;
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::shader_cache::{spirv_words, ShaderCache};

static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

/// Pipeline stage a shader runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Fragment shader
    Fragment,
}

impl ShaderStage {
    /// Vulkan stage flag
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    /// Stage from a file name such as `sprite.vert` or `sprite.frag.spv`
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut path = path.to_path_buf();
        if path.extension().is_some_and(|ext| ext == "spv") {
            path.set_extension("");
        }
        match path.extension()?.to_str()? {
            "vert" => Some(Self::Vertex),
            "frag" => Some(Self::Fragment),
            _ => None,
        }
    }

    /// Extension `glslc` uses to infer the stage
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }
}

/// Shared reference to a live shader module
///
/// Two refs are equal when they name the same module.
#[derive(Clone)]
pub struct ShaderRef {
    id: u64,
    stage: ShaderStage,
    module: Rc<GpuShaderModule>,
}

impl ShaderRef {
    /// Process-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stage the module was built for
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Native module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module.handle()
    }
}

impl PartialEq for ShaderRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ShaderRef {}

impl fmt::Debug for ShaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderRef")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .finish()
    }
}

/// A compiled shader stage
pub struct Shader {
    context: Context,
    name: String,
    stage: ShaderStage,
    module: Option<ShaderRef>,
}

impl Shader {
    /// Create from SPIR-V bytecode
    ///
    /// Fails with `InvalidArgument` unless `bytes` is a non-empty, word
    /// aligned SPIR-V binary.
    pub fn from_spirv(context: &Context, stage: ShaderStage, bytes: &[u8]) -> RenderResult<Self> {
        Self::from_spirv_named(context, format!("{stage:?}").to_lowercase(), stage, bytes)
    }

    /// [`Shader::from_spirv`] with a diagnostic name
    pub fn from_spirv_named(
        context: &Context,
        name: impl Into<String>,
        stage: ShaderStage,
        bytes: &[u8],
    ) -> RenderResult<Self> {
        let name = name.into();
        let words = spirv_words(bytes)?;
        let backend = context.backend().ok_or(RenderError::InactiveInstance)?;
        let module = GpuShaderModule::new(backend, &words)?;
        log::debug!("Loaded {:?} shader '{}' ({} words)", stage, name, words.len());

        Ok(Self {
            context: context.clone(),
            name,
            stage,
            module: Some(ShaderRef {
                id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
                stage,
                module: Rc::new(module),
            }),
        })
    }

    /// Load a shader from disk
    ///
    /// `.spv` files are loaded as-is. GLSL sources (`.vert`, `.frag`) are
    /// compiled through `cache`.
    pub fn from_file(context: &Context, cache: &ShaderCache, path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let stage = ShaderStage::from_path(path)
            .ok_or_else(|| RenderError::invalid(format!("cannot infer shader stage from {}", path.display())))?;
        let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        let bytes = if path.extension().is_some_and(|ext| ext == "spv") {
            std::fs::read(path).map_err(|e| RenderError::io(path, e))?
        } else {
            let source = std::fs::read_to_string(path).map_err(|e| RenderError::io(path, e))?;
            cache.compile(stage, &source)?
        };
        Self::from_spirv_named(context, name, stage, &bytes)
    }

    /// Compile GLSL source through `cache`
    pub fn from_glsl(
        context: &Context,
        cache: &ShaderCache,
        name: impl Into<String>,
        stage: ShaderStage,
        source: &str,
    ) -> RenderResult<Self> {
        let bytes = cache.compile(stage, source)?;
        Self::from_spirv_named(context, name, stage, &bytes)
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Whether the module exists on a live device
    pub fn is_valid(&self) -> bool {
        self.module.is_some() && self.context.is_active()
    }

    /// Reference for pipeline specs
    pub fn module_ref(&self) -> Option<&ShaderRef> {
        self.module.as_ref()
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            self.context.defer(module);
        }
    }
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("module", &self.module)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::render::shader_cache::SPIRV_MAGIC;

    /// Smallest byte string the loader accepts
    pub(crate) fn fake_spirv() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_rejects_malformed_bytecode() {
        let context = Context::headless();
        let bytes = fake_spirv();
        assert!(matches!(
            Shader::from_spirv(&context, ShaderStage::Vertex, &bytes[..bytes.len() - 1]),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            Shader::from_spirv(&context, ShaderStage::Vertex, &[]),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            Shader::from_spirv(&context, ShaderStage::Vertex, &[0u8; 20]),
            Err(RenderError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_refs_compare_by_module() {
        let context = Context::headless();
        let a = Shader::from_spirv(&context, ShaderStage::Vertex, &fake_spirv()).unwrap();
        let b = Shader::from_spirv(&context, ShaderStage::Vertex, &fake_spirv()).unwrap();
        assert!(a.is_valid());
        assert_eq!(a.module_ref(), a.module_ref().cloned().as_ref());
        assert_ne!(a.module_ref(), b.module_ref());
    }

    #[test]
    fn test_inactive_context() {
        let result = Shader::from_spirv(&Context::inactive(), ShaderStage::Fragment, &fake_spirv());
        assert!(matches!(result, Err(RenderError::InactiveInstance)));
    }

    #[test]
    fn test_drop_defers_module() {
        let context = Context::headless();
        drop(Shader::from_spirv(&context, ShaderStage::Fragment, &fake_spirv()).unwrap());
        assert_eq!(context.pending_releases(), 1);
    }

    #[test]
    fn test_stage_from_path() {
        assert_eq!(ShaderStage::from_path(Path::new("sprite.vert")), Some(ShaderStage::Vertex));
        assert_eq!(ShaderStage::from_path(Path::new("a/sprite.frag.spv")), Some(ShaderStage::Fragment));
        assert_eq!(ShaderStage::from_path(Path::new("sprite.spv")), None);
    }
}
