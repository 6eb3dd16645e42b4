//! GLSL to SPIR-V compilation with an on-disk cache
//!
//! Sources are compiled by invoking `glslc`, found through the configured
//! path, then `$VULKAN_SDK/bin`, then `PATH`. Output is stored as
//! `<xxh3 of stage and source>.spv` in the cache directory, so an unchanged
//! source never reaches the compiler twice. The directory holds nothing but
//! derived files and can be deleted at any time.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::config::ShaderConfig;
use crate::render::error::{RenderError, RenderResult};
use crate::render::resources::ShaderStage;

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words
///
/// The input must be non-empty, a whole number of words, and start with the
/// SPIR-V magic number in either byte order.
pub fn spirv_words(bytes: &[u8]) -> RenderResult<Vec<u32>> {
    if bytes.is_empty() {
        return Err(RenderError::invalid("SPIR-V bytecode is empty"));
    }
    if bytes.len() % 4 != 0 {
        return Err(RenderError::invalid(format!(
            "SPIR-V bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words.first().copied() {
        Some(SPIRV_MAGIC) => Ok(words),
        Some(word) if word.swap_bytes() == SPIRV_MAGIC => {
            for word in &mut words {
                *word = word.swap_bytes();
            }
            Ok(words)
        }
        Some(word) => Err(RenderError::invalid(format!("bad SPIR-V magic number {word:#010x}"))),
        None => Err(RenderError::invalid("SPIR-V bytecode is empty")),
    }
}

/// Compiles GLSL and caches the bytecode on disk
#[derive(Debug, Clone)]
pub struct ShaderCache {
    cache_dir: PathBuf,
    compiler: Option<PathBuf>,
}

impl ShaderCache {
    /// Cache in `cache_dir`, locating the compiler on demand
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            compiler: None,
        }
    }

    /// Cache as configured
    pub fn from_config(config: &ShaderConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            compiler: config.compiler.clone(),
        }
    }

    /// Use this compiler instead of searching for one
    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    /// Directory compiled modules are written to
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache key of a source for a stage
    pub fn key(stage: ShaderStage, source: &str) -> u64 {
        let mut input = Vec::with_capacity(source.len() + 5);
        input.extend_from_slice(stage.extension().as_bytes());
        input.push(0);
        input.extend_from_slice(source.as_bytes());
        xxh3_64(&input)
    }

    /// Where the bytecode for `source` lives once compiled
    pub fn cached_path(&self, stage: ShaderStage, source: &str) -> PathBuf {
        self.cache_dir.join(format!("{:016x}.spv", Self::key(stage, source)))
    }

    /// SPIR-V for `source`, compiling only on a cache miss
    pub fn compile(&self, stage: ShaderStage, source: &str) -> RenderResult<Vec<u8>> {
        let output = self.cached_path(stage, source);
        if let Ok(bytes) = fs::read(&output) {
            if spirv_words(&bytes).is_ok() {
                log::trace!("Shader cache hit {}", output.display());
                return Ok(bytes);
            }
            log::warn!("Discarding corrupt cached shader {}", output.display());
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| RenderError::io(&self.cache_dir, e))?;
        let input = output.with_extension(stage.extension());
        fs::write(&input, source).map_err(|e| RenderError::io(&input, e))?;

        let compiler = self.find_compiler()?;
        log::debug!("Compiling {:?} shader with {}", stage, compiler.display());
        let result = Command::new(&compiler).arg(&input).arg("-o").arg(&output).output();
        let _ = fs::remove_file(&input);

        let result = result.map_err(|e| RenderError::io(&compiler, e))?;
        if !result.status.success() {
            let _ = fs::remove_file(&output);
            return Err(RenderError::invalid(format!(
                "glslc failed ({}): {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        let bytes = fs::read(&output).map_err(|e| RenderError::io(&output, e))?;
        spirv_words(&bytes)?;
        Ok(bytes)
    }

    /// Locate `glslc`
    pub fn find_compiler(&self) -> RenderResult<PathBuf> {
        if let Some(compiler) = &self.compiler {
            return Ok(compiler.clone());
        }

        let exe = if cfg!(target_os = "windows") { "glslc.exe" } else { "glslc" };
        let sdk = env::var_os("VULKAN_SDK").map(|sdk| {
            let bin = if cfg!(target_os = "windows") { "Bin" } else { "bin" };
            PathBuf::from(sdk).join(bin)
        });
        let search = env::var_os("PATH").map(|paths| env::split_paths(&paths).collect::<Vec<_>>());

        sdk.into_iter()
            .chain(search.into_iter().flatten())
            .map(|dir| dir.join(exe))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                RenderError::io(
                    exe,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "glslc not found in VULKAN_SDK or PATH"),
                )
            })
    }

    /// Delete every cached module
    pub fn clear(&self) -> RenderResult<()> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RenderError::io(&self.cache_dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    #[test]
    fn test_spirv_validation() {
        assert_eq!(spirv_words(&module(&[SPIRV_MAGIC, 7])).unwrap(), vec![SPIRV_MAGIC, 7]);
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[3, 2, 35]).is_err());
        assert!(spirv_words(&module(&[0xdead_beef])).is_err());
    }

    #[test]
    fn test_big_endian_module_is_swapped() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 7].iter().flat_map(|word| word.to_be_bytes()).collect();
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn test_key_depends_on_stage_and_source() {
        let a = ShaderCache::key(ShaderStage::Vertex, "void main() {}");
        assert_eq!(a, ShaderCache::key(ShaderStage::Vertex, "void main() {}"));
        assert_ne!(a, ShaderCache::key(ShaderStage::Fragment, "void main() {}"));
        assert_ne!(a, ShaderCache::key(ShaderStage::Vertex, "void main() { }"));
    }

    #[test]
    fn test_cache_hit_skips_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path()).with_compiler(dir.path().join("no-such-glslc"));
        let source = "#version 450\nvoid main() {}\n";
        let bytes = module(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        fs::write(cache.cached_path(ShaderStage::Fragment, source), &bytes).unwrap();

        assert_eq!(cache.compile(ShaderStage::Fragment, source).unwrap(), bytes);
    }

    #[test]
    fn test_missing_compiler_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path()).with_compiler(dir.path().join("no-such-glslc"));
        let result = cache.compile(ShaderStage::Vertex, "void main() {}");
        assert!(matches!(result, Err(RenderError::Io { .. })));
    }

    #[test]
    fn test_clear_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path().join("shaders"));
        assert!(cache.clear().is_ok());
    }
}
