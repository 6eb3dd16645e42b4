//! # Unified Configuration System
//!
//! Configuration for the window and the renderer, loadable from TOML or RON.
//!
//! ## Frame pacing
//!
//! `frames_in_flight` sets how many frames the CPU may record ahead of the
//! GPU. Everything that is rotated per frame (command buffers, fences,
//! descriptor arenas) is sized from it. `deferred_delay` is how many frame
//! boundaries a released GPU allocation waits before it is actually freed, so
//! it must be strictly greater than `frames_in_flight`.

use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};

use crate::foundation::math::Color;

pub use crate::config::{Config, ConfigError};

/// Upper bound on buffered frames; the frame rotator is sized to this.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// # Shader Configuration
///
/// Where the default sprite shaders live and where compiled GLSL is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Path to the vertex shader SPIR-V file
    pub vertex_shader_path: String,
    /// Path to the fragment shader SPIR-V file
    pub fragment_shader_path: String,
    /// Directory holding cached SPIR-V compiled from GLSL source
    pub cache_dir: PathBuf,
    /// Explicit path to `glslc`; `VULKAN_SDK` and `PATH` are searched otherwise
    pub compiler: Option<PathBuf>,
}

impl ShaderConfig {
    /// Create a new shader configuration
    pub fn new(vertex_path: impl Into<String>, fragment_path: impl Into<String>) -> Self {
        Self {
            vertex_shader_path: vertex_path.into(),
            fragment_shader_path: fragment_path.into(),
            cache_dir: PathBuf::from("target/shader-cache"),
            compiler: None,
        }
    }

    /// Create shader config with automatic path resolution
    ///
    /// Tries the usual output locations so apps can be started from the
    /// workspace root or from their own directory.
    pub fn with_path_resolution(base_vertex: &str, base_fragment: &str) -> Self {
        let shader_dirs = ["target/shaders/", "shaders/", "../../target/shaders/", "./"];

        let find = |name: &str| {
            shader_dirs
                .iter()
                .map(|dir| format!("{dir}{name}"))
                .find(|candidate| Path::new(candidate).exists())
                .unwrap_or_else(|| format!("target/shaders/{name}"))
        };

        Self::new(find(base_vertex), find(base_fragment))
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution("sprite.vert.spv", "sprite.frag.spv")
    }
}

/// # Renderer Configuration
///
/// Vulkan instance metadata, frame pacing and resource pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Frame boundaries a released allocation survives before being freed
    pub deferred_delay: u32,
    /// Descriptor sets per pool block
    pub descriptor_block_size: u32,
    /// Fence wait timeout in nanoseconds
    pub fence_timeout_ns: u64,
    /// Prefer FIFO presentation over MAILBOX
    pub vsync: bool,
    /// Colour attachment sample count
    pub msaa_samples: u32,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: Option<bool>,
    /// Colour the swapchain image is cleared to
    pub clear_color: Color,
    /// Default shader configuration
    pub shaders: ShaderConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            frames_in_flight: 2,
            deferred_delay: 3,
            descriptor_block_size: 64,
            fence_timeout_ns: 5_000_000_000,
            vsync: true,
            msaa_samples: 1,
            enable_validation: None,
            clear_color: Color::BLACK,
            shaders: ShaderConfig::default(),
        }
    }

    /// Set application version
    #[must_use]
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set custom shader configuration
    #[must_use]
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Set frames in flight, raising the deferred delay past it if needed
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        let minimum = u32::try_from(frames).unwrap_or(u32::MAX).saturating_add(1);
        self.deferred_delay = self.deferred_delay.max(minimum);
        self
    }

    /// Set the deferred reclamation delay
    #[must_use]
    pub fn with_deferred_delay(mut self, delay: u32) -> Self {
        self.deferred_delay = delay;
        self
    }

    /// Set the clear colour
    #[must_use]
    pub fn with_clear_color(mut self, color: Color) -> Self {
        self.clear_color = color;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    ///
    /// Shader paths are not checked here; a missing default shader only
    /// disables the default pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }

        if (self.deferred_delay as usize) <= self.frames_in_flight {
            return Err(ConfigError::Invalid(format!(
                "Deferred delay {} must exceed {} frames in flight",
                self.deferred_delay, self.frames_in_flight
            )));
        }

        if self.descriptor_block_size == 0 {
            return Err(ConfigError::Invalid("Descriptor block size must be at least 1".to_string()));
        }

        if !self.msaa_samples.is_power_of_two() || self.msaa_samples > 8 {
            return Err(ConfigError::Invalid(format!(
                "MSAA sample count must be 1, 2, 4 or 8, got {}",
                self.msaa_samples
            )));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("canvas2d application")
    }
}

impl Config for RendererConfig {}

/// # Window Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
    /// Whether the user may resize the window
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "canvas2d".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// # Application Configuration
///
/// Top-level file combining window and renderer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Renderer settings
    pub renderer: RendererConfig,
}

impl ApplicationConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid("Window extent must be non-zero".to_string()));
        }
        self.renderer.validate()
    }
}

impl Config for ApplicationConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_renderer_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.deferred_delay as usize > config.frames_in_flight);
    }

    #[test]
    fn test_delay_shorter_than_frames_in_flight_is_rejected() {
        let config = RendererConfig::default()
            .with_frames_in_flight(3)
            .with_deferred_delay(2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_frames_in_flight_raises_delay() {
        let config = RendererConfig::default().with_frames_in_flight(4);
        assert_eq!(config.deferred_delay, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_equal_to_frames_in_flight_is_rejected() {
        let config = RendererConfig::default()
            .with_frames_in_flight(2)
            .with_deferred_delay(2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = config.with_deferred_delay(3);
        assert!(config.validate().is_ok());

        let config = RendererConfig::default().with_deferred_delay(1).with_frames_in_flight(1);
        assert_eq!(config.deferred_delay, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_sample_count() {
        let mut config = RendererConfig::default();
        config.msaa_samples = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_and_ron_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ApplicationConfig::default();
        config.window.title = "atlas viewer".to_string();
        config.renderer.descriptor_block_size = 32;

        for name in ["app.toml", "app.ron"] {
            let path = dir.path().join(name);
            config.save_to_file(&path).unwrap();
            let loaded = ApplicationConfig::load_from_file(&path).unwrap();
            assert_eq!(loaded.window.title, "atlas viewer");
            assert_eq!(loaded.renderer.descriptor_block_size, 32);
        }
    }

    #[test]
    fn test_unknown_extension() {
        let result = ApplicationConfig::load_from_file("settings.json");
        assert!(matches!(result, Err(ConfigError::Io(_)) | Err(ConfigError::UnsupportedFormat(_))));
        let err = ApplicationConfig::default().save_to_file("settings.json").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }
}
