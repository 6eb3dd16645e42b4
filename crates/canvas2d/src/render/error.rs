//! Renderer error taxonomy

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the renderer
#[derive(Error, Debug)]
pub enum RenderError {
    /// Malformed input such as empty geometry or an out-of-bounds region
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle or context was never constructed or its device is gone
    #[error("Operation on an inactive instance")]
    InactiveInstance,

    /// A second rendering instance was requested while one is alive
    #[error("A rendering instance is already active")]
    DuplicateInstance,

    /// No compatible GPU, missing driver support, or surface creation failed
    #[error("Device initialization failed: {0}")]
    DeviceInitFailure(String),

    /// Asset load failure at the codec boundary
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File that failed to load
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Vulkan(vk::Result),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RenderError {
    /// Shorthand for [`RenderError::InvalidArgument`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        Self::Vulkan(result)
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;
