//! Core engine configuration

pub mod config;

pub use config::{ApplicationConfig, RendererConfig, ShaderConfig, WindowConfig, MAX_FRAMES_IN_FLIGHT};
