//! # Canvas2D
//!
//! A thin 2D rendering engine on Vulkan.
//!
//! ## Features
//!
//! - **Instanced drawing**: sprites, text, quads, circles and custom meshes
//! - **Deferred reclamation**: GPU memory outlives the frames that read it
//! - **Font atlases**: glyphs rasterized on demand and shelf-packed
//! - **Lazy pipelines**: compiled once per state combination and render pass
//! - **Headless backend**: resource code runs and is tested without a GPU
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canvas2d::prelude::*;
//!
//! fn run(window: &mut dyn WindowSystem) -> Result<(), RenderError> {
//!     let mut instance = Instance::new(window, RendererConfig::new("demo"))?;
//!     let quad = Quad::new(instance.context(), 64.0, 64.0, Color::WHITE)?;
//!
//!     loop {
//!         for event in window.poll_events() {
//!             match event {
//!                 WindowEvent::Close => return Ok(()),
//!                 WindowEvent::Resize { width, height } => instance.resize(width, height),
//!                 _ => {}
//!             }
//!         }
//!         if let Some(mut surface) = instance.begin_render()? {
//!             surface.draw_primitive(&quad, &RenderState::default());
//!             surface.finish()?;
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Configuration
pub mod config;
pub mod core;

pub mod foundation;
pub mod render;
pub mod window;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        core::config::{RendererConfig, ShaderConfig, WindowConfig},
        foundation::math::{Color, Transform2D, Vec2},
        render::{
            Camera2D, Circle, Context, Drawable, Font, Geometry, GeometryBuffer, Instance, Instance2D, Mesh,
            PipelineFlags, Primitive, Quad, RenderError, RenderResult, RenderState, Shader, ShaderStage, Sprite,
            Surface, Text, Texture,
        },
        window::{WindowEvent, WindowSystem},
    };
}
