//! # Rendering System
//!
//! A thin 2D renderer over Vulkan. Applications create one [`Instance`] per
//! window, build resources against its [`Context`], and record each frame
//! through the [`Surface`] that [`Instance::begin_render`] hands out.
//!
//! ## Architecture
//!
//! - **Instance**: device, swapchain, frame rotation and pipeline factory
//! - **Surface**: per-frame draw recorder
//! - **Context**: shared handle to the device and its deferred release queue
//! - **Resources**: geometry buffers, textures, shaders and fonts
//! - **Backend**: the [`DeviceBackend`] seam, implemented by Vulkan and by a
//!   CPU-side headless device used in tests
//!
//! ## Resource Lifetime
//!
//! GPU memory is never freed while a frame that may read it is in flight.
//! Dropping or replacing a resource hands its allocations to the deferred
//! queue, which frees them a fixed number of frame boundaries later.

pub mod atlas;
pub mod backend;
pub mod camera;
pub mod context;
pub mod deferred;
pub mod drawable;
pub mod error;
pub mod geometry;
pub mod instance;
pub mod pipeline;
pub mod primitives;
pub mod resources;
pub mod rotator;
pub mod shader_cache;
pub mod surface;

pub use atlas::{Atlas, AtlasId, Bulk, Placement, ShelfPacker, UvRect, MAX_ATLAS_EXTENT};
pub use backend::headless::HeadlessDevice;
pub use backend::{AllocationStats, DeviceBackend};
pub use camera::Camera2D;
pub use context::Context;
pub use deferred::DeferredQueue;
pub use drawable::{Drawable, GpuInstance, Instance2D, RenderState};
pub use error::{RenderError, RenderResult};
pub use geometry::{Geometry, PolygonMode, Topology, Vertex};
pub use instance::Instance;
pub use pipeline::{PipelineFlags, PipelineSpec};
pub use primitives::{Circle, Mesh, Primitive, Quad, Shape, Sprite, Text};
pub use resources::{Bitmap, Font, GeometryBuffer, Region, Shader, ShaderStage, Texture};
pub use rotator::Rotator;
pub use shader_cache::ShaderCache;
pub use surface::{RecorderState, Surface, MATERIAL_SIZE};
