//! Window collaborator interface
//!
//! The renderer needs three things from a window system: the framebuffer
//! size, a stream of input events, and a Vulkan surface. [`WindowSystem`]
//! captures exactly that. Two implementations ship with the crate:
//!
//! - [`RawWindow`] wraps anything implementing the raw-window-handle traits
//!   and creates the surface through `ash-window`; its events arrive through
//!   the [`EventDispatch`] table
//! - `GlfwWindow` (feature `glfw`) owns a GLFW window

pub mod dispatch;
pub mod events;
#[cfg(feature = "glfw")]
pub mod glfw_window;
pub mod raw;

pub use dispatch::{DispatchGuard, EventDispatch};
pub use events::{GamepadEvent, KeyAction, Modifiers, WindowEvent};
#[cfg(feature = "glfw")]
pub use glfw_window::GlfwWindow;
pub use raw::RawWindow;

use ash::vk;
use std::ffi::CString;

use crate::render::error::RenderResult;

/// What the renderer consumes from a window
pub trait WindowSystem {
    /// Framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);

    /// Pump the OS queue and return everything received since the last call
    fn poll_events(&mut self) -> Vec<WindowEvent>;

    /// Instance extensions needed to present to this window
    fn required_instance_extensions(&self) -> RenderResult<Vec<CString>>;

    /// Create a presentation surface on `instance`
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> RenderResult<vk::SurfaceKHR>;
}
