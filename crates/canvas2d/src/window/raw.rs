//! Window system adapter for raw window handles
//!
//! Lets any windowing library that implements the raw-window-handle traits
//! drive the renderer. The owner reports size changes with
//! [`RawWindow::set_framebuffer_size`] and posts input through
//! [`EventDispatch::emit`].

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};

use super::dispatch::{DispatchGuard, EventDispatch};
use super::events::WindowEvent;
use super::WindowSystem;
use crate::render::error::{RenderError, RenderResult};

/// A window known only through its raw handles
pub struct RawWindow<W> {
    window: W,
    size: (u32, u32),
    dispatch: DispatchGuard,
}

impl<W: HasRawWindowHandle + HasRawDisplayHandle> RawWindow<W> {
    /// Wrap `window`, installing the event dispatch table
    pub fn new(window: W, framebuffer_size: (u32, u32)) -> RenderResult<Self> {
        Ok(Self {
            window,
            size: framebuffer_size,
            dispatch: EventDispatch::install()?,
        })
    }

    /// Record a new framebuffer size and queue a resize event
    pub fn set_framebuffer_size(&mut self, width: u32, height: u32) {
        if self.size != (width, height) {
            self.size = (width, height);
            EventDispatch::emit(WindowEvent::Resize { width, height });
        }
    }

    /// The wrapped window
    pub fn inner(&self) -> &W {
        &self.window
    }
}

impl<W: HasRawWindowHandle + HasRawDisplayHandle> WindowSystem for RawWindow<W> {
    fn framebuffer_size(&self) -> (u32, u32) {
        self.size
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.dispatch.drain()
    }

    fn required_instance_extensions(&self) -> RenderResult<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.window.raw_display_handle())
            .map_err(|e| RenderError::DeviceInitFailure(format!("Unsupported display: {e:?}")))?;
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect())
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> RenderResult<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .map_err(|e| RenderError::DeviceInitFailure(format!("Failed to create surface: {e:?}")))
    }
}
