//! GLFW-based window for Vulkan rendering

use ash::vk;
use std::ffi::CString;

use super::dispatch::{DispatchGuard, EventDispatch};
use super::events::{KeyAction, Modifiers, WindowEvent};
use super::WindowSystem;
use crate::core::config::WindowConfig;
use crate::render::error::{RenderError, RenderResult};

/// GLFW window wrapper with proper resource management
pub struct GlfwWindow {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    dispatch: DispatchGuard,
}

impl GlfwWindow {
    /// Open a window configured for Vulkan (no client API)
    pub fn new(config: &WindowConfig) -> RenderResult<Self> {
        let dispatch = EventDispatch::install()?;

        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|e| RenderError::DeviceInitFailure(format!("GLFW initialization failed: {e:?}")))?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(config.resizable));

        let (mut window, events) = glfw
            .create_window(config.width, config.height, &config.title, glfw::WindowMode::Windowed)
            .ok_or_else(|| RenderError::DeviceInitFailure("Window creation failed".to_string()))?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);
        window.set_cursor_pos_polling(true);
        window.set_scroll_polling(true);

        Ok(Self {
            glfw,
            window,
            events,
            dispatch,
        })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }
}

fn convert(event: glfw::WindowEvent) -> Option<WindowEvent> {
    match event {
        glfw::WindowEvent::Close => Some(WindowEvent::Close),
        glfw::WindowEvent::FramebufferSize(width, height) => Some(WindowEvent::Resize {
            width: width.max(0) as u32,
            height: height.max(0) as u32,
        }),
        glfw::WindowEvent::Key(key, scancode, action, mods) => {
            let action = match action {
                glfw::Action::Press => KeyAction::Press,
                glfw::Action::Release => KeyAction::Release,
                glfw::Action::Repeat => KeyAction::Repeat,
            };
            let mut modifiers = Modifiers::empty();
            modifiers.set(Modifiers::SHIFT, mods.contains(glfw::Modifiers::Shift));
            modifiers.set(Modifiers::CONTROL, mods.contains(glfw::Modifiers::Control));
            modifiers.set(Modifiers::ALT, mods.contains(glfw::Modifiers::Alt));
            modifiers.set(Modifiers::SUPER, mods.contains(glfw::Modifiers::Super));
            Some(WindowEvent::Key {
                key: key as i32,
                scancode,
                action,
                modifiers,
            })
        }
        glfw::WindowEvent::CursorPos(x, y) => Some(WindowEvent::Cursor { x, y }),
        glfw::WindowEvent::Scroll(x, y) => Some(WindowEvent::Scroll { x, y }),
        _ => None,
    }
}

impl WindowSystem for GlfwWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.glfw.poll_events();
        for (_, event) in glfw::flush_messages(&self.events) {
            if let Some(event) = convert(event) {
                EventDispatch::emit(event);
            }
        }
        self.dispatch.drain()
    }

    fn required_instance_extensions(&self) -> RenderResult<Vec<CString>> {
        let names = self
            .glfw
            .get_required_instance_extensions()
            .ok_or_else(|| RenderError::DeviceInitFailure("Vulkan is not supported by GLFW".to_string()))?;
        names
            .into_iter()
            .map(|name| CString::new(name).map_err(|e| RenderError::DeviceInitFailure(e.to_string())))
            .collect()
    }

    fn create_surface(&self, _entry: &ash::Entry, instance: &ash::Instance) -> RenderResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance.handle(), std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(RenderError::DeviceInitFailure(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }
}
