//! Input and window events

use bitflags::bitflags;

bitflags! {
    /// Modifier keys held during a key event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        /// Either shift key
        const SHIFT = 1 << 0;
        /// Either control key
        const CONTROL = 1 << 1;
        /// Either alt key
        const ALT = 1 << 2;
        /// Either super/logo key
        const SUPER = 1 << 3;
    }
}

/// Key state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Key went down
    Press,
    /// Key went up
    Release,
    /// Key held long enough to repeat
    Repeat,
}

/// Gamepad state change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GamepadEvent {
    /// Pad plugged in
    Connected,
    /// Pad removed
    Disconnected,
    /// Button pressed or released
    Button {
        /// Button index
        button: u8,
        /// New state
        pressed: bool,
    },
    /// Axis moved
    Axis {
        /// Axis index
        axis: u8,
        /// Position in `[-1, 1]`
        value: f32,
    },
}

/// Everything a window reports to the application
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    /// The user asked to close the window
    Close,
    /// The framebuffer changed size; the swapchain must be rebuilt
    Resize {
        /// New width in pixels
        width: u32,
        /// New height in pixels
        height: u32,
    },
    /// Keyboard input
    Key {
        /// Platform key code
        key: i32,
        /// Platform scancode
        scancode: i32,
        /// What happened
        action: KeyAction,
        /// Held modifiers
        modifiers: Modifiers,
    },
    /// Cursor moved, in window coordinates
    Cursor {
        /// Horizontal position
        x: f64,
        /// Vertical position
        y: f64,
    },
    /// Scroll wheel or touchpad scroll
    Scroll {
        /// Horizontal offset
        x: f64,
        /// Vertical offset
        y: f64,
    },
    /// Gamepad input
    Gamepad {
        /// Pad slot
        id: u32,
        /// What happened
        event: GamepadEvent,
    },
}

impl WindowEvent {
    /// Whether the renderer must rebuild its swapchain
    pub fn requires_resize(&self) -> bool {
        matches!(self, Self::Resize { .. })
    }
}
