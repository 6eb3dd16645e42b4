//! Process-wide event dispatch table
//!
//! Some OS callbacks (gamepad hot-plug in particular) are plain function
//! pointers with no user data, so they cannot reach a window object. They
//! post into this table instead. The table exists only while a window holds
//! its [`DispatchGuard`]: it is created when the window is created and
//! cleared when the guard drops, so nothing is left dangling.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::events::{GamepadEvent, WindowEvent};
use crate::render::error::{RenderError, RenderResult};

#[derive(Default)]
struct DispatchTable {
    events: VecDeque<WindowEvent>,
    gamepads: BTreeSet<u32>,
}

static TABLE: Mutex<Option<DispatchTable>> = Mutex::new(None);

fn table() -> MutexGuard<'static, Option<DispatchTable>> {
    TABLE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry points into the dispatch table
pub struct EventDispatch;

impl EventDispatch {
    /// Create the table for the one active window
    ///
    /// Fails with [`RenderError::DuplicateInstance`] while another guard is alive.
    pub fn install() -> RenderResult<DispatchGuard> {
        let mut table = table();
        if table.is_some() {
            return Err(RenderError::DuplicateInstance);
        }
        *table = Some(DispatchTable::default());
        log::debug!("Event dispatch table installed");
        Ok(DispatchGuard { _private: () })
    }

    /// Whether a window currently owns the table
    pub fn is_installed() -> bool {
        table().is_some()
    }

    /// Post an event; returns false when no window is listening
    pub fn emit(event: WindowEvent) -> bool {
        let mut guard = table();
        let Some(table) = guard.as_mut() else {
            log::trace!("Dropping {:?}, no dispatch table installed", event);
            return false;
        };

        if let WindowEvent::Gamepad { id, event: pad } = event {
            match pad {
                GamepadEvent::Connected => {
                    table.gamepads.insert(id);
                }
                GamepadEvent::Disconnected => {
                    table.gamepads.remove(&id);
                }
                _ => {}
            }
        }
        table.events.push_back(event);
        true
    }
}

/// Ownership of the dispatch table; clears it on drop
pub struct DispatchGuard {
    _private: (),
}

impl DispatchGuard {
    /// Take every queued event in arrival order
    pub fn drain(&self) -> Vec<WindowEvent> {
        table()
            .as_mut()
            .map(|table| table.events.drain(..).collect())
            .unwrap_or_default()
    }

    /// Slots of the currently connected gamepads
    pub fn connected_gamepads(&self) -> Vec<u32> {
        table()
            .as_ref()
            .map(|table| table.gamepads.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        *table() = None;
        log::debug!("Event dispatch table cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns the global table so parallel test threads never race on it.
    #[test]
    fn test_dispatch_lifecycle() {
        assert!(!EventDispatch::emit(WindowEvent::Close));

        let guard = EventDispatch::install().unwrap();
        assert!(EventDispatch::is_installed());
        assert!(matches!(EventDispatch::install(), Err(RenderError::DuplicateInstance)));

        assert!(EventDispatch::emit(WindowEvent::Resize { width: 640, height: 480 }));
        assert!(EventDispatch::emit(WindowEvent::Gamepad { id: 2, event: GamepadEvent::Connected }));
        assert!(EventDispatch::emit(WindowEvent::Gamepad { id: 0, event: GamepadEvent::Connected }));
        assert!(EventDispatch::emit(WindowEvent::Gamepad { id: 2, event: GamepadEvent::Disconnected }));
        assert_eq!(guard.connected_gamepads(), vec![0]);

        let events = guard.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], WindowEvent::Resize { width: 640, height: 480 });
        assert!(guard.drain().is_empty());

        drop(guard);
        assert!(!EventDispatch::is_installed());
        assert!(!EventDispatch::emit(WindowEvent::Close));

        let again = EventDispatch::install().unwrap();
        assert!(again.connected_gamepads().is_empty());
    }
}
