//! Device context shared by resource handles
//!
//! A [`Context`] is a cheap clone of the active device: its backend plus the
//! deferred reclamation queue every handle releases allocations into. The
//! rendering [`Instance`](crate::render::Instance) hands one out; tests and
//! offscreen tools can use [`Context::headless`].
//!
//! A context is inactive when it was never attached to a device, or after its
//! instance shut down. Handles built against an inactive context are empty
//! and ignore writes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::render::backend::headless::HeadlessDevice;
use crate::render::backend::{AllocationStats, DeviceBackend};
use crate::render::deferred::DeferredQueue;

struct Shared {
    backend: Rc<dyn DeviceBackend>,
    deferred: RefCell<DeferredQueue>,
    active: Cell<bool>,
    frame: Cell<u64>,
}

/// Handle to the active device and its deferred queue
#[derive(Clone, Default)]
pub struct Context {
    shared: Option<Rc<Shared>>,
}

impl Context {
    /// Attach to `backend`, deferring releases by `deferred_delay` frames
    pub fn new(backend: Rc<dyn DeviceBackend>, deferred_delay: u32) -> Self {
        log::debug!("Creating {} context with deferred delay {}", backend.name(), deferred_delay);
        Self {
            shared: Some(Rc::new(Shared {
                backend,
                deferred: RefCell::new(DeferredQueue::new(deferred_delay)),
                active: Cell::new(true),
                frame: Cell::new(0),
            })),
        }
    }

    /// Context on a fresh [`HeadlessDevice`] with the default delay
    pub fn headless() -> Self {
        Self::new(Rc::new(HeadlessDevice::new()), DeferredQueue::default().default_delay())
    }

    /// A context that is not attached to any device
    pub fn inactive() -> Self {
        Self { shared: None }
    }

    /// Whether operations reach a device
    pub fn is_active(&self) -> bool {
        self.shared.as_ref().is_some_and(|shared| shared.active.get())
    }

    /// The backend, if active
    pub fn backend(&self) -> Option<&Rc<dyn DeviceBackend>> {
        self.shared
            .as_ref()
            .filter(|shared| shared.active.get())
            .map(|shared| &shared.backend)
    }

    /// Hand `value` to the deferred queue
    ///
    /// Without an active device nothing can still be reading it, so it is
    /// dropped at once.
    pub fn defer<T: 'static>(&self, value: T) {
        match &self.shared {
            Some(shared) if shared.active.get() => shared.deferred.borrow_mut().push(value),
            _ => drop(value),
        }
    }

    /// Number of values waiting in the deferred queue
    pub fn pending_releases(&self) -> usize {
        self.shared.as_ref().map_or(0, |shared| shared.deferred.borrow().len())
    }

    /// Allocation counters of the backend
    pub fn stats(&self) -> AllocationStats {
        self.shared
            .as_ref()
            .map(|shared| shared.backend.stats())
            .unwrap_or_default()
    }

    /// Frame boundaries passed since the context was created
    pub fn frame_index(&self) -> u64 {
        self.shared.as_ref().map_or(0, |shared| shared.frame.get())
    }

    /// Frame boundaries a deferred value waits before it is dropped
    pub fn deferred_delay(&self) -> u32 {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.deferred.borrow().default_delay())
    }

    /// Count down one frame boundary in the deferred queue
    ///
    /// Called by the instance once per frame, after submission.
    pub fn end_frame(&self) -> usize {
        self.shared.as_ref().map_or(0, |shared| {
            shared.frame.set(shared.frame.get() + 1);
            shared.deferred.borrow_mut().decrement()
        })
    }

    /// Wait for the device, free everything deferred and go inactive
    pub(crate) fn shutdown(&self) {
        if let Some(shared) = &self.shared {
            shared.backend.wait_idle();
            let freed = shared.deferred.borrow_mut().flush();
            shared.active.set(false);
            log::debug!("Context shut down, released {} deferred resource(s)", freed);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.shared.as_ref().map(|shared| shared.backend.name()))
            .field("active", &self.is_active())
            .field("pending_releases", &self.pending_releases())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::GpuBuffer;
    use ash::vk;

    #[test]
    fn test_inactive_context() {
        let context = Context::inactive();
        assert!(!context.is_active());
        assert!(context.backend().is_none());
        context.defer(5u32);
        assert_eq!(context.pending_releases(), 0);
    }

    #[test]
    fn test_deferred_buffer_freed_after_delay() {
        let context = Context::headless();
        let backend = context.backend().unwrap().clone();
        let buffer = GpuBuffer::new(&backend, 64, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        context.defer(buffer);

        assert_eq!(context.stats().live_buffers, 1);
        context.end_frame();
        context.end_frame();
        assert_eq!(context.stats().live_buffers, 1);
        context.end_frame();
        assert_eq!(context.stats().live_buffers, 0);
    }

    #[test]
    fn test_frame_index_counts_boundaries() {
        let context = Context::headless();
        assert_eq!(context.frame_index(), 0);
        assert_eq!(context.deferred_delay(), 3);
        context.end_frame();
        context.clone().end_frame();
        assert_eq!(context.frame_index(), 2);
        assert_eq!(Context::inactive().frame_index(), 0);
    }

    #[test]
    fn test_shutdown_flushes_and_deactivates() {
        let context = Context::headless();
        let clone = context.clone();
        let backend = context.backend().unwrap().clone();
        context.defer(GpuBuffer::new(&backend, 8, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap());

        context.shutdown();
        assert!(!clone.is_active());
        assert_eq!(clone.pending_releases(), 0);
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
