//! Deferred reclamation of GPU resources
//!
//! Command buffers are recorded several frames ahead of the GPU finishing
//! them, so a buffer or image released on the CPU side may still be read by
//! an in-flight frame. Released resources are parked here with a countdown
//! and dropped only once that many frame boundaries have passed.
//!
//! Entries are type-erased: anything `'static` can be queued and its `Drop`
//! impl is the destructor. GPU wrappers such as
//! [`GpuBuffer`](crate::render::backend::GpuBuffer) return their memory to
//! the backend when dropped.

use std::any::Any;
use std::fmt;

struct Entry {
    value: Box<dyn Any>,
    delay: u32,
}

/// Queue of values waiting a number of frames before being dropped
pub struct DeferredQueue {
    entries: Vec<Entry>,
    default_delay: u32,
}

impl DeferredQueue {
    /// Create a queue whose `push` waits `default_delay` frames
    pub fn new(default_delay: u32) -> Self {
        Self {
            entries: Vec::new(),
            default_delay,
        }
    }

    /// Delay applied by [`DeferredQueue::push`]
    pub fn default_delay(&self) -> u32 {
        self.default_delay
    }

    /// Queue a value for destruction after the default delay
    pub fn push<T: 'static>(&mut self, value: T) {
        self.push_with_delay(value, self.default_delay);
    }

    /// Queue a value for destruction after `delay` frame boundaries
    ///
    /// A delay of zero drops the value immediately.
    pub fn push_with_delay<T: 'static>(&mut self, value: T, delay: u32) {
        if delay == 0 {
            drop(value);
            return;
        }
        self.entries.push(Entry {
            value: Box::new(value),
            delay,
        });
    }

    /// Count down one frame boundary, dropping every entry that expires
    ///
    /// Returns the number of entries reclaimed.
    pub fn decrement(&mut self) -> usize {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            entry.delay -= 1;
            if entry.delay == 0 {
                expired.push(self.entries.swap_remove(index).value);
            } else {
                index += 1;
            }
        }

        let count = expired.len();
        if count > 0 {
            log::trace!("Reclaimed {} deferred resource(s), {} pending", count, self.entries.len());
        }
        count
    }

    /// Drop everything now
    ///
    /// Only valid once the device is idle.
    pub fn flush(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("pending", &self.entries.len())
            .field("default_delay", &self.default_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    fn flag() -> (Rc<Cell<bool>>, DropFlag) {
        let dropped = Rc::new(Cell::new(false));
        (dropped.clone(), DropFlag(dropped))
    }

    #[test]
    fn test_destroyed_exactly_on_final_tick() {
        for delay in 1..=5 {
            let mut queue = DeferredQueue::new(delay);
            let (dropped, value) = flag();
            queue.push(value);

            for _ in 1..delay {
                queue.decrement();
                assert!(!dropped.get(), "dropped early with delay {delay}");
            }
            assert_eq!(queue.decrement(), 1);
            assert!(dropped.get(), "not dropped on tick {delay}");
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_mixed_delays() {
        let mut queue = DeferredQueue::default();
        let (first, a) = flag();
        let (second, b) = flag();
        queue.push_with_delay(a, 1);
        queue.push_with_delay(b, 2);

        queue.decrement();
        assert!(first.get());
        assert!(!second.get());
        assert_eq!(queue.len(), 1);

        queue.decrement();
        assert!(second.get());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_delay_drops_immediately() {
        let mut queue = DeferredQueue::new(3);
        let (dropped, value) = flag();
        queue.push_with_delay(value, 0);
        assert!(dropped.get());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_drops_everything() {
        let mut queue = DeferredQueue::new(3);
        let (dropped, value) = flag();
        queue.push(value);
        queue.push(vec![1u8, 2, 3]);
        assert_eq!(queue.flush(), 2);
        assert!(dropped.get());
    }

    #[test]
    fn test_decrement_on_empty_queue() {
        let mut queue = DeferredQueue::new(2);
        assert_eq!(queue.decrement(), 0);
    }
}
