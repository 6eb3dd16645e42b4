//! Fixed-capacity ring of per-frame resources
//!
//! One slot belongs to the frame currently being recorded; the others may
//! still be in use by the GPU. `next()` is called once per frame boundary.

/// Ring of up to `N` values with a current slot
pub struct Rotator<T, const N: usize> {
    slots: [Option<T>; N],
    len: usize,
    index: usize,
}

impl<T, const N: usize> Rotator<T, N> {
    /// Empty rotator
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            len: 0,
            index: 0,
        }
    }

    /// Append a slot; hands the value back when already at capacity
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.len == N {
            return Err(value);
        }
        self.slots[self.len] = Some(value);
        self.len += 1;
        Ok(())
    }

    /// The current slot
    ///
    /// # Panics
    /// Panics if nothing has been pushed.
    pub fn get(&self) -> &T {
        match &self.slots[self.index] {
            Some(value) => value,
            None => panic!("Rotator::get on empty rotator"),
        }
    }

    /// The current slot, mutably
    ///
    /// # Panics
    /// Panics if nothing has been pushed.
    pub fn get_mut(&mut self) -> &mut T {
        match &mut self.slots[self.index] {
            Some(value) => value,
            None => panic!("Rotator::get_mut on empty rotator"),
        }
    }

    /// Advance to the next slot, wrapping at the stored count
    pub fn next(&mut self) -> &mut T {
        debug_assert!(self.len > 0, "Rotator::next on empty rotator");
        self.index = (self.index + 1) % self.len.max(1);
        self.get_mut()
    }

    /// Index of the current slot
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of stored slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been pushed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity
    pub const fn capacity(&self) -> usize {
        N
    }

    /// All stored slots in push order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.len].iter().flatten()
    }

    /// All stored slots in push order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots[..self.len].iter_mut().flatten()
    }
}

impl<T, const N: usize> Default for Rotator<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> FromIterator<T> for Rotator<T, N> {
    /// Items beyond capacity are dropped.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut rotator = Self::new();
        for value in iter.into_iter().take(N) {
            let _ = rotator.push(value);
        }
        rotator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_stays_in_range_and_cycles() {
        for count in 1..=4 {
            let mut rotator: Rotator<usize, 4> = (0..count).collect();
            assert_eq!(rotator.len(), count);
            let start = rotator.index();

            for step in 1..=count * 3 {
                rotator.next();
                assert!(rotator.index() < rotator.len());
                assert_eq!(*rotator.get(), step % count);
                if step % count == 0 {
                    assert_eq!(rotator.index(), start);
                }
            }
        }
    }

    #[test]
    fn test_wraps_at_stored_count_not_capacity() {
        let mut rotator: Rotator<&str, 8> = Rotator::new();
        rotator.push("a").unwrap();
        rotator.push("b").unwrap();
        assert_eq!(*rotator.next(), "b");
        assert_eq!(*rotator.next(), "a");
        assert_eq!(rotator.capacity(), 8);
    }

    #[test]
    fn test_push_beyond_capacity_returns_value() {
        let mut rotator: Rotator<u32, 2> = Rotator::new();
        rotator.push(1).unwrap();
        rotator.push(2).unwrap();
        assert_eq!(rotator.push(3), Err(3));
    }

    #[test]
    fn test_get_mut_edits_current_slot() {
        let mut rotator: Rotator<u32, 3> = [10, 20, 30].into_iter().collect();
        *rotator.get_mut() += 1;
        rotator.next();
        *rotator.get_mut() += 2;
        let values: Vec<u32> = rotator.iter().copied().collect();
        assert_eq!(values, vec![11, 22, 30]);
    }
}
