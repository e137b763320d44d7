//! Slot allocator for live resources.
//!
//! A [`SlotCollection`] is a sparse arena addressed by small integer
//! handles. Handles are handed out lowest-free-first: the allocator scans
//! from index 0 for the first empty slot and appends only when there is
//! none. The policy is deterministic so callers (and tests) can predict
//! which handle the next allocation receives.

/// Handle identifying a live resource inside a [`SlotCollection`].
pub type Handle = usize;

/// Sparse indexed collection that recycles freed handles.
#[derive(Debug, Clone)]
pub struct SlotCollection<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for SlotCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotCollection<T> {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Return the handle the next [`insert`](Self::insert) will use.
    ///
    /// This is the first empty slot, or `len()` when every slot is occupied.
    pub fn next_id(&self) -> Handle {
        self.slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len())
    }

    /// Store a value under the lowest free handle and return that handle.
    pub fn insert(&mut self, value: T) -> Handle {
        let handle = self.next_id();
        if handle == self.slots.len() {
            self.slots.push(Some(value));
        } else {
            self.slots[handle] = Some(value);
        }
        handle
    }

    /// Clear the slot at `handle` and return what it held.
    ///
    /// Releasing an empty or out-of-range handle is a no-op returning `None`.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        self.slots.get_mut(handle).and_then(Option::take)
    }

    /// Clear the slot at `handle` only if `pred` accepts its current value.
    pub fn release_if<F>(&mut self, handle: Handle, pred: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        match self.slots.get_mut(handle) {
            Some(slot) if slot.as_ref().is_some_and(pred) => slot.take(),
            _ => None,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(handle).and_then(Option::as_mut)
    }

    /// Check whether `handle` currently holds a live value.
    pub fn is_occupied(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of slots, including empty ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Number of live values.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| slot.as_ref().map(|value| (handle, value)))
    }

    /// Remove every live value, returning them with their handles.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let drained = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(handle, slot)| slot.take().map(|value| (handle, value)))
            .collect();
        self.slots.clear();
        drained
    }
}
