use crate::handle::InstanceHandle;

/// Per-slot bookkeeping: where the value lives in the dense array and which
/// generation currently occupies the slot.
#[derive(Clone, Copy)]
struct SlotEntry {
    dense_index: u32,
    generation: u32,
    alive: bool,
}

/// Dense, handle-indexed storage with generation-checked lookup.
///
/// Uses a slot table (`handle index -> dense index`) and a dense array
/// (contiguous values + slot mapping) for O(1) insert/remove/get and
/// cache-friendly iteration. Removal swap-removes: the last dense element is
/// relocated into the removed position, so any cached *dense index* is
/// invalidated by a removal and must be re-derived. Handles stay stable.
///
/// When a value is removed its slot generation is bumped, so stale handles
/// to the old occupant never resolve to a newer value in the same slot.
pub struct HandleVec<T> {
    slots: Vec<SlotEntry>,
    /// Free list of recyclable slot indices (LIFO stack).
    free_slots: Vec<u32>,
    /// Dense array of values (contiguous for iteration).
    dense: Vec<T>,
    /// Slot index corresponding to each dense element.
    dense_slots: Vec<u32>,
}

impl<T> HandleVec<T> {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            dense: Vec::new(),
            dense_slots: Vec::new(),
        }
    }

    /// Inserts a value, reusing a recycled slot if available.
    pub fn add(&mut self, value: T) -> InstanceHandle {
        let dense_index = self.dense.len() as u32;
        let slot_index = if let Some(slot_index) = self.free_slots.pop() {
            let entry = &mut self.slots[slot_index as usize];
            entry.dense_index = dense_index;
            entry.alive = true;
            slot_index
        } else {
            let slot_index = self.slots.len() as u32;
            self.slots.push(SlotEntry {
                dense_index,
                generation: 0,
                alive: true,
            });
            slot_index
        };
        self.dense.push(value);
        self.dense_slots.push(slot_index);
        InstanceHandle::new(slot_index, self.slots[slot_index as usize].generation)
    }

    /// Returns the value for a handle, or `None` if the slot is empty or the
    /// generation does not match (the handle is stale).
    pub fn get(&self, handle: InstanceHandle) -> Option<&T> {
        let entry = self.slots.get(handle.index() as usize)?;
        if entry.alive && entry.generation == handle.generation() {
            Some(&self.dense[entry.dense_index as usize])
        } else {
            None
        }
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut T> {
        let entry = self.slots.get(handle.index() as usize)?;
        if entry.alive && entry.generation == handle.generation() {
            let dense_index = entry.dense_index as usize;
            Some(&mut self.dense[dense_index])
        } else {
            None
        }
    }

    /// Unchecked lookup for handles already validated this call.
    ///
    /// Skips the generation comparison; only legal after [`get`](Self::get)
    /// or [`is_valid`](Self::is_valid) succeeded for the same handle with no
    /// intervening removal.
    pub fn fast_get(&self, handle: InstanceHandle) -> &T {
        debug_assert!(self.is_valid(handle));
        let entry = self.slots[handle.index() as usize];
        &self.dense[entry.dense_index as usize]
    }

    /// Mutable variant of [`fast_get`](Self::fast_get).
    pub fn fast_get_mut(&mut self, handle: InstanceHandle) -> &mut T {
        debug_assert!(self.is_valid(handle));
        let entry = self.slots[handle.index() as usize];
        &mut self.dense[entry.dense_index as usize]
    }

    /// Returns whether the handle refers to a live value of the current
    /// generation.
    pub fn is_valid(&self, handle: InstanceHandle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|entry| entry.alive && entry.generation == handle.generation())
    }

    /// Returns the handle for the value at the given dense index.
    pub fn index_to_handle(&self, dense_index: usize) -> InstanceHandle {
        let slot_index = self.dense_slots[dense_index];
        InstanceHandle::new(slot_index, self.slots[slot_index as usize].generation)
    }

    /// Returns the dense index for a handle. The caller must not cache the
    /// index across removals.
    pub fn handle_to_index(&self, handle: InstanceHandle) -> usize {
        debug_assert!(self.is_valid(handle));
        self.slots[handle.index() as usize].dense_index as usize
    }

    /// Removes the value at the given dense index, compacting storage by
    /// moving the last dense element into the removed position.
    ///
    /// The removed slot's generation is bumped so stale handles miss.
    pub fn remove_at(&mut self, dense_index: usize) -> T {
        let slot_index = self.dense_slots[dense_index] as usize;
        self.slots[slot_index].alive = false;
        self.slots[slot_index].generation = self.slots[slot_index].generation.wrapping_add(1);
        self.free_slots.push(slot_index as u32);

        let last_dense = self.dense.len() - 1;
        if dense_index != last_dense {
            // Swap-remove: fix up the slot entry of the relocated element
            let moved_slot = self.dense_slots[last_dense];
            self.slots[moved_slot as usize].dense_index = dense_index as u32;
            self.dense_slots[dense_index] = moved_slot;
        }
        self.dense_slots.pop();
        self.dense.swap_remove(dense_index)
    }

    /// Returns the number of live values.
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    /// Returns true if the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Returns the value at a dense index.
    pub fn get_at(&self, dense_index: usize) -> &T {
        &self.dense[dense_index]
    }

    /// Iterates over all live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &T)> {
        self.dense.iter().enumerate().map(|(dense_index, value)| {
            let slot_index = self.dense_slots[dense_index];
            (
                InstanceHandle::new(slot_index, self.slots[slot_index as usize].generation),
                value,
            )
        })
    }
}

impl<T> Default for HandleVec<T> {
    fn default() -> Self {
        Self::new()
    }
}
