use std::hash::{Hash, Hasher};

/// A generation-checked handle to a binding instance.
///
/// Layout: `u32 index` + `u32 generation`.
///
/// - **index**: slot index in the instance registry
/// - **generation**: bumped every time the slot is reused, so stale handles
///   to a destroyed instance never alias a newer occupant of the same slot
///
/// # Identity
///
/// Two handles are equal if they have the same `(index, generation)`.
#[derive(Clone, Copy)]
pub struct InstanceHandle {
    index: u32,
    generation: u32,
}

impl InstanceHandle {
    /// Creates a new handle from a slot index and generation.
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index of this handle.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation of this handle.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl PartialEq for InstanceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl Eq for InstanceHandle {}

impl Hash for InstanceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceHandle({}@{})", self.index, self.generation)
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceHandle({}@{})", self.index, self.generation)
    }
}
