use std::rc::Rc;

use crate::binding::{Binding, ComplexBinding};
use crate::handle::InstanceHandle;
use crate::property::{DependencyPropertyDefinition, PropertyMethods};

/// What kind of engine-managed object a registry record represents.
/// Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Plain object that can own properties. Never a bind target or source.
    DependencyObject,
    /// A bindable value-carrying property.
    DependencyProperty,
    /// A write-only property that receives a callback when its bound data
    /// source changes.
    DependencyObserverProperty,
    /// An external data source that observers bind to.
    DataSourceObject,
}

/// Lifecycle of a registry record. Strictly forward-moving:
/// `Alive -> DestroyScheduled -> Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Fully usable.
    Alive,
    /// Queued for destruction; method objects already detached, edges are
    /// unwound at the start of the next execution pass.
    DestroyScheduled,
    /// Edges severed, about to leave the registry.
    Destroyed,
}

/// One registry entry: identity, lifecycle, graph edges, owned children, and
/// the collaborator-supplied method/converter objects.
pub(crate) struct InstanceRecord {
    kind: InstanceKind,
    state: InstanceState,
    flags: u32,
    /// Upstream instances this record depends on (ordered, bounded by
    /// [`MAX_MULTI_BIND_SOURCES`](crate::binding::MAX_MULTI_BIND_SOURCES)).
    /// Empty unless a binding was committed.
    pub(crate) sources: Vec<InstanceHandle>,
    /// Downstream instances that declared this record as a source. Reverse
    /// edges, maintained symmetrically with `sources`.
    pub(crate) targets: Vec<InstanceHandle>,
    /// Child properties owned by this instance.
    pub(crate) properties: Vec<InstanceHandle>,
    /// Owning instance, for property kinds. Used to unlink the child from
    /// the owner's `properties` list when the child is reaped on its own.
    pub(crate) owner: Option<InstanceHandle>,
    /// Abstract get/set/type interface; present only for property kinds and
    /// cleared the instant destruction is scheduled.
    pub(crate) methods: Option<Rc<dyn PropertyMethods>>,
    /// Converter committed with the current binding, if any.
    complex: Option<ComplexBinding>,
    /// Property definition, kept for diagnostics.
    pub(crate) definition: Option<DependencyPropertyDefinition>,
}

impl InstanceRecord {
    /// The record may be marked changed and propagate to its targets.
    pub const OBSERVABLE: u32 = 1 << 0;
    /// A change for this record is already queued.
    pub const PENDING_CHANGE: u32 = 1 << 1;

    /// Creates a record for an object without methods (dependency object or
    /// data source).
    pub fn new_object(kind: InstanceKind, flags: u32) -> Self {
        Self {
            kind,
            state: InstanceState::Alive,
            flags,
            sources: Vec::new(),
            targets: Vec::new(),
            properties: Vec::new(),
            owner: None,
            methods: None,
            complex: None,
            definition: None,
        }
    }

    /// Creates a record for a property owned by `owner` with an attached
    /// method object.
    pub fn new_property(
        kind: InstanceKind,
        flags: u32,
        owner: InstanceHandle,
        definition: DependencyPropertyDefinition,
        methods: Rc<dyn PropertyMethods>,
    ) -> Self {
        Self {
            kind,
            state: InstanceState::Alive,
            flags,
            sources: Vec::new(),
            targets: Vec::new(),
            properties: Vec::new(),
            owner: Some(owner),
            methods: Some(methods),
            complex: None,
            definition: Some(definition),
        }
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn set_state(&mut self, state: InstanceState) {
        debug_assert!(state as u32 >= self.state as u32, "state moves forward only");
        self.state = state;
    }

    pub fn is_alive(&self) -> bool {
        self.state == InstanceState::Alive
    }

    pub fn is_observable(&self) -> bool {
        self.flags & Self::OBSERVABLE != 0
    }

    pub fn has_pending_change(&self) -> bool {
        self.flags & Self::PENDING_CHANGE != 0
    }

    pub fn mark_pending_change(&mut self) {
        self.flags |= Self::PENDING_CHANGE;
    }

    pub fn clear_pending_change(&mut self) {
        self.flags &= !Self::PENDING_CHANGE;
    }

    /// Returns true if a binding with at least one source is committed.
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn contains_source(&self, handle: InstanceHandle) -> bool {
        self.sources.contains(&handle)
    }

    /// Commits the source set and converter of a validated binding.
    pub fn set_source(&mut self, binding: &Binding) {
        self.sources.clear();
        self.sources.extend_from_slice(binding.sources());
        self.complex = binding.complex_binding().cloned();
    }

    /// Drops the committed source set and converter.
    pub fn clear_sources(&mut self) {
        self.sources.clear();
        self.complex = None;
    }

    /// Returns the converter committed with the current binding.
    pub fn source_user_binding(&self) -> Option<&ComplexBinding> {
        self.complex.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_record_defaults() {
        let record = InstanceRecord::new_object(InstanceKind::DependencyObject, 0);
        assert_eq!(record.kind(), InstanceKind::DependencyObject);
        assert_eq!(record.state(), InstanceState::Alive);
        assert!(!record.is_observable());
        assert!(!record.has_sources());
        assert!(record.methods.is_none());
    }

    #[test]
    fn pending_change_flag_roundtrip() {
        let mut record =
            InstanceRecord::new_object(InstanceKind::DataSourceObject, InstanceRecord::OBSERVABLE);
        assert!(record.is_observable());
        assert!(!record.has_pending_change());

        record.mark_pending_change();
        assert!(record.has_pending_change());
        assert!(record.is_observable()); // Untouched

        record.clear_pending_change();
        assert!(!record.has_pending_change());
    }

    #[test]
    fn set_source_commits_binding() {
        let mut record = InstanceRecord::new_object(InstanceKind::DependencyProperty, 0);
        let source = InstanceHandle::new(1, 0);
        record.set_source(&Binding::new(source));

        assert!(record.has_sources());
        assert!(record.contains_source(source));

        record.clear_sources();
        assert!(!record.has_sources());
        assert!(record.source_user_binding().is_none());
    }
}
