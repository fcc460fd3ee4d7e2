//! The binding service: instance registry, graph mutation, change scheduling,
//! and the per-frame execution loop.
//!
//! Single-threaded and cooperative by design. One logical thread drives
//! [`DataBindingService::execute_changes`] plus the create/bind/destroy API
//! between frames; reentrancy is controlled by an explicit call-context state
//! machine instead of locks.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::binding::{Binding, ComplexBinding, MAX_MULTI_BIND_SOURCES};
use crate::error::{BindingServiceError, Result};
use crate::handle::InstanceHandle;
use crate::handle_vec::HandleVec;
use crate::property::{
    DataSourceFlags, DependencyPropertyDefinition, PropertyMethods, PropertySetResult,
};
use crate::record::{InstanceKind, InstanceRecord, InstanceState};

/// Ceiling on change-round iterations inside one `execute_changes` call.
/// Exceeding it logs a warning and exits the round; it never panics.
const MAX_EXECUTE_LOOP_COUNT: u32 = 1024;

/// Which engine entry point is currently on the stack. Mutating operations
/// require specific states; calling them from the wrong state is a usage
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CallContextState {
    #[default]
    Idle,
    ExecutingChanges,
    ExecutingObserverCallbacks,
    ExecutePendingBindings,
}

#[derive(Debug, Clone, Copy, Default)]
struct CallContext {
    state: CallContextState,
    /// The instance whose dependents are currently being written, used to
    /// accept self-notifications during change execution.
    handle: Option<InstanceHandle>,
}

/// An observer bind that arrived outside a legal direct-call context and is
/// replayed during the pending-bindings phase.
struct PendingBinding {
    target: InstanceHandle,
    source: InstanceHandle,
}

/// A deferred observer notification, dispatched in the callback phase.
struct ObserverCallback {
    target: InstanceHandle,
    source: InstanceHandle,
}

/// Runtime graph engine wiring properties together so that changes to one
/// automatically propagate to all dependents.
///
/// Client code creates instances, declares bindings on them, marks sources
/// changed, and calls [`execute_changes`](Self::execute_changes) once per
/// frame to run the propagation to a fixed point.
pub struct DataBindingService {
    instances: HandleVec<InstanceRecord>,
    call_context: CallContext,
    /// Instances with a pending change, each enqueued at most once.
    changes: VecDeque<InstanceHandle>,
    pending_bindings: VecDeque<PendingBinding>,
    pending_observer_callbacks: VecDeque<ObserverCallback>,
    /// Capacity is pre-reserved at every create so the push during destroy
    /// scheduling can never reallocate mid-teardown.
    scheduled_for_destroy: Vec<InstanceHandle>,
}

impl DataBindingService {
    pub fn new() -> Self {
        Self {
            instances: HandleVec::new(),
            call_context: CallContext::default(),
            changes: VecDeque::new(),
            pending_bindings: VecDeque::new(),
            pending_observer_callbacks: VecDeque::new(),
            scheduled_for_destroy: Vec::new(),
        }
    }

    /// Number of instances currently in the registry (including ones
    /// scheduled for destruction but not yet reaped).
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Returns whether the handle refers to a current registry entry.
    pub fn is_valid_handle(&self, handle: InstanceHandle) -> bool {
        self.instances.is_valid(handle)
    }

    /// Number of committed binding sources on an instance, or `None` for an
    /// unknown handle.
    pub fn instance_source_count(&self, handle: InstanceHandle) -> Option<usize> {
        self.instances.get(handle).map(|record| record.sources.len())
    }

    /// Number of downstream targets depending on an instance, or `None` for
    /// an unknown handle.
    pub fn instance_target_count(&self, handle: InstanceHandle) -> Option<usize> {
        self.instances.get(handle).map(|record| record.targets.len())
    }

    /// Creates a dependency object: a parent for properties, never itself a
    /// bind target or source.
    pub fn create_dependency_object(&mut self) -> Result<InstanceHandle> {
        self.require_create_context("create_dependency_object: can not be called from this context")?;
        self.ensure_destroy_capacity();
        Ok(self
            .instances
            .add(InstanceRecord::new_object(InstanceKind::DependencyObject, 0)))
    }

    /// Creates a data source object that observer properties can bind to.
    pub fn create_data_source_object(&mut self, flags: DataSourceFlags) -> Result<InstanceHandle> {
        self.require_create_context("create_data_source_object: can not be called from this context")?;
        self.ensure_destroy_capacity();
        let record_flags = if flags.contains(DataSourceFlags::OBSERVABLE) {
            InstanceRecord::OBSERVABLE
        } else {
            0
        };
        Ok(self
            .instances
            .add(InstanceRecord::new_object(InstanceKind::DataSourceObject, record_flags)))
    }

    /// Creates a dependency property owned by `owner`.
    pub fn create_dependency_object_property(
        &mut self,
        owner: InstanceHandle,
        definition: DependencyPropertyDefinition,
        methods: Rc<dyn PropertyMethods>,
    ) -> Result<InstanceHandle> {
        self.require_create_context("create_dependency_object_property: can not be called from this context")?;
        // Properties are observable by default so they can send change
        // notifications
        self.do_create_property(
            owner,
            definition,
            methods,
            InstanceKind::DependencyProperty,
            InstanceRecord::OBSERVABLE,
        )
    }

    /// Creates an observer property owned by `owner`. Observer properties
    /// are not observable themselves; they exist to receive callbacks.
    pub fn create_dependency_object_observer_property(
        &mut self,
        owner: InstanceHandle,
        definition: DependencyPropertyDefinition,
        methods: Rc<dyn PropertyMethods>,
    ) -> Result<InstanceHandle> {
        self.require_create_context("create_dependency_object_observer_property: can not be called from this context")?;
        self.do_create_property(
            owner,
            definition,
            methods,
            InstanceKind::DependencyObserverProperty,
            0,
        )
    }

    /// Schedules a property for destruction. See
    /// [`destroy_instance`](Self::destroy_instance).
    pub fn destroy_property(&mut self, handle: InstanceHandle) -> bool {
        debug_assert!(
            !self.instances.is_valid(handle)
                || matches!(
                    self.instances.fast_get(handle).kind(),
                    InstanceKind::DependencyProperty | InstanceKind::DependencyObserverProperty
                )
        );
        self.destroy_instance(handle)
    }

    /// Schedules an instance and all of its owned properties for
    /// destruction. Returns false if the handle was unknown or not alive.
    ///
    /// Destruction is always deferred: the record is marked, its method
    /// objects are detached immediately so no stale call can occur, and the
    /// graph is unwound at the start of the next execution pass. This path
    /// never fails.
    pub fn destroy_instance(&mut self, handle: InstanceHandle) -> bool {
        debug_assert!(self.sanity_check());
        debug_assert!(matches!(
            self.call_context.state,
            CallContextState::Idle | CallContextState::ExecutingObserverCallbacks
        ));

        let Some(record) = self.instances.get_mut(handle) else {
            return false;
        };
        if record.state() != InstanceState::Alive {
            return false;
        }

        record.set_state(InstanceState::DestroyScheduled);
        record.methods = None; // No stale calls through a dying record
        let properties = record.properties.clone();
        for property in properties {
            let property_record = self.instances.fast_get_mut(property);
            property_record.set_state(InstanceState::DestroyScheduled);
            property_record.methods = None;
        }

        debug_assert!(self.scheduled_for_destroy.capacity() > self.scheduled_for_destroy.len());
        self.scheduled_for_destroy.push(handle);

        debug_assert!(self.sanity_check());
        true
    }

    /// Removes the target's source edges in both directions. Returns whether
    /// anything was actually removed.
    pub fn clear_binding(&mut self, target: InstanceHandle) -> Result<bool> {
        if !matches!(
            self.call_context.state,
            CallContextState::Idle
                | CallContextState::ExecutingObserverCallbacks
                | CallContextState::ExecutingChanges
        ) {
            return Err(BindingServiceError::UsageError(
                "clear_binding: can not be called from this context",
            ));
        }
        if !self
            .instances
            .get(target)
            .is_some_and(|record| record.is_alive())
        {
            return Err(BindingServiceError::DeadInstance("target must be alive"));
        }
        Ok(self.clear_source_bindings(target))
    }

    /// Declares a binding on `target`. An empty binding acts as
    /// [`clear_binding`](Self::clear_binding). Returns whether the source
    /// set actually changed.
    ///
    /// From Idle or observer-callback context the bind is validated and
    /// committed immediately; new sources are marked changed (forced) so the
    /// initial value propagates eagerly in the next round. From other
    /// contexts the call is legal only for observer-property targets: the
    /// bind is validated right away, then deferred to the pending-bindings
    /// phase of the next round.
    ///
    /// On any validation failure the target's bindings are left cleared and
    /// the graph is never half-linked.
    pub fn set_binding(&mut self, target: InstanceHandle, binding: &Binding) -> Result<bool> {
        if !matches!(
            self.call_context.state,
            CallContextState::Idle | CallContextState::ExecutingObserverCallbacks
        ) {
            let target_kind = self
                .instances
                .get(target)
                .ok_or(BindingServiceError::DeadInstance("target must be alive"))?
                .kind();
            if target_kind == InstanceKind::DependencyObserverProperty {
                // Validate the bind right away before deferring it
                crate::validate::validate_bind(&self.instances, target, binding)?;
                // Observer binds carry no converter and exactly one source
                debug_assert!(binding.complex_binding().is_none());
                debug_assert_eq!(binding.sources().len(), 1);
                self.pending_bindings.push_back(PendingBinding {
                    target,
                    source: binding.sources()[0],
                });
                return Ok(true);
            }
            return Err(BindingServiceError::UsageError(
                "set_binding: can not be called from this context",
            ));
        }
        self.do_set_binding(target, binding)
    }

    /// Marks an instance as changed so its dependents re-evaluate in the
    /// next round.
    ///
    /// A property with an active incoming binding refuses the mark (returns
    /// false): its value is wholly owned by its source, which is where the
    /// change belongs. Self-notifications from the instance currently being
    /// written during change execution are silently accepted.
    pub fn changed(&mut self, handle: InstanceHandle) -> Result<bool> {
        match self.call_context.state {
            CallContextState::Idle | CallContextState::ExecutingObserverCallbacks => {}
            CallContextState::ExecutingChanges if self.call_context.handle == Some(handle) => {
                return Ok(true);
            }
            _ => {
                return Err(BindingServiceError::UsageError(
                    "changed: can not be called from this context",
                ));
            }
        }
        if !self.instances.is_valid(handle) {
            return Err(BindingServiceError::DeadInstance("unknown instance"));
        }
        Ok(self.schedule_changed(handle, false))
    }

    /// Returns true if the property's value is owned by a binding and must
    /// not be written from outside.
    pub fn is_property_read_only(&self, handle: InstanceHandle) -> bool {
        if self.call_context.state == CallContextState::ExecutingChanges {
            return false;
        }
        match self.instances.get(handle) {
            Some(record) => record.has_sources(),
            None => true,
        }
    }

    /// Drives one change round to quiescence: destroy-reap, change-drain,
    /// pending-bind-apply, and observer-callback phases, repeated until the
    /// change queue is empty or the iteration ceiling is hit.
    ///
    /// Errors during propagation or callback dispatch abandon the current
    /// pass; internal queues stay consistent, so a subsequent call can be
    /// attempted.
    pub fn execute_changes(&mut self) -> Result<()> {
        if self.call_context.state != CallContextState::Idle {
            return Err(BindingServiceError::UsageError(
                "execute_changes: can not be called from this context",
            ));
        }
        let mut change_loop_counter = 0u32;
        loop {
            // Destroys run first: deferred changes to destroyed instances
            // fail to resolve their handle afterwards and are dropped.
            self.destroy_scheduled_now();

            self.execute_pending_changes_now()?;
            self.execute_pending_bindings_now()?;
            self.execute_observer_callbacks_now()?;

            change_loop_counter += 1;
            if self.changes.is_empty() || change_loop_counter >= MAX_EXECUTE_LOOP_COUNT {
                break;
            }
        }
        if change_loop_counter >= MAX_EXECUTE_LOOP_COUNT {
            log::warn!("execute_changes max allowed loops reached");
        }
        Ok(())
    }

    /// Reaps everything scheduled for destruction and reports instances
    /// that were never destroyed. Called on drop.
    pub fn mark_shutdown_intent(&mut self) {
        self.destroy_scheduled_now();
        if !self.instances.is_empty() {
            log::error!(
                "there are {} data binding instances that were not properly destroyed",
                self.instances.len()
            );
        }
    }

    // -----------------------------------------------------------------------
    // Creation / destruction internals
    // -----------------------------------------------------------------------

    fn require_create_context(&self, message: &'static str) -> Result<()> {
        if matches!(
            self.call_context.state,
            CallContextState::Idle | CallContextState::ExecutingObserverCallbacks
        ) {
            Ok(())
        } else {
            Err(BindingServiceError::UsageError(message))
        }
    }

    fn do_create_property(
        &mut self,
        owner: InstanceHandle,
        definition: DependencyPropertyDefinition,
        methods: Rc<dyn PropertyMethods>,
        kind: InstanceKind,
        flags: u32,
    ) -> Result<InstanceHandle> {
        debug_assert!(matches!(
            kind,
            InstanceKind::DependencyProperty | InstanceKind::DependencyObserverProperty
        ));

        let owner_kind = self
            .instances
            .get(owner)
            .filter(|record| record.is_alive())
            .ok_or(BindingServiceError::DeadInstance("owner must be alive"))?
            .kind();
        if !matches!(
            owner_kind,
            InstanceKind::DependencyObject | InstanceKind::DependencyProperty
        ) {
            return Err(BindingServiceError::InvalidParentInstance(
                "owner must be a DependencyObject or DependencyProperty",
            ));
        }
        if methods.value_type() != definition.value_type() {
            return Err(BindingServiceError::BindingIncompatibleTypes(
                "property definition type does not match the supplied method object",
            ));
        }
        self.ensure_destroy_capacity();

        let new_handle = self
            .instances
            .add(InstanceRecord::new_property(kind, flags, owner, definition, methods));
        self.instances.fast_get_mut(owner).properties.push(new_handle);

        debug_assert!(self.sanity_check());
        Ok(new_handle)
    }

    /// Keeps enough spare capacity in the destroy queue for every live
    /// instance plus one, so destroy scheduling never reallocates.
    fn ensure_destroy_capacity(&mut self) {
        let desired = self.instances.len() + 1;
        if desired > self.scheduled_for_destroy.capacity() {
            let additional = desired + 128 - self.scheduled_for_destroy.len();
            self.scheduled_for_destroy.reserve(additional);
        }
    }

    /// Physically unlinks and removes everything queued for destruction.
    /// Must never fail: a partially-unlinked destruction would corrupt the
    /// symmetric-edge invariant irreparably.
    fn destroy_scheduled_now(&mut self) {
        // Swap the queue out for the duration of the walk and hand the
        // allocation back afterwards; the pre-reserved capacity must survive
        // the reap
        let mut scheduled = std::mem::take(&mut self.scheduled_for_destroy);
        for handle in scheduled.drain(..) {
            self.do_destroy_instance_now(handle);
        }
        debug_assert!(self.scheduled_for_destroy.is_empty());
        self.scheduled_for_destroy = scheduled;
    }

    fn do_destroy_instance_now(&mut self, handle: InstanceHandle) {
        let Some(record) = self.instances.get_mut(handle) else {
            return;
        };
        record.set_state(InstanceState::Destroyed);
        match &record.definition {
            Some(definition) => log::trace!("destroying property '{}' {handle}", definition.name()),
            None => log::trace!("destroying instance {handle}"),
        }
        let owner = record.owner;
        let had_sources = record.has_sources();

        // Unlink from the owner before the slot is freed for reuse; a stale
        // child handle left behind would alias the slot's next occupant. The
        // list is already empty when the owner itself is mid-reap.
        if let Some(owner) = owner {
            if let Some(owner_record) = self.instances.get_mut(owner) {
                erase_first(&mut owner_record.properties, handle);
            }
        }

        // Remove all bindings that use this instance as a target
        if had_sources {
            self.clear_source_bindings(handle);
        }

        // Remove all bindings that use this instance as a source. Targets
        // with more than one source lose just this edge; a sole-source
        // target has its binding cleared entirely.
        let targets = self.instances.fast_get(handle).targets.clone();
        for target in targets {
            let target_record = self.instances.fast_get_mut(target);
            debug_assert!(target_record.contains_source(handle));
            if target_record.sources.len() > 1 {
                log::trace!("- removing source {handle} from {target}");
                erase_first(&mut target_record.sources, handle);
            } else {
                target_record.clear_sources();
            }
        }
        self.instances.fast_get_mut(handle).targets.clear();

        // Destroy all properties owned by this instance
        let properties = std::mem::take(&mut self.instances.fast_get_mut(handle).properties);
        for property in properties {
            self.do_destroy_instance_now(property);
        }

        let index = self.instances.handle_to_index(handle);
        self.instances.remove_at(index);
    }

    // -----------------------------------------------------------------------
    // Graph mutation
    // -----------------------------------------------------------------------

    /// Severs the target's source edges in both directions. Does not add or
    /// remove registry entries.
    fn clear_source_bindings(&mut self, target: InstanceHandle) -> bool {
        let sources = self.instances.fast_get(target).sources.clone();
        log::trace!("clearing source bindings from {target}");
        for source in &sources {
            debug_assert_ne!(*source, target);
            erase_first(&mut self.instances.fast_get_mut(*source).targets, target);
        }
        self.instances.fast_get_mut(target).clear_sources();
        !sources.is_empty()
    }

    fn do_set_binding(&mut self, target: InstanceHandle, binding: &Binding) -> Result<bool> {
        debug_assert!(matches!(
            self.call_context.state,
            CallContextState::Idle
                | CallContextState::ExecutingObserverCallbacks
                | CallContextState::ExecutePendingBindings
        ));
        debug_assert!(self.sanity_check());

        if !binding.has_sources() {
            return self.clear_binding(target);
        }

        let validation = if binding.contains_source(target) {
            Err(BindingServiceError::CyclicBinding(
                "circular dependency found (cant bind to itself)",
            ))
        } else {
            crate::validate::validate_bind(&self.instances, target, binding)
        };
        if let Err(error) = validation {
            if self.instances.is_valid(target) {
                self.clear_source_bindings(target);
            }
            return Err(error);
        }

        let changed = binding.sources() != self.instances.fast_get(target).sources.as_slice();
        if changed {
            // The binding is being replaced, so delete the old edges first
            self.clear_source_bindings(target);
        }

        debug_assert!(self.sanity_check());

        if changed {
            let mut in_progress: Vec<InstanceHandle> = Vec::with_capacity(MAX_MULTI_BIND_SOURCES);
            let mut failure = None;
            for &source in binding.sources() {
                in_progress.push(source);

                // Adding this edge must not close a cycle back to source
                if let Err(error) = self.check_for_cyclic_dependencies(target, source) {
                    failure = Some(error);
                    break;
                }

                // Push the reverse edge first so a later failure mid-loop
                // can be unwound by removing exactly the edges pushed so far
                self.instances.fast_get_mut(source).targets.push(target);
            }
            if let Some(error) = failure {
                for &source in &in_progress {
                    erase_first(&mut self.instances.fast_get_mut(source).targets, target);
                }
                debug_assert!(self.sanity_check());
                return Err(error);
            }

            // All cyclic dependency checks passed and every source now lists
            // the target, so commit the source set on the target record
            self.instances.fast_get_mut(target).set_source(binding);

            debug_assert!(self.sanity_check());
            debug_assert!(
                self.call_context.state != CallContextState::ExecutePendingBindings
                    || self.instances.fast_get(target).kind()
                        == InstanceKind::DependencyObserverProperty
            );

            if self.call_context.state != CallContextState::ExecutePendingBindings {
                // Marking each source changed (forced) is a simple way to
                // populate the target with the current values
                for &source in binding.sources() {
                    self.schedule_changed(source, true);
                }
            }

            debug_assert!(self.sanity_check());
        }
        Ok(changed)
    }

    /// Rejects a bind of `source` into `target` that would close a cycle:
    /// walking forward from the target's current downstream chain must never
    /// reach back to the source.
    fn check_for_cyclic_dependencies(
        &self,
        target: InstanceHandle,
        source: InstanceHandle,
    ) -> Result<()> {
        if target == source {
            return Err(BindingServiceError::CyclicBinding(
                "circular dependency found (cant bind to itself)",
            ));
        }

        let target_record = self.instances.fast_get(target);
        // The target's old sources were cleared before the new ones are linked
        debug_assert!(!target_record.has_sources());

        for &entry in &target_record.targets {
            if self.is_instance_target(entry, source) {
                return Err(BindingServiceError::CyclicBinding(
                    "circular dependency found",
                ));
            }
        }
        Ok(())
    }

    /// Depth-first reachability: true if `query` is `instance` or any alive
    /// downstream target of it, transitively.
    fn is_instance_target(&self, instance: InstanceHandle, query: InstanceHandle) -> bool {
        if instance == query {
            return true;
        }
        let record = self.instances.fast_get(instance);
        record.is_alive()
            && record
                .targets
                .iter()
                .any(|&entry| self.is_instance_target(entry, query))
    }

    // -----------------------------------------------------------------------
    // Change scheduling & execution
    // -----------------------------------------------------------------------

    /// Queues a change for an instance. Refused (returns false) when the
    /// instance has a bound source and the mark is not forced. The enqueue
    /// is idempotent via the pending-change flag.
    fn schedule_changed(&mut self, handle: InstanceHandle, forced: bool) -> bool {
        let record = self.instances.fast_get_mut(handle);
        debug_assert!(record.is_observable());

        let mut allow_changes = true;
        if record.is_alive() {
            allow_changes = forced || !record.has_sources();
            if allow_changes && !record.targets.is_empty() && !record.has_pending_change() {
                record.mark_pending_change();
                self.changes.push_back(handle);
            }
        }
        allow_changes
    }

    /// Drains the change queue, fanning each change out to downstream
    /// dependents. Observer targets are deferred to the callback queue.
    fn execute_pending_changes_now(&mut self) -> Result<()> {
        debug_assert_eq!(self.call_context.state, CallContextState::Idle);
        debug_assert!(self.call_context.handle.is_none());

        if self.changes.is_empty() {
            return Ok(());
        }
        debug_assert!(self.sanity_check());
        debug_assert!(self.pending_observer_callbacks.is_empty());

        self.call_context.state = CallContextState::ExecutingChanges;
        let result = self.drain_pending_changes();
        self.call_context = CallContext::default();
        if result.is_err() {
            log::error!("error during data binding change execution");
        }
        debug_assert!(result.is_err() || self.sanity_check());
        result
    }

    fn drain_pending_changes(&mut self) -> Result<()> {
        while let Some(changed_handle) = self.changes.pop_front() {
            // Destroyed instances fail to resolve here and are dropped
            let Some(record) = self.instances.get_mut(changed_handle) else {
                continue;
            };
            debug_assert!(record.has_pending_change());
            record.clear_pending_change();
            self.execute_changes_to(changed_handle)?;
        }
        Ok(())
    }

    /// Fans a change out to the source's downstream targets, recursing into
    /// targets whose value actually changed.
    fn execute_changes_to(&mut self, source: InstanceHandle) -> Result<()> {
        debug_assert_eq!(self.call_context.state, CallContextState::ExecutingChanges);
        let source_record = self.instances.fast_get(source);
        if !source_record.is_alive() {
            log::error!("encountered dead changed instance, that ought to have been filtered");
            return Ok(());
        }

        let targets = source_record.targets.clone();
        for target in targets {
            let target_record = self.instances.fast_get(target);
            if !target_record.is_alive() {
                log::error!("encountered dead target instance, that ought to have been filtered");
                continue;
            }
            match target_record.kind() {
                InstanceKind::DependencyObserverProperty => {
                    self.pending_observer_callbacks
                        .push_back(ObserverCallback { target, source });
                }
                InstanceKind::DependencyProperty => {
                    if self.execute_dependency_property_get_set(target, source)? {
                        // Propagate to the dependents of the updated target
                        self.execute_changes_to(target)?;
                    }
                }
                InstanceKind::DependencyObject | InstanceKind::DataSourceObject => {
                    return Err(BindingServiceError::Internal(
                        "change to an object of an unsupported type",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Invokes the target property's get/set or converter. Returns whether
    /// the target's value changed.
    fn execute_dependency_property_get_set(
        &mut self,
        target: InstanceHandle,
        source: InstanceHandle,
    ) -> Result<bool> {
        debug_assert_eq!(self.call_context.state, CallContextState::ExecutingChanges);

        self.call_context.handle = Some(target);
        let set_result = self.run_property_set(target, source);
        self.call_context.handle = None;

        match set_result? {
            PropertySetResult::ValueUnchanged => Ok(false),
            PropertySetResult::ValueChanged => Ok(true),
            PropertySetResult::UnsupportedGetType => Err(BindingServiceError::NotSupported(
                "unsupported get type (this should not occur)",
            )),
            PropertySetResult::UnsupportedSetType => Err(BindingServiceError::NotSupported(
                "unsupported set type (this should not occur)",
            )),
            PropertySetResult::UnsupportedBindingType => Err(BindingServiceError::NotSupported(
                "unsupported binding type (this should not occur)",
            )),
            PropertySetResult::NotSupported => Err(BindingServiceError::NotSupported(
                "set is unsupported (this should not occur)",
            )),
        }
    }

    /// Runs the direct get/set or the attached converter for one
    /// source-to-target step. Pure with respect to the call context; the
    /// caller brackets it with the current-handle marker.
    fn run_property_set(
        &self,
        target: InstanceHandle,
        source: InstanceHandle,
    ) -> Result<PropertySetResult> {
        let target_record = self.instances.fast_get(target);
        let target_methods = target_record
            .methods
            .clone()
            .ok_or(BindingServiceError::Internal("no methods associated"))?;

        Ok(match target_record.source_user_binding() {
            None => {
                let source_methods = self
                    .instances
                    .fast_get(source)
                    .methods
                    .clone()
                    .ok_or(BindingServiceError::Internal("no methods associated"))?;
                target_methods.try_set(source_methods.as_ref())
            }
            Some(ComplexBinding::Convert(converter)) => {
                let source_methods = self
                    .instances
                    .fast_get(source)
                    .methods
                    .clone()
                    .ok_or(BindingServiceError::Internal("no methods associated"))?;
                converter.convert(target_methods.as_ref(), source_methods.as_ref())
            }
            Some(ComplexBinding::MultiConvert(converter)) => {
                self.execute_multi_convert(target, target_methods.as_ref(), converter.as_ref())
            }
        })
    }

    /// Gathers all current sources of a multi-bound target and runs the
    /// converter once with the full tuple.
    fn execute_multi_convert(
        &self,
        target: InstanceHandle,
        target_methods: &dyn PropertyMethods,
        converter: &dyn crate::binding::MultiConverterBinding,
    ) -> PropertySetResult {
        let target_record = self.instances.fast_get(target);
        let source_count = target_record.sources.len();
        debug_assert!(source_count <= MAX_MULTI_BIND_SOURCES);

        // Fixed-size gather keeps the propagation hot path allocation-free
        let mut getters: [Option<Rc<dyn PropertyMethods>>; MAX_MULTI_BIND_SOURCES] =
            std::array::from_fn(|_| None);
        for (slot, &source) in getters.iter_mut().zip(&target_record.sources) {
            let Some(methods) = self
                .instances
                .get(source)
                .and_then(|record| record.methods.clone())
            else {
                log::warn!("failed to acquire source binding record");
                return PropertySetResult::UnsupportedGetType;
            };
            *slot = Some(methods);
        }
        let mut getter_refs: [&dyn PropertyMethods; MAX_MULTI_BIND_SOURCES] =
            [target_methods; MAX_MULTI_BIND_SOURCES];
        for (entry, slot) in getter_refs.iter_mut().zip(&getters) {
            if let Some(methods) = slot {
                *entry = methods.as_ref();
            }
        }
        converter.convert(target_methods, &getter_refs[..source_count])
    }

    /// Replays observer binds that were deferred from an illegal direct-call
    /// context, then queues their callbacks.
    fn execute_pending_bindings_now(&mut self) -> Result<()> {
        debug_assert_eq!(self.call_context.state, CallContextState::Idle);
        debug_assert!(self.sanity_check());

        self.call_context.state = CallContextState::ExecutePendingBindings;
        let result = self.drain_pending_bindings();
        self.call_context = CallContext::default();
        if result.is_err() {
            log::error!("error during data binding pending-bindings execution");
        }
        debug_assert!(result.is_err() || self.sanity_check());
        result
    }

    fn drain_pending_bindings(&mut self) -> Result<()> {
        while let Some(pending) = self.pending_bindings.pop_front() {
            self.do_set_binding(pending.target, &Binding::new(pending.source))?;
            self.pending_observer_callbacks.push_back(ObserverCallback {
                target: pending.target,
                source: pending.source,
            });
        }
        Ok(())
    }

    /// Dispatches all queued observer callbacks.
    fn execute_observer_callbacks_now(&mut self) -> Result<()> {
        debug_assert_eq!(self.call_context.state, CallContextState::Idle);
        debug_assert!(self.call_context.handle.is_none());

        if self.pending_observer_callbacks.is_empty() {
            return Ok(());
        }
        debug_assert!(self.sanity_check());

        self.call_context.state = CallContextState::ExecutingObserverCallbacks;
        let result = self.drain_observer_callbacks();
        self.call_context = CallContext::default();
        if result.is_err() {
            log::error!("error during data binding observer callback execution");
        }
        debug_assert!(result.is_err() || self.sanity_check());
        result
    }

    fn drain_observer_callbacks(&mut self) -> Result<()> {
        while let Some(callback) = self.pending_observer_callbacks.pop_front() {
            self.execute_instance_observer_callback(callback.target, callback.source)?;
        }
        Ok(())
    }

    fn execute_instance_observer_callback(
        &mut self,
        target: InstanceHandle,
        source: InstanceHandle,
    ) -> Result<()> {
        debug_assert_eq!(
            self.call_context.state,
            CallContextState::ExecutingObserverCallbacks
        );

        let Some(record) = self.instances.get(target) else {
            return Ok(());
        };
        debug_assert_eq!(record.kind(), InstanceKind::DependencyObserverProperty);
        if !record.is_alive() {
            log::trace!("observer callback target is dead, skipping callback");
            return Ok(());
        }
        let methods = record
            .methods
            .clone()
            .ok_or(BindingServiceError::Internal("no methods associated"))?;

        if !methods.try_invoke(source) {
            log::warn!("observer invoke failed");
        }
        // The source must not have been destroyed while dispatching
        debug_assert!(self.instances.is_valid(source));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Consistency
    // -----------------------------------------------------------------------

    /// Scans the registry for violations of the symmetric-edge invariant:
    /// `b in a.targets <=> a in b.sources`, and for dangling property or
    /// edge handles. Debug builds run this after every mutation.
    pub fn sanity_check(&self) -> bool {
        for (handle, record) in self.instances.iter() {
            for &property in &record.properties {
                match self.instances.get(property) {
                    // Ownership links are symmetric too
                    Some(property_record) => {
                        if property_record.owner != Some(handle) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            for &target in &record.targets {
                match self.instances.get(target) {
                    // The two-way link is corrupt if the target does not
                    // list us as a source
                    Some(target_record) => {
                        if !target_record.contains_source(handle) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            for &source in &record.sources {
                match self.instances.get(source) {
                    Some(source_record) => {
                        if !source_record.targets.contains(&handle) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }
        true
    }
}

impl Default for DataBindingService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataBindingService {
    fn drop(&mut self) {
        self.mark_shutdown_intent();
    }
}

/// Erases the first occurrence of `handle`, preserving order.
fn erase_first(handles: &mut Vec<InstanceHandle>, handle: InstanceHandle) -> bool {
    if let Some(position) = handles.iter().position(|&entry| entry == handle) {
        handles.remove(position);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::{ObserverPropertyMethods, TypedMultiConverterBinding2, TypedPropertyMethods};
    use std::cell::RefCell;

    fn add_u32_property(
        service: &mut DataBindingService,
        owner: InstanceHandle,
        name: &'static str,
        value: u32,
    ) -> (InstanceHandle, Rc<TypedPropertyMethods<u32>>) {
        let methods = TypedPropertyMethods::new(value);
        let handle = service
            .create_dependency_object_property(
                owner,
                DependencyPropertyDefinition::new::<u32>(name),
                methods.clone(),
            )
            .unwrap();
        (handle, methods)
    }

    #[test]
    fn create_instances_and_count() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let _source = service
            .create_data_source_object(DataSourceFlags::OBSERVABLE)
            .unwrap();
        let (_property, _) = add_u32_property(&mut service, object, "Value", 0);

        assert_eq!(service.instance_count(), 3);
        assert!(service.sanity_check());
    }

    #[test]
    fn property_requires_object_or_property_parent() {
        let mut service = DataBindingService::new();
        let data_source = service
            .create_data_source_object(DataSourceFlags::NONE)
            .unwrap();

        let result = service.create_dependency_object_property(
            data_source,
            DependencyPropertyDefinition::new::<u32>("Value"),
            TypedPropertyMethods::new(0u32),
        );
        assert!(matches!(
            result,
            Err(BindingServiceError::InvalidParentInstance(_))
        ));
    }

    #[test]
    fn property_definition_type_must_match_methods() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();

        let result = service.create_dependency_object_property(
            object,
            DependencyPropertyDefinition::new::<f32>("Value"),
            TypedPropertyMethods::new(0u32),
        );
        assert!(matches!(
            result,
            Err(BindingServiceError::BindingIncompatibleTypes(_))
        ));
    }

    #[test]
    fn bind_to_dependency_object_is_rejected() {
        let mut service = DataBindingService::new();
        let object_a = service.create_dependency_object().unwrap();
        let object_b = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object_a, "Source", 1);

        let result = service.set_binding(object_b, &Binding::new(source));
        assert!(matches!(
            result,
            Err(BindingServiceError::BindingIncompatibleProperties(_))
        ));
    }

    #[test]
    fn simple_bind_requires_matching_types() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let target_methods = TypedPropertyMethods::new(0.0f32);
        let target = service
            .create_dependency_object_property(
                object,
                DependencyPropertyDefinition::new::<f32>("Target"),
                target_methods,
            )
            .unwrap();

        let result = service.set_binding(target, &Binding::new(source));
        assert!(matches!(
            result,
            Err(BindingServiceError::BindingIncompatibleTypes(_))
        ));
        // Failed binds leave the target cleared
        assert_eq!(service.instance_source_count(target), Some(0));
        assert!(service.sanity_check());
    }

    #[test]
    fn binding_to_itself_is_cyclic() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (property, _) = add_u32_property(&mut service, object, "Value", 1);

        let result = service.set_binding(property, &Binding::new(property));
        assert!(matches!(result, Err(BindingServiceError::CyclicBinding(_))));
    }

    #[test]
    fn transitive_cycle_is_rejected_without_mutation() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (a, _) = add_u32_property(&mut service, object, "A", 1);
        let (b, _) = add_u32_property(&mut service, object, "B", 2);
        let (c, _) = add_u32_property(&mut service, object, "C", 3);

        // a -> b -> c
        service.set_binding(b, &Binding::new(a)).unwrap();
        service.set_binding(c, &Binding::new(b)).unwrap();

        // Closing the loop back to a must fail before any edge is written
        let result = service.set_binding(a, &Binding::new(c));
        assert!(matches!(result, Err(BindingServiceError::CyclicBinding(_))));

        assert_eq!(service.instance_source_count(a), Some(0));
        assert_eq!(service.instance_source_count(b), Some(1));
        assert_eq!(service.instance_source_count(c), Some(1));
        assert!(service.sanity_check());
    }

    #[test]
    fn set_then_clear_binding_removes_all_edges() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        assert!(service.set_binding(target, &Binding::new(source)).unwrap());
        assert_eq!(service.instance_source_count(target), Some(1));
        assert_eq!(service.instance_target_count(source), Some(1));

        assert!(service.clear_binding(target).unwrap());
        assert_eq!(service.instance_source_count(target), Some(0));
        assert_eq!(service.instance_target_count(source), Some(0));
        assert!(service.sanity_check());

        // Clearing again reports nothing removed
        assert!(!service.clear_binding(target).unwrap());
    }

    #[test]
    fn empty_binding_acts_as_clear() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        service.set_binding(target, &Binding::new(source)).unwrap();
        service.set_binding(target, &Binding::empty()).unwrap();
        assert_eq!(service.instance_source_count(target), Some(0));
    }

    #[test]
    fn multi_converter_arity_mismatch_fails_at_bind_time() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (s0, _) = add_u32_property(&mut service, object, "S0", 1);
        let (s1, _) = add_u32_property(&mut service, object, "S1", 2);
        let (s2, _) = add_u32_property(&mut service, object, "S2", 3);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        // The converter declares two inputs but three sources are supplied
        let converter = TypedMultiConverterBinding2::new(|a: &u32, b: &u32| a + b);
        let result = service.set_binding(
            target,
            &Binding::with_multi_converter(converter, &[s0, s1, s2]),
        );
        assert!(matches!(
            result,
            Err(BindingServiceError::BindingUnsupported(_))
        ));
        assert_eq!(service.instance_source_count(target), Some(0));
        assert!(service.sanity_check());
    }

    #[test]
    fn source_count_above_maximum_is_rejected() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let mut sources = Vec::new();
        for name in ["S0", "S1", "S2", "S3", "S4"] {
            let (handle, _) = add_u32_property(&mut service, object, name, 0);
            sources.push(handle);
        }
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        let converter = TypedMultiConverterBinding2::new(|a: &u32, b: &u32| a + b);
        let result =
            service.set_binding(target, &Binding::with_multi_converter(converter, &sources));
        assert!(matches!(
            result,
            Err(BindingServiceError::BindingUnsupported(_))
        ));
    }

    #[test]
    fn changed_refused_for_bound_property() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);
        service.set_binding(target, &Binding::new(source)).unwrap();

        // The target's value is owned by its source
        assert!(!service.changed(target).unwrap());
        assert!(service.changed(source).unwrap());
    }

    #[test]
    fn is_property_read_only_tracks_binding() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        assert!(!service.is_property_read_only(target));
        service.set_binding(target, &Binding::new(source)).unwrap();
        assert!(service.is_property_read_only(target));
        service.clear_binding(target).unwrap();
        assert!(!service.is_property_read_only(target));
    }

    #[test]
    fn destroy_is_deferred_until_execute_changes() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (property, _) = add_u32_property(&mut service, object, "Value", 1);

        assert!(service.destroy_instance(object));
        // Scheduled but not yet reaped
        assert!(service.is_valid_handle(object));
        assert!(service.is_valid_handle(property));

        service.execute_changes().unwrap();
        assert!(!service.is_valid_handle(object));
        assert!(!service.is_valid_handle(property));
        assert_eq!(service.instance_count(), 0);
    }

    #[test]
    fn destroy_after_a_reap_round_keeps_queue_usable() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        // The reap hands the destroy queue's allocation back, so a destroy
        // in the next frame still has its capacity pre-reserved
        service.execute_changes().unwrap();

        assert!(service.destroy_instance(object));
        service.execute_changes().unwrap();
        assert_eq!(service.instance_count(), 0);

        let again = service.create_dependency_object().unwrap();
        service.execute_changes().unwrap();
        assert!(service.destroy_instance(again));
        service.execute_changes().unwrap();
        assert_eq!(service.instance_count(), 0);
    }

    #[test]
    fn reused_slot_is_not_aliased_by_stale_owner_link() {
        let mut service = DataBindingService::new();
        let owner = service.create_dependency_object().unwrap();
        let (property, _) = add_u32_property(&mut service, owner, "Value", 0);
        service.destroy_property(property);
        service.execute_changes().unwrap();

        // The freed slot is recycled for an unrelated instance
        let recycled = service.create_dependency_object().unwrap();
        assert_eq!(recycled.index(), property.index());

        // Destroying the old owner must not follow a stale child handle
        // into the recycled slot
        service.destroy_instance(owner);
        service.execute_changes().unwrap();

        assert!(service.is_valid_handle(recycled));
        let (_, methods) = add_u32_property(&mut service, recycled, "Value", 3);
        assert_eq!(methods.get(), 3);
        assert!(service.sanity_check());
    }

    #[test]
    fn destroy_twice_reports_false() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        assert!(service.destroy_instance(object));
        assert!(!service.destroy_instance(object));
    }

    #[test]
    fn destroying_one_of_two_sources_keeps_the_other_edge() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (s0, _) = add_u32_property(&mut service, object, "S0", 1);
        let (s1, _) = add_u32_property(&mut service, object, "S1", 2);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        let converter = TypedMultiConverterBinding2::new(|a: &u32, b: &u32| a + b);
        service
            .set_binding(target, &Binding::with_multi_converter(converter, &[s0, s1]))
            .unwrap();
        service.execute_changes().unwrap();

        service.destroy_property(s0);
        service.execute_changes().unwrap();

        assert_eq!(service.instance_source_count(target), Some(1));
        assert_eq!(service.instance_target_count(s1), Some(1));
        assert!(service.sanity_check());
    }

    #[test]
    fn destroying_the_sole_source_clears_the_target() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);
        service.set_binding(target, &Binding::new(source)).unwrap();
        service.execute_changes().unwrap();

        service.destroy_property(source);
        service.execute_changes().unwrap();

        assert_eq!(service.instance_source_count(target), Some(0));
        assert!(service.sanity_check());
    }

    #[test]
    fn deferred_observer_binding_replays_in_next_round() {
        let mut service = DataBindingService::new();
        let data_source = service
            .create_data_source_object(DataSourceFlags::OBSERVABLE)
            .unwrap();
        let object = service.create_dependency_object().unwrap();

        let invocations = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&invocations);
        let observer = service
            .create_dependency_object_observer_property(
                object,
                DependencyPropertyDefinition::new::<()>("OnChanged"),
                ObserverPropertyMethods::new(move |source| seen.borrow_mut().push(source)),
            )
            .unwrap();

        // Binds from within change execution are deferred for observer
        // targets instead of failing
        service.call_context.state = CallContextState::ExecutingChanges;
        assert!(service
            .set_binding(observer, &Binding::new(data_source))
            .unwrap());
        assert_eq!(service.pending_bindings.len(), 1);
        assert_eq!(service.instance_source_count(observer), Some(0));
        service.call_context = CallContext::default();

        service.execute_changes().unwrap();
        assert_eq!(service.instance_source_count(observer), Some(1));
        assert_eq!(invocations.borrow().as_slice(), &[data_source]);
    }

    #[test]
    fn set_binding_deferred_context_rejects_non_observer_target() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        service.call_context.state = CallContextState::ExecutingChanges;
        let result = service.set_binding(target, &Binding::new(source));
        assert!(matches!(result, Err(BindingServiceError::UsageError(_))));
        service.call_context = CallContext::default();
    }

    #[test]
    fn changed_accepts_self_notification_during_execution() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (property, _) = add_u32_property(&mut service, object, "Value", 1);

        service.call_context.state = CallContextState::ExecutingChanges;
        service.call_context.handle = Some(property);
        assert!(service.changed(property).unwrap());

        service.call_context.handle = None;
        let result = service.changed(property);
        assert!(matches!(result, Err(BindingServiceError::UsageError(_))));
        service.call_context = CallContext::default();
    }

    #[test]
    fn execute_changes_rejected_outside_idle() {
        let mut service = DataBindingService::new();
        service.call_context.state = CallContextState::ExecutingObserverCallbacks;
        let result = service.execute_changes();
        assert!(matches!(result, Err(BindingServiceError::UsageError(_))));
        service.call_context = CallContext::default();
    }

    #[test]
    fn changed_on_stale_handle_fails() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (property, _) = add_u32_property(&mut service, object, "Value", 1);
        service.destroy_property(property);
        service.execute_changes().unwrap();

        let result = service.changed(property);
        assert!(matches!(result, Err(BindingServiceError::DeadInstance(_))));
    }

    #[test]
    fn rebinding_replaces_old_edges() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (s0, _) = add_u32_property(&mut service, object, "S0", 1);
        let (s1, _) = add_u32_property(&mut service, object, "S1", 2);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        service.set_binding(target, &Binding::new(s0)).unwrap();
        service.set_binding(target, &Binding::new(s1)).unwrap();

        assert_eq!(service.instance_target_count(s0), Some(0));
        assert_eq!(service.instance_target_count(s1), Some(1));
        assert!(service.sanity_check());
    }

    #[test]
    fn setting_the_same_binding_twice_reports_unchanged() {
        let mut service = DataBindingService::new();
        let object = service.create_dependency_object().unwrap();
        let (source, _) = add_u32_property(&mut service, object, "Source", 1);
        let (target, _) = add_u32_property(&mut service, object, "Target", 0);

        assert!(service.set_binding(target, &Binding::new(source)).unwrap());
        assert!(!service.set_binding(target, &Binding::new(source)).unwrap());
    }
}
