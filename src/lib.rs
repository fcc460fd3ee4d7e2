//! # Data Binding Engine
//!
//! Runtime dependency graph wiring "properties" on objects together so that
//! a change to one automatically propagates to all dependents, with cycle
//! detection, deferred execution, observer callbacks, and safe mutation
//! during iteration.
//!
//! ## Core Types
//!
//! - [`InstanceHandle`] — Generation-checked handle to a registry slot
//! - [`DataBindingService`] — Central engine owning instances, edges, and queues
//! - [`Binding`] — Declared dependency of a target on one or more sources
//! - [`PropertyMethods`] — Abstract get/set/type interface of a property
//! - [`ConverterBinding`] / [`MultiConverterBinding`] — User-supplied value
//!   conversion during propagation
//!
//! ## Usage
//!
//! Client code creates instances, declares bindings, marks sources changed,
//! and calls [`DataBindingService::execute_changes`] once per frame. One
//! change round runs destroy-reap, change-drain, pending-bind-apply, and
//! observer-callback phases until the change queue is quiescent.
//!
//! The engine is single-threaded and cooperative; reentrancy is governed by
//! an explicit call-context state machine rather than locks.
//!
//! See `DESIGN.md` for architecture decisions and goals.

mod binding;
mod error;
mod handle;
mod handle_vec;
mod property;
mod record;
mod service;
pub mod typed;
mod validate;

pub use binding::{
    Binding, ComplexBinding, ConverterBinding, MultiConverterBinding, MAX_MULTI_BIND_SOURCES,
};
pub use error::{BindingServiceError, Result};
pub use handle::InstanceHandle;
pub use handle_vec::HandleVec;
pub use property::{
    DataSourceFlags, DependencyPropertyDefinition, PropertyMethods, PropertySetResult,
    PropertyTypeId,
};
pub use record::{InstanceKind, InstanceState};
pub use service::DataBindingService;
