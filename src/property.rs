use std::any::{Any, TypeId};

use crate::handle::InstanceHandle;

/// Opaque value-type tag for a property.
///
/// Two properties can be bound directly only when their tags are equal;
/// otherwise a converter declaring matching tags must be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyTypeId(TypeId);

impl PropertyTypeId {
    /// Returns the tag for the value type `T`.
    pub fn of<T: 'static>() -> Self {
        Self(TypeId::of::<T>())
    }
}

/// Outcome of pushing a source value into a target property.
///
/// `ValueUnchanged` / `ValueChanged` are the two normal results; the
/// remaining variants signal a mismatch between what the validator admitted
/// and what the method object can actually do, which the engine escalates as
/// an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySetResult {
    /// The target already held this value; propagation stops here.
    ValueUnchanged,
    /// The target took a new value; its own dependents must be re-examined.
    ValueChanged,
    /// The source's get accessor was of an unexpected type.
    UnsupportedGetType,
    /// The target's set accessor was of an unexpected type.
    UnsupportedSetType,
    /// The attached converter kind did not match the stored binding.
    UnsupportedBindingType,
    /// The method object does not implement this operation at all.
    NotSupported,
}

/// Abstract get/set/type interface of a property, implemented by collaborators
/// and consumed by the engine.
///
/// Method objects are shared between the engine's registry record and the
/// client-side property wrapper, so mutation goes through interior mutability
/// (`&self` receivers). Implementations for regular dependency properties
/// override [`try_set`](Self::try_set); implementations for observer
/// properties override [`try_invoke`](Self::try_invoke). The defaults report
/// the operation as unsupported.
pub trait PropertyMethods {
    /// Returns the value-type tag this property stores.
    fn value_type(&self) -> PropertyTypeId;

    /// Reads the source property's current value and writes it into this
    /// property. Both ends are guaranteed by validation to report the same
    /// [`PropertyTypeId`].
    fn try_set(&self, source: &dyn PropertyMethods) -> PropertySetResult {
        let _ = source;
        PropertySetResult::NotSupported
    }

    /// Observer callback: notifies that the bound source changed.
    /// Returns false if the callback could not be delivered.
    fn try_invoke(&self, source: InstanceHandle) -> bool {
        let _ = source;
        false
    }

    /// Downcast seam for typed converters and setters.
    fn as_any(&self) -> &dyn Any;
}

/// Creation flags for a data source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSourceFlags(u32);

impl DataSourceFlags {
    /// No flags set: the data source cannot be marked changed.
    pub const NONE: Self = Self(0);
    /// The data source may be marked changed and propagate to observers.
    pub const OBSERVABLE: Self = Self(1 << 0);

    /// Returns true if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DataSourceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Static description of a dependency property: its name and declared value
/// type. Carried on property records for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyPropertyDefinition {
    name: &'static str,
    value_type: PropertyTypeId,
}

impl DependencyPropertyDefinition {
    /// Creates a definition for a property named `name` storing values of
    /// type `T`.
    pub fn new<T: 'static>(name: &'static str) -> Self {
        Self {
            name,
            value_type: PropertyTypeId::of::<T>(),
        }
    }

    /// Returns the property name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the declared value-type tag.
    pub fn value_type(&self) -> PropertyTypeId {
        self.value_type
    }
}
