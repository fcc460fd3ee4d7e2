//! Typed convenience implementations of the abstract property interfaces.
//!
//! The engine itself only speaks [`PropertyMethods`] / converter trait
//! objects; this module supplies the implementations client code usually
//! wants: a value cell with change detection, an observer callback adapter,
//! and closure-based converters.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::binding::{ConverterBinding, MultiConverterBinding};
use crate::handle::InstanceHandle;
use crate::property::{PropertyMethods, PropertySetResult, PropertyTypeId};

/// A property backed by a shared value cell.
///
/// The cell is shared between the engine (which writes it during change
/// propagation) and the owning client object (which reads it and marks it
/// changed), which is why all mutation goes through `&self`.
pub struct TypedPropertyMethods<T> {
    value: Rc<RefCell<T>>,
}

impl<T: Clone + PartialEq + 'static> TypedPropertyMethods<T> {
    /// Creates a method object owning a fresh cell with the given value.
    pub fn new(initial: T) -> Rc<Self> {
        Rc::new(Self {
            value: Rc::new(RefCell::new(initial)),
        })
    }

    /// Creates a method object over an existing shared cell.
    pub fn shared(value: Rc<RefCell<T>>) -> Rc<Self> {
        Rc::new(Self { value })
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Writes a new value. Returns true if the stored value changed.
    pub fn set(&self, value: T) -> bool {
        let mut current = self.value.borrow_mut();
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    }
}

impl<T: Clone + PartialEq + 'static> PropertyMethods for TypedPropertyMethods<T> {
    fn value_type(&self) -> PropertyTypeId {
        PropertyTypeId::of::<T>()
    }

    fn try_set(&self, source: &dyn PropertyMethods) -> PropertySetResult {
        let Some(source) = source.as_any().downcast_ref::<Self>() else {
            return PropertySetResult::UnsupportedGetType;
        };
        if self.set(source.get()) {
            PropertySetResult::ValueChanged
        } else {
            PropertySetResult::ValueUnchanged
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Observer method object wrapping a change callback.
///
/// [`try_invoke`](PropertyMethods::try_invoke) calls the closure with the
/// handle of the data source that changed. Returns false if the callback is
/// already being invoked (reentrant delivery is refused, not stacked).
pub struct ObserverPropertyMethods {
    callback: RefCell<Box<dyn FnMut(InstanceHandle)>>,
}

impl ObserverPropertyMethods {
    pub fn new(callback: impl FnMut(InstanceHandle) + 'static) -> Rc<Self> {
        Rc::new(Self {
            callback: RefCell::new(Box::new(callback)),
        })
    }
}

impl PropertyMethods for ObserverPropertyMethods {
    fn value_type(&self) -> PropertyTypeId {
        // Observers carry no value; binds to them are validated by kind only.
        PropertyTypeId::of::<()>()
    }

    fn try_invoke(&self, source: InstanceHandle) -> bool {
        let Ok(mut callback) = self.callback.try_borrow_mut() else {
            return false;
        };
        callback(source);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 1-to-1 converter built from a closure.
pub struct TypedConverterBinding<S, T> {
    convert: Box<dyn Fn(&S) -> T>,
}

impl<S: Clone + PartialEq + 'static, T: Clone + PartialEq + 'static> TypedConverterBinding<S, T> {
    pub fn new(convert: impl Fn(&S) -> T + 'static) -> Rc<Self> {
        Rc::new(Self {
            convert: Box::new(convert),
        })
    }
}

impl<S: Clone + PartialEq + 'static, T: Clone + PartialEq + 'static> ConverterBinding
    for TypedConverterBinding<S, T>
{
    fn source_type(&self) -> PropertyTypeId {
        PropertyTypeId::of::<S>()
    }

    fn target_type(&self) -> PropertyTypeId {
        PropertyTypeId::of::<T>()
    }

    fn convert(
        &self,
        target: &dyn PropertyMethods,
        source: &dyn PropertyMethods,
    ) -> PropertySetResult {
        let Some(source) = source.as_any().downcast_ref::<TypedPropertyMethods<S>>() else {
            return PropertySetResult::UnsupportedGetType;
        };
        let Some(target) = target.as_any().downcast_ref::<TypedPropertyMethods<T>>() else {
            return PropertySetResult::UnsupportedSetType;
        };
        let converted = (self.convert)(&source.get());
        if target.set(converted) {
            PropertySetResult::ValueChanged
        } else {
            PropertySetResult::ValueUnchanged
        }
    }
}

/// Two-source many-to-1 converter built from a closure.
///
/// For higher arities implement [`MultiConverterBinding`] directly; the
/// engine supports up to
/// [`MAX_MULTI_BIND_SOURCES`](crate::binding::MAX_MULTI_BIND_SOURCES)
/// sources per binding.
pub struct TypedMultiConverterBinding2<S0, S1, T> {
    source_types: [PropertyTypeId; 2],
    convert: Box<dyn Fn(&S0, &S1) -> T>,
}

impl<S0, S1, T> TypedMultiConverterBinding2<S0, S1, T>
where
    S0: Clone + PartialEq + 'static,
    S1: Clone + PartialEq + 'static,
    T: Clone + PartialEq + 'static,
{
    pub fn new(convert: impl Fn(&S0, &S1) -> T + 'static) -> Rc<Self> {
        Rc::new(Self {
            source_types: [PropertyTypeId::of::<S0>(), PropertyTypeId::of::<S1>()],
            convert: Box::new(convert),
        })
    }
}

impl<S0, S1, T> MultiConverterBinding for TypedMultiConverterBinding2<S0, S1, T>
where
    S0: Clone + PartialEq + 'static,
    S1: Clone + PartialEq + 'static,
    T: Clone + PartialEq + 'static,
{
    fn source_types(&self) -> &[PropertyTypeId] {
        &self.source_types
    }

    fn target_type(&self) -> PropertyTypeId {
        PropertyTypeId::of::<T>()
    }

    fn convert(
        &self,
        target: &dyn PropertyMethods,
        sources: &[&dyn PropertyMethods],
    ) -> PropertySetResult {
        if sources.len() != 2 {
            return PropertySetResult::UnsupportedBindingType;
        }
        let Some(s0) = sources[0].as_any().downcast_ref::<TypedPropertyMethods<S0>>() else {
            return PropertySetResult::UnsupportedGetType;
        };
        let Some(s1) = sources[1].as_any().downcast_ref::<TypedPropertyMethods<S1>>() else {
            return PropertySetResult::UnsupportedGetType;
        };
        let Some(target) = target.as_any().downcast_ref::<TypedPropertyMethods<T>>() else {
            return PropertySetResult::UnsupportedSetType;
        };
        let converted = (self.convert)(&s0.get(), &s1.get());
        if target.set(converted) {
            PropertySetResult::ValueChanged
        } else {
            PropertySetResult::ValueUnchanged
        }
    }
}
