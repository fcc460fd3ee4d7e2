use std::rc::Rc;

use crate::handle::InstanceHandle;
use crate::property::{PropertyMethods, PropertySetResult, PropertyTypeId};

/// Upper bound on the number of sources a single binding may declare.
pub const MAX_MULTI_BIND_SOURCES: usize = 4;

/// User-supplied 1-to-1 value conversion between a source and a target
/// property of (possibly) different value types.
pub trait ConverterBinding {
    /// The value-type tag the converter reads from.
    fn source_type(&self) -> PropertyTypeId;

    /// The value-type tag the converter writes to.
    fn target_type(&self) -> PropertyTypeId;

    /// Reads the source, converts, and writes the target.
    fn convert(
        &self,
        target: &dyn PropertyMethods,
        source: &dyn PropertyMethods,
    ) -> PropertySetResult;
}

/// User-supplied many-to-1 conversion combining several source properties
/// into one target value.
pub trait MultiConverterBinding {
    /// The ordered value-type tags of the expected sources. A binding using
    /// this converter must declare exactly one source per entry, each of the
    /// matching type.
    fn source_types(&self) -> &[PropertyTypeId];

    /// The value-type tag the converter writes to.
    fn target_type(&self) -> PropertyTypeId;

    /// Reads all sources (in declaration order), converts, and writes the
    /// target.
    fn convert(
        &self,
        target: &dyn PropertyMethods,
        sources: &[&dyn PropertyMethods],
    ) -> PropertySetResult;
}

/// Converter attached to a binding, discriminated by kind so dispatch during
/// validation and execution is exhaustive.
#[derive(Clone)]
pub enum ComplexBinding {
    /// 1-to-1 conversion.
    Convert(Rc<dyn ConverterBinding>),
    /// Many-to-1 conversion.
    MultiConvert(Rc<dyn MultiConverterBinding>),
}

impl std::fmt::Debug for ComplexBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Convert(_) => write!(f, "ComplexBinding::Convert"),
            Self::MultiConvert(_) => write!(f, "ComplexBinding::MultiConvert"),
        }
    }
}

/// A declared dependency of a target instance on one or more source
/// instances, optionally through a converter.
///
/// An empty binding is legal as an argument to `set_binding` and acts as a
/// clear request.
#[derive(Clone, Debug, Default)]
pub struct Binding {
    sources: Vec<InstanceHandle>,
    complex: Option<ComplexBinding>,
}

impl Binding {
    /// Creates an empty binding (clears the target when applied).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a simple 1-to-1 binding: source and target types must match.
    pub fn new(source: InstanceHandle) -> Self {
        Self {
            sources: vec![source],
            complex: None,
        }
    }

    /// Creates a 1-to-1 binding through a converter.
    pub fn with_converter(converter: Rc<dyn ConverterBinding>, source: InstanceHandle) -> Self {
        Self {
            sources: vec![source],
            complex: Some(ComplexBinding::Convert(converter)),
        }
    }

    /// Creates a many-to-1 binding through a multi converter.
    pub fn with_multi_converter(
        converter: Rc<dyn MultiConverterBinding>,
        sources: &[InstanceHandle],
    ) -> Self {
        Self {
            sources: sources.to_vec(),
            complex: Some(ComplexBinding::MultiConvert(converter)),
        }
    }

    /// Returns the declared source handles in order.
    pub fn sources(&self) -> &[InstanceHandle] {
        &self.sources
    }

    /// Returns true if at least one source is declared.
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Returns true if `handle` is one of the declared sources.
    pub fn contains_source(&self, handle: InstanceHandle) -> bool {
        self.sources.contains(&handle)
    }

    /// Returns the attached converter, if any.
    pub fn complex_binding(&self) -> Option<&ComplexBinding> {
        self.complex.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_binding_has_no_sources() {
        let binding = Binding::empty();
        assert!(!binding.has_sources());
        assert!(binding.complex_binding().is_none());
    }

    #[test]
    fn simple_binding_contains_its_source() {
        let source = InstanceHandle::new(1, 0);
        let other = InstanceHandle::new(2, 0);
        let binding = Binding::new(source);

        assert!(binding.has_sources());
        assert!(binding.contains_source(source));
        assert!(!binding.contains_source(other));
        assert_eq!(binding.sources(), &[source]);
    }
}
