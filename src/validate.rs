//! Binding validation: structural and type rules checked before a binding is
//! committed to the graph.
//!
//! All checks run against the registry without mutating it; the graph
//! mutator only writes edges after `validate_bind` succeeds.

use crate::binding::{Binding, ComplexBinding, MAX_MULTI_BIND_SOURCES};
use crate::error::{BindingServiceError, Result};
use crate::handle::InstanceHandle;
use crate::handle_vec::HandleVec;
use crate::property::PropertyMethods;
use crate::record::{InstanceKind, InstanceRecord};

/// Validates a binding declaration against the registry.
///
/// Checks, in order: target liveness, source arity bounds, source liveness,
/// and the kind/type compatibility rules of the target. After this returns
/// `Ok`, every handle in the binding is known valid and the mutator may use
/// unchecked lookups.
pub(crate) fn validate_bind(
    instances: &HandleVec<InstanceRecord>,
    target: InstanceHandle,
    binding: &Binding,
) -> Result<()> {
    let target_record = instances
        .get(target)
        .filter(|record| record.is_alive())
        .ok_or(BindingServiceError::DeadInstance("target must be alive"))?;

    let sources = binding.sources();
    if sources.is_empty() {
        return Err(BindingServiceError::BindingUnsupported(
            "there should always be at least one source in a binding".into(),
        ));
    }
    if sources.len() > MAX_MULTI_BIND_SOURCES {
        return Err(BindingServiceError::BindingUnsupported(format!(
            "there can not be more than {} source bind entries, got: {}",
            MAX_MULTI_BIND_SOURCES,
            sources.len()
        )));
    }
    for &source in sources {
        instances
            .get(source)
            .filter(|record| record.is_alive())
            .ok_or(BindingServiceError::DeadInstance("source must be alive"))?;
    }

    match target_record.kind() {
        InstanceKind::DependencyObject => Err(BindingServiceError::BindingIncompatibleProperties(
            "bind target can not be a DependencyObject",
        )),
        InstanceKind::DataSourceObject => Err(BindingServiceError::BindingIncompatibleProperties(
            "bind target can not be a DataSourceObject",
        )),
        InstanceKind::DependencyObserverProperty => {
            validate_bind_to_observer_property(instances, target_record, binding)
        }
        InstanceKind::DependencyProperty => {
            validate_bind_to_dependency_property(instances, target_record, binding)
        }
    }
}

/// Observer properties accept exactly one DataSourceObject source, no
/// converter, and require their method object to be attached.
fn validate_bind_to_observer_property(
    instances: &HandleVec<InstanceRecord>,
    target_record: &InstanceRecord,
    binding: &Binding,
) -> Result<()> {
    let sources = binding.sources();
    if sources.len() != 1 {
        return Err(BindingServiceError::Binding(
            "observer property binding should always have a source count of 1",
        ));
    }
    if instances.fast_get(sources[0]).kind() != InstanceKind::DataSourceObject {
        return Err(BindingServiceError::BindingIncompatibleProperties(
            "observer property binding sources should always be a DataSourceObject",
        ));
    }
    if binding.complex_binding().is_some() {
        return Err(BindingServiceError::Binding(
            "observer property binding should not have a converter attached",
        ));
    }
    if target_record.methods.is_none() {
        return Err(BindingServiceError::Internal("no methods associated"));
    }
    Ok(())
}

/// Dependency properties require all sources to be dependency properties
/// with methods attached, then a type-compatibility check that depends on
/// the attached converter kind.
fn validate_bind_to_dependency_property(
    instances: &HandleVec<InstanceRecord>,
    target_record: &InstanceRecord,
    binding: &Binding,
) -> Result<()> {
    for &source in binding.sources() {
        let source_record = instances.fast_get(source);
        if source_record.kind() != InstanceKind::DependencyProperty {
            return Err(BindingServiceError::BindingIncompatibleProperties(
                "source must be a DependencyProperty",
            ));
        }
        if source_record.methods.is_none() {
            // Should have been guaranteed at creation time
            return Err(BindingServiceError::Internal("no methods associated"));
        }
    }

    let target_methods = target_record
        .methods
        .as_deref()
        .ok_or(BindingServiceError::Internal("no methods associated"))?;

    match binding.complex_binding() {
        None => validate_direct_set(instances, target_methods, binding),
        Some(ComplexBinding::Convert(converter)) => {
            validate_converter(instances, target_methods, binding, converter.as_ref())
        }
        Some(ComplexBinding::MultiConvert(converter)) => {
            validate_multi_converter(instances, target_methods, binding, converter.as_ref())
        }
    }
}

fn validate_direct_set(
    instances: &HandleVec<InstanceRecord>,
    target_methods: &dyn PropertyMethods,
    binding: &Binding,
) -> Result<()> {
    let sources = binding.sources();
    if sources.len() != 1 {
        return Err(BindingServiceError::BindingUnsupported(format!(
            "a basic bind can only contain exactly one source, but {} sources were supplied",
            sources.len()
        )));
    }
    if source_methods(instances, sources[0])?.value_type() != target_methods.value_type() {
        return Err(BindingServiceError::BindingIncompatibleTypes(
            "target and source type must match or a converter binding must be supplied",
        ));
    }
    Ok(())
}

fn validate_converter(
    instances: &HandleVec<InstanceRecord>,
    target_methods: &dyn PropertyMethods,
    binding: &Binding,
    converter: &dyn crate::binding::ConverterBinding,
) -> Result<()> {
    let sources = binding.sources();
    if sources.len() != 1 {
        return Err(BindingServiceError::BindingUnsupported(
            "a converter binding takes exactly one source as input".into(),
        ));
    }
    if source_methods(instances, sources[0])?.value_type() != converter.source_type() {
        return Err(BindingServiceError::BindingIncompatibleTypes(
            "converter source type is not compatible with the bound source property",
        ));
    }
    if target_methods.value_type() != converter.target_type() {
        return Err(BindingServiceError::BindingIncompatibleTypes(
            "converter target type is not compatible with the target property",
        ));
    }
    Ok(())
}

fn validate_multi_converter(
    instances: &HandleVec<InstanceRecord>,
    target_methods: &dyn PropertyMethods,
    binding: &Binding,
    converter: &dyn crate::binding::MultiConverterBinding,
) -> Result<()> {
    let sources = binding.sources();
    let converter_source_types = converter.source_types();
    if converter_source_types.len() != sources.len() {
        return Err(BindingServiceError::BindingUnsupported(format!(
            "multi converter binding was expecting {} sources but {} were provided",
            converter_source_types.len(),
            sources.len()
        )));
    }
    for (&source, &expected_type) in sources.iter().zip(converter_source_types) {
        if source_methods(instances, source)?.value_type() != expected_type {
            return Err(BindingServiceError::BindingIncompatibleTypes(
                "converter source type is not compatible with the bound source property",
            ));
        }
    }
    if target_methods.value_type() != converter.target_type() {
        return Err(BindingServiceError::BindingIncompatibleTypes(
            "converter target type is not compatible with the target property",
        ));
    }
    Ok(())
}

/// Method object of an already-validated source property.
fn source_methods(
    instances: &HandleVec<InstanceRecord>,
    source: InstanceHandle,
) -> Result<&dyn PropertyMethods> {
    instances
        .fast_get(source)
        .methods
        .as_deref()
        .ok_or(BindingServiceError::Internal("no methods associated"))
}
