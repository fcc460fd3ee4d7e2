use thiserror::Error;

/// Errors surfaced by the binding engine.
///
/// Binding-declaration failures (`Binding*`, `CyclicBinding`, `DeadInstance`)
/// abort the offending `set_binding` call and leave the target's bindings
/// cleared. `UsageError` means an API was entered from an illegal
/// call-context and is always a programmer error. `Internal` and
/// `NotSupported` indicate a violated engine invariant; they should never
/// occur in correct usage.
#[derive(Error, Debug)]
pub enum BindingServiceError {
    #[error("called from an illegal call context: {0}")]
    UsageError(&'static str),
    #[error("dead instance: {0}")]
    DeadInstance(&'static str),
    #[error("invalid parent instance: {0}")]
    InvalidParentInstance(&'static str),
    #[error("binding error: {0}")]
    Binding(&'static str),
    #[error("incompatible properties: {0}")]
    BindingIncompatibleProperties(&'static str),
    #[error("incompatible types: {0}")]
    BindingIncompatibleTypes(&'static str),
    #[error("unsupported binding: {0}")]
    BindingUnsupported(String),
    #[error("cyclic binding: {0}")]
    CyclicBinding(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

pub type Result<T> = std::result::Result<T, BindingServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = BindingServiceError::CyclicBinding("circular dependency found");
        assert_eq!(err.to_string(), "cyclic binding: circular dependency found");
    }
}
