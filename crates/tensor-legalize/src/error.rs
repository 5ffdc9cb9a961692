use thiserror::Error;

use crate::index::FunctionIndexError;

/// Reasons a rule declines to rewrite an operation.
///
/// A rule that returns one of these has not modified the function.
#[derive(Debug, Error, PartialEq)]
pub enum LegalizeError {
    #[error("unsupported element type: {0}")]
    UnsupportedDType(String),
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("operand must be a compile-time constant: {0}")]
    NonConstantOperand(String),
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
    #[error(transparent)]
    Index(#[from] FunctionIndexError),
}

impl LegalizeError {
    pub fn dtype(message: impl Into<String>) -> Self {
        LegalizeError::UnsupportedDType(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        LegalizeError::UnsupportedShape(message.into())
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        LegalizeError::TypeMismatch(message.into())
    }

    pub fn non_constant(message: impl Into<String>) -> Self {
        LegalizeError::NonConstantOperand(message.into())
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        LegalizeError::OutOfRange(message.into())
    }

    pub fn option(message: impl Into<String>) -> Self {
        LegalizeError::UnsupportedOption(message.into())
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        LegalizeError::UnsupportedType(message.into())
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        LegalizeError::ShapeMismatch(message.into())
    }

    pub fn operand(message: impl Into<String>) -> Self {
        LegalizeError::InvalidOperand(message.into())
    }
}

pub type LegalizeResult<T> = Result<T, LegalizeError>;
