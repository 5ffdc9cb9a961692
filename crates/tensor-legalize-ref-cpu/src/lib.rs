//! Reference interpreter for legalized functions.
//!
//! Evaluates target instructions on the host with straightforward loops. It exists to
//! check lowerings numerically, not to be fast.

pub mod cpu;

use thiserror::Error;

pub use cpu::{run_function, CpuTensor, TensorData};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
