use thiserror::Error;

pub type InvokeResult<T> = Result<T, InvokeError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvokeError {
    #[error("no such {what}: {owner}.{name}:{descriptor}")]
    Resolution {
        what: &'static str,
        owner: String,
        name: String,
        descriptor: String,
    },
    #[error("{caller} cannot access {member}: {reason}")]
    Access {
        caller: String,
        member: String,
        reason: &'static str,
    },
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("null pointer: {0}")]
    NullPointer(String),
    #[error("cannot cast {actual} to {expected}")]
    IncompatibleType { expected: String, actual: String },
    #[error("index {index} out of bounds for length {length}")]
    ArrayIndexOutOfBounds { index: i64, length: usize },
    #[error("cannot store {actual} into array of {component}")]
    ArrayStore { component: String, actual: String },
    #[error("access mode {mode} is not supported for {member}")]
    UnsupportedOperation { mode: String, member: String },
    #[error("expected calling type {expected} but found {actual}")]
    WrongCallingType { expected: String, actual: String },
    #[error("initialization of {class} failed: {message}")]
    Initialization { class: String, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl InvokeError {
    /// Synthesizer and layout consistency failures. These indicate a runtime defect,
    /// never a misuse by the caller.
    pub fn is_internal(&self) -> bool {
        matches!(self, InvokeError::Internal(_))
    }

    pub(crate) fn null_pointer(what: impl Into<String>) -> Self {
        InvokeError::NullPointer(what.into())
    }

    pub(crate) fn incompatible(expected: impl ToString, actual: impl ToString) -> Self {
        InvokeError::IncompatibleType {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn wrong_type(expected: impl ToString, actual: impl ToString) -> Self {
        InvokeError::WrongCallingType {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        InvokeError::Internal(message.into())
    }
}
