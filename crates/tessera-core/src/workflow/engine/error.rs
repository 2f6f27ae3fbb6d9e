use tessera_types::error::RepositoryError;
use thiserror::Error;

use crate::workflow::definition::SpecError;
use crate::workflow::executor::ExecutorError;
use crate::workflow::expression::ExpressionError;
use crate::workflow::policy::PolicyError;

/// Errors surfaced by dispatcher operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow input or call parameters do not match the definition.
    #[error("invalid input: {0}")]
    Input(String),

    /// The execution is not in a state that allows the operation.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("{0}")]
    PolicyValidation(String),

    #[error("invalid workflow definition: {0}")]
    Spec(#[from] SpecError),

    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Whether repeating the failed operation can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Repository(e) if e.is_transient() => ErrorKind::Retryable,
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<PolicyError> for EngineError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Expression(inner) => Self::Expression(inner),
            other @ PolicyError::Validation { .. } => Self::PolicyValidation(other.to_string()),
        }
    }
}
