//! Runtime error taxonomy.
//!
//! Fatal errors terminate the execution they occur in and are reported as its
//! result. Storage errors abort the current advance without touching state,
//! so the same advance can simply be attempted again.

use crate::types::ErrorInfo;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A different step record already exists at this index.
    #[error("Conflicting step record for execution '{execution_id}' at index {index}")]
    Conflict { execution_id: String, index: u32 },

    /// The promise was settled before; the first writer won.
    #[error("Promise '{0}' is already resolved")]
    AlreadyResolved(String),

    #[error("Promise '{0}' not found")]
    PromiseNotFound(String),

    /// Replay requested something other than what history recorded.
    #[error(
        "Non-deterministic replay of execution '{execution_id}' at step {index}: recorded {recorded}, requested {requested}"
    )]
    NonDeterminism {
        execution_id: String,
        index: u32,
        recorded: String,
        requested: String,
    },

    #[error("Invocation depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("Workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("Side effect '{0}' is not registered")]
    UnknownFunction(String),

    #[error("'{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Execution '{id}' already exists for workflow '{existing}', not '{requested}'")]
    ExecutionMismatch {
        id: String,
        existing: String,
        requested: String,
    },

    /// The id belongs to an execution started from somewhere else
    #[error("Execution id '{0}' is already taken by an unrelated execution")]
    IdCollision(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error terminates the execution it was raised in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::NonDeterminism { .. }
                | Error::DepthExceeded { .. }
                | Error::UnknownWorkflow(_)
                | Error::UnknownFunction(_)
                | Error::ExecutionMismatch { .. }
                | Error::IdCollision(_)
        )
    }

    /// Name used as `ErrorInfo::kind` when the error becomes an execution result.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Conflict { .. } => "ConflictError",
            Error::AlreadyResolved(_) => "AlreadyResolvedError",
            Error::PromiseNotFound(_) => "PromiseNotFoundError",
            Error::NonDeterminism { .. } => "NonDeterminismError",
            Error::DepthExceeded { .. } => "DepthExceededError",
            Error::UnknownWorkflow(_) => "UnknownWorkflowError",
            Error::UnknownFunction(_) => "UnknownFunctionError",
            Error::DuplicateRegistration(_) => "DuplicateRegistrationError",
            Error::ExecutionNotFound(_) => "ExecutionNotFoundError",
            Error::ExecutionMismatch { .. } => "ExecutionMismatchError",
            Error::IdCollision(_) => "IdCollisionError",
            Error::Database(_) => "DatabaseError",
            Error::Serialization(_) => "SerializationError",
            Error::Other(_) => "InternalError",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DepthExceeded { depth: 4, max: 3 }.is_fatal());
        assert!(Error::NonDeterminism {
            execution_id: "e".into(),
            index: 0,
            recorded: "a".into(),
            requested: "b".into(),
        }
        .is_fatal());
        assert!(!Error::AlreadyResolved("p".into()).is_fatal());
        assert!(!Error::Other(anyhow::anyhow!("connection reset")).is_fatal());
    }

    #[test]
    fn test_error_info_kind() {
        let info = Error::DepthExceeded { depth: 11, max: 10 }.to_error_info();
        assert_eq!(info.kind, "DepthExceededError");
        assert_eq!(info.message, "Invocation depth 11 exceeds the maximum of 10");
    }
}
