use thiserror::Error;

/// Error taxonomy of the engine.
///
/// `Validation` and `NotFound` are expected control flow: callers render an
/// empty or "not found" state. `Storage` wraps whatever the store adapter
/// reported; a storage failure during a merge has already been rolled back.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Which operation produced an error, for picking the user-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Merge,
    Funnel,
    Journey,
    Ingest,
}

impl EngineError {
    /// Short machine-readable code, mirroring the error codes dashboards branch on.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Storage(_) => "storage_error",
        }
    }

    /// Message safe to show to a dashboard user.
    ///
    /// Merge failures carry their specific reason. Funnel and journey storage
    /// failures collapse to a generic message so query details never leak.
    pub fn public_message(&self, op: Operation) -> String {
        match (op, self) {
            (_, EngineError::Validation(msg)) => msg.clone(),
            (Operation::Merge, EngineError::NotFound(msg)) => msg.clone(),
            (Operation::Merge, EngineError::Conflict(msg)) => msg.clone(),
            (Operation::Merge, EngineError::Storage(e)) => format!("merge failed: {e}"),
            (_, EngineError::NotFound(_)) => "Not found".to_string(),
            (Operation::Funnel, _) => "Funnel could not be computed".to_string(),
            (Operation::Journey, _) => "Journey could not be loaded".to_string(),
            (Operation::Ingest, _) => "Event could not be recorded".to_string(),
        }
    }
}
