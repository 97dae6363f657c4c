//! Errors raised while running a job graph.

use batchflow_types::error::{
    ArtifactError, BatchError, DispatchError, RepositoryError, TransactionError,
};
use batchflow_types::execution::FailureInfo;
use batchflow_types::status::BatchStatus;
use uuid::Uuid;

/// Errors raised by the runners and the job operator.
///
/// Only `Artifact` errors coming out of item reads, processing and writes
/// are classified by a chunk's skip/retry policy. Everything else fails the
/// enclosing step or job directly.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("artifact error: {0}")]
    Artifact(#[from] BatchError),

    #[error("listener error: {0}")]
    Listener(BatchError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("artifact creation failed: {0}")]
    ArtifactCreation(#[from] ArtifactError),

    #[error("invalid chunk configuration in step '{step}': {reason}")]
    InvalidChunk { step: String, reason: String },

    #[error("step '{step}' was already executed in this job execution")]
    LoopBack { step: String },

    #[error("step '{step}' reached its start limit of {limit}")]
    StartLimitReached { step: String, limit: u32 },

    #[error("no element '{id}' in '{container}'")]
    UnknownElement { id: String, container: String },

    #[error("decision '{id}' cannot be the first element of '{container}'")]
    DecisionFirst { id: String, container: String },

    #[error("split '{split}' did not finish within {secs}s")]
    SplitTimeout { split: String, secs: u64 },

    #[error("partition coordination failed: {0}")]
    Partition(String),

    #[error("partition dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("task join error: {0}")]
    Join(String),

    #[error("job execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("job '{0}' is not restartable")]
    NotRestartable(String),

    #[error("job execution {execution} is {status}")]
    InvalidState { execution: Uuid, status: BatchStatus },

    #[error("timed out waiting for job execution {0}")]
    WaitTimeout(Uuid),
}

impl RunnerError {
    /// Short machine-readable kind, recorded with failures.
    pub fn kind(&self) -> &str {
        match self {
            Self::Artifact(e) | Self::Listener(e) => &e.kind,
            Self::Repository(_) => "repository",
            Self::Transaction(_) => "transaction",
            Self::ArtifactCreation(_) => "artifact_creation",
            Self::InvalidChunk { .. } => "invalid_chunk",
            Self::LoopBack { .. } => "loop_back",
            Self::StartLimitReached { .. } => "start_limit",
            Self::UnknownElement { .. } => "unknown_element",
            Self::DecisionFirst { .. } => "decision_first",
            Self::SplitTimeout { .. } => "split_timeout",
            Self::Partition(_) => "partition",
            Self::Dispatch(_) => "partition_dispatch",
            Self::Join(_) => "join",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::NotRestartable(_) => "not_restartable",
            Self::InvalidState { .. } => "invalid_state",
            Self::WaitTimeout(_) => "wait_timeout",
        }
    }

    pub fn failure_info(&self) -> FailureInfo {
        match self {
            Self::Artifact(e) | Self::Listener(e) => FailureInfo::from(e),
            other => FailureInfo::new(other.kind(), other.to_string()),
        }
    }

    /// The error as seen by chunk listeners' `on_error`.
    pub fn to_batch_error(&self) -> BatchError {
        match self {
            Self::Artifact(e) | Self::Listener(e) => e.clone(),
            other => BatchError::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_failure_keeps_kind() {
        let err = RunnerError::Artifact(BatchError::new("io", "disk full"));
        let info = err.failure_info();
        assert_eq!(info.kind, "io");
        assert_eq!(info.message, "disk full");
    }

    #[test]
    fn engine_failure_uses_variant_kind() {
        let err = RunnerError::LoopBack {
            step: "load".to_string(),
        };
        let info = err.failure_info();
        assert_eq!(info.kind, "loop_back");
        assert!(info.message.contains("load"));
        assert_eq!(err.to_batch_error().kind, "loop_back");
    }
}
