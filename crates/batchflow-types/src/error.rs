use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error raised by a batch artifact (reader, processor, writer, batchlet,
/// listener, decider, partition callback).
///
/// Carries a type lineage so skip/retry/no-rollback filters can match it by
/// kind: `kind` is the most specific kind, `ancestors` lists its more general
/// kinds from nearest to farthest.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BatchError {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<String>,
    pub message: String,
}

impl BatchError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestors: Vec::new(),
            message: message.into(),
        }
    }

    /// Attach the more general kinds this error belongs to, nearest first.
    pub fn with_ancestors<I, S>(mut self, ancestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ancestors = ancestors.into_iter().map(Into::into).collect();
        self
    }

    /// Distance from this error's kind to `kind`: 0 for the kind itself,
    /// 1 for the nearest ancestor and so on. `None` when unrelated.
    pub fn distance_to(&self, kind: &str) -> Option<usize> {
        if self.kind == kind {
            return Some(0);
        }
        self.ancestors
            .iter()
            .position(|a| a == kind)
            .map(|idx| idx + 1)
    }
}

/// Errors from repository operations (used by trait definitions in batchflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the transaction facade.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("no active transaction")]
    NotActive,

    #[error("a transaction is already active")]
    AlreadyActive,

    #[error("transaction timed out after {0}s")]
    TimedOut(u64),

    #[error("transaction backend error: {0}")]
    Backend(String),
}

/// Errors from artifact instantiation.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no artifact registered under '{0}'")]
    Unknown(String),

    #[error("artifact '{name}' is not a {expected}")]
    WrongKind { name: String, expected: &'static str },

    #[error("failed to create artifact '{name}': {reason}")]
    Construction { name: String, reason: String },
}

/// Errors from handing a partition to a partition handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("partition handler is shut down")]
    Shutdown,

    #[error("partition {partition} rejected: {reason}")]
    Rejected { partition: u32, reason: String },
}
