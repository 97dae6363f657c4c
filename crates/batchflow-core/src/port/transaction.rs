//! Transaction facade used around chunk boundaries.
//!
//! The chunk engine begins, commits and rolls back through `UserTransaction`
//! and never inspects the resources enlisted behind it.

use async_trait::async_trait;
use batchflow_types::error::TransactionError;

/// State of a `UserTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NoTransaction,
    Active,
    MarkedRollback,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    /// Whether a rollback is still possible.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }
}

/// A single transaction handle owned by one chunk runner.
#[async_trait]
pub trait UserTransaction: Send {
    async fn begin(&mut self) -> Result<(), TransactionError>;

    async fn commit(&mut self) -> Result<(), TransactionError>;

    async fn rollback(&mut self) -> Result<(), TransactionError>;

    /// Timeout for transactions begun after this call. 0 restores the default.
    fn set_timeout(&mut self, secs: u64);

    fn status(&self) -> TransactionStatus;
}

/// Hands out transaction handles.
pub trait TransactionManager: Send + Sync {
    fn transaction(&self) -> Box<dyn UserTransaction>;
}
