//! Local transaction manager.
//!
//! There are no enlisted resources: a `LocalTransaction` only tracks its
//! status and deadline, so chunk boundaries and timeouts behave the same as
//! under a real transaction manager. Commit after the deadline rolls back.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use batchflow_core::port::transaction::{TransactionManager, TransactionStatus, UserTransaction};
use batchflow_types::error::TransactionError;

/// Hands out `LocalTransaction`s with a default timeout.
#[derive(Debug, Clone)]
pub struct LocalTransactionManager {
    default_timeout_secs: u64,
}

impl LocalTransactionManager {
    /// `default_timeout_secs` of 0 means transactions never time out.
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs,
        }
    }
}

impl TransactionManager for LocalTransactionManager {
    fn transaction(&self) -> Box<dyn UserTransaction> {
        Box::new(LocalTransaction {
            default_timeout_secs: self.default_timeout_secs,
            timeout_secs: self.default_timeout_secs,
            deadline: None,
            status: TransactionStatus::NoTransaction,
        })
    }
}

#[derive(Debug)]
pub struct LocalTransaction {
    default_timeout_secs: u64,
    timeout_secs: u64,
    deadline: Option<Instant>,
    status: TransactionStatus,
}

#[async_trait]
impl UserTransaction for LocalTransaction {
    async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.status.is_in_flight() {
            return Err(TransactionError::AlreadyActive);
        }
        self.deadline = (self.timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(self.timeout_secs));
        self.status = TransactionStatus::Active;
        tracing::trace!(timeout_secs = self.timeout_secs, "transaction begun");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if !self.status.is_in_flight() {
            return Err(TransactionError::NotActive);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            tracing::warn!(timeout_secs = self.timeout_secs, "transaction timed out, rolling back");
            self.status = TransactionStatus::RolledBack;
            return Err(TransactionError::TimedOut(self.timeout_secs));
        }
        self.status = TransactionStatus::Committed;
        tracing::trace!("transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.status.is_in_flight() {
            return Err(TransactionError::NotActive);
        }
        self.status = TransactionStatus::RolledBack;
        tracing::trace!("transaction rolled back");
        Ok(())
    }

    fn set_timeout(&mut self, secs: u64) {
        self.timeout_secs = if secs == 0 {
            self.default_timeout_secs
        } else {
            secs
        };
    }

    fn status(&self) -> TransactionStatus {
        self.status
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_commit_cycle() {
        let mut tx = LocalTransactionManager::new(30).transaction();
        assert_eq!(tx.status(), TransactionStatus::NoTransaction);
        assert!(matches!(tx.commit().await, Err(TransactionError::NotActive)));

        tx.begin().await.unwrap();
        assert!(matches!(tx.begin().await, Err(TransactionError::AlreadyActive)));
        tx.commit().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);

        tx.begin().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn commit_after_deadline_rolls_back() {
        let mut tx = LocalTransactionManager::new(0).transaction();
        tx.set_timeout(1);
        tx.begin().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(matches!(tx.commit().await, Err(TransactionError::TimedOut(1))));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn zero_timeout_restores_default() {
        let mut tx = LocalTransactionManager::new(0).transaction();
        tx.set_timeout(1);
        tx.set_timeout(0);
        tx.begin().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tx.commit().await.unwrap();
    }
}
