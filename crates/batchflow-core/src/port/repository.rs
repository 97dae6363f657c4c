//! Job repository trait definition.

use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{ExecutionState, JobExecution, PartitionExecution, StepExecution};
use uuid::Uuid;

/// Where a chunk checkpoint is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTarget {
    Step(Uuid),
    Partition {
        step_execution_id: Uuid,
        partition_execution_id: Uuid,
    },
}

impl CheckpointTarget {
    /// The step execution the checkpoint belongs to.
    pub fn step_execution_id(&self) -> Uuid {
        match self {
            Self::Step(id) => *id,
            Self::Partition {
                step_execution_id, ..
            } => *step_execution_id,
        }
    }
}

/// Repository trait for job, step and partition execution records.
///
/// Implementations live in batchflow-infra (e.g., InMemoryJobRepository).
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
///
/// `save_checkpoint` stores the given state as-is. Saving the same state
/// twice leaves the stored record unchanged.
pub trait JobRepository: Send + Sync {
    /// Persist a new job execution.
    fn create_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a stored job execution.
    fn update_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Look up a job execution by id.
    fn get_job_execution(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    /// Persist a new step execution.
    fn add_step_execution(
        &self,
        execution: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a stored step execution.
    fn update_step_execution(
        &self,
        execution: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Store reader/writer checkpoints, persistent user data and metrics of a
    /// step or partition.
    fn save_checkpoint(
        &self,
        target: &CheckpointTarget,
        state: &ExecutionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist a new partition execution.
    fn add_partition_execution(
        &self,
        execution: &PartitionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a stored partition execution.
    fn update_partition_execution(
        &self,
        execution: &PartitionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All partition executions of a step execution, ordered by index.
    fn partition_executions(
        &self,
        step_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<PartitionExecution>, RepositoryError>> + Send;

    /// All step executions of a job execution, in creation order.
    fn step_executions(
        &self,
        job_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// How many times a step has been started across all executions of a job
    /// instance.
    fn count_step_starts(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    /// The most recent execution of a step within a job instance.
    fn last_step_execution(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;
}
