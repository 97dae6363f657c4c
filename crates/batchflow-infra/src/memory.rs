//! In-memory job repository.
//!
//! Implements `JobRepository` from `batchflow-core` with `DashMap` tables.
//! Records live for the lifetime of the repository; clones share the same
//! tables, so a host can keep a handle for inspection while the operator owns
//! another.

use std::sync::Arc;

use batchflow_core::port::repository::{CheckpointTarget, JobRepository};
use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{ExecutionState, JobExecution, PartitionExecution, StepExecution};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    jobs: DashMap<Uuid, JobExecution>,
    /// Step executions per job execution, in creation order.
    steps: DashMap<Uuid, Vec<StepExecution>>,
    /// Step execution id -> owning job execution id.
    step_owners: DashMap<Uuid, Uuid>,
    /// Partition executions per step execution.
    partitions: DashMap<Uuid, Vec<PartitionExecution>>,
}

/// `DashMap`-backed implementation of `JobRepository`.
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    tables: Arc<Tables>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job executions of one instance, oldest first.
    pub fn instance_executions(&self, instance_id: Uuid) -> Vec<JobExecution> {
        let mut executions: Vec<JobExecution> = self
            .tables
            .jobs
            .iter()
            .filter(|entry| entry.instance_id == instance_id)
            .map(|entry| entry.value().clone())
            .collect();
        executions.sort_by_key(|e| (e.created_at, e.id));
        executions
    }

    fn with_step<T>(
        &self,
        step_execution_id: Uuid,
        f: impl FnOnce(&mut StepExecution) -> T,
    ) -> Result<T, RepositoryError> {
        let owner = self
            .tables
            .step_owners
            .get(&step_execution_id)
            .map(|entry| *entry.value())
            .ok_or(RepositoryError::NotFound)?;
        let mut steps = self
            .tables
            .steps
            .get_mut(&owner)
            .ok_or(RepositoryError::NotFound)?;
        steps
            .iter_mut()
            .find(|s| s.id == step_execution_id)
            .map(f)
            .ok_or(RepositoryError::NotFound)
    }

    fn with_partition<T>(
        &self,
        step_execution_id: Uuid,
        partition_execution_id: Uuid,
        f: impl FnOnce(&mut PartitionExecution) -> T,
    ) -> Result<T, RepositoryError> {
        let mut partitions = self
            .tables
            .partitions
            .get_mut(&step_execution_id)
            .ok_or(RepositoryError::NotFound)?;
        partitions
            .iter_mut()
            .find(|p| p.id == partition_execution_id)
            .map(f)
            .ok_or(RepositoryError::NotFound)
    }

    /// Step executions of every execution of `instance_id`, oldest execution
    /// first.
    fn instance_steps(&self, instance_id: Uuid, step_name: &str) -> Vec<StepExecution> {
        self.instance_executions(instance_id)
            .iter()
            .filter_map(|job| self.tables.steps.get(&job.id))
            .flat_map(|steps| {
                steps
                    .iter()
                    .filter(|s| s.step_name == step_name)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Copy the restart data and metrics of `state` onto a stored record.
fn apply_checkpoint(stored: &mut ExecutionState, state: &ExecutionState) {
    stored.reader_checkpoint = state.reader_checkpoint.clone();
    stored.writer_checkpoint = state.writer_checkpoint.clone();
    stored.persistent_user_data = state.persistent_user_data.clone();
    stored.metrics = state.metrics;
}

impl JobRepository for InMemoryJobRepository {
    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        if self.tables.jobs.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "job execution {} already exists",
                execution.id
            )));
        }
        self.tables.jobs.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut stored = self
            .tables
            .jobs
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        *stored = execution.clone();
        Ok(())
    }

    async fn get_job_execution(&self, id: Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.tables.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn add_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        if self.tables.step_owners.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "step execution {} already exists",
                execution.id
            )));
        }
        self.tables
            .step_owners
            .insert(execution.id, execution.job_execution_id);
        self.tables
            .steps
            .entry(execution.job_execution_id)
            .or_default()
            .push(execution.clone());
        Ok(())
    }

    async fn update_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        self.with_step(execution.id, |stored| *stored = execution.clone())
    }

    async fn save_checkpoint(
        &self,
        target: &CheckpointTarget,
        state: &ExecutionState,
    ) -> Result<(), RepositoryError> {
        match *target {
            CheckpointTarget::Step(id) => self.with_step(id, |step| apply_checkpoint(&mut step.state, state)),
            CheckpointTarget::Partition {
                step_execution_id,
                partition_execution_id,
            } => self.with_partition(step_execution_id, partition_execution_id, |partition| {
                apply_checkpoint(&mut partition.state, state)
            }),
        }
    }

    async fn add_partition_execution(&self, execution: &PartitionExecution) -> Result<(), RepositoryError> {
        let mut partitions = self
            .tables
            .partitions
            .entry(execution.step_execution_id)
            .or_default();
        if partitions.iter().any(|p| p.id == execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "partition execution {} already exists",
                execution.id
            )));
        }
        partitions.push(execution.clone());
        Ok(())
    }

    async fn update_partition_execution(&self, execution: &PartitionExecution) -> Result<(), RepositoryError> {
        self.with_partition(execution.step_execution_id, execution.id, |stored| {
            *stored = execution.clone()
        })
    }

    async fn partition_executions(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Vec<PartitionExecution>, RepositoryError> {
        let mut partitions = self
            .tables
            .partitions
            .get(&step_execution_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        partitions.sort_by_key(|p| p.partition_index);
        Ok(partitions)
    }

    async fn step_executions(&self, job_execution_id: Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self
            .tables
            .steps
            .get(&job_execution_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn count_step_starts(&self, instance_id: Uuid, step_name: &str) -> Result<u32, RepositoryError> {
        let starts = self
            .instance_steps(instance_id, step_name)
            .iter()
            .filter(|s| s.state.started_at.is_some())
            .count();
        Ok(u32::try_from(starts).unwrap_or(u32::MAX))
    }

    async fn last_step_execution(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self.instance_steps(instance_id, step_name).pop())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
