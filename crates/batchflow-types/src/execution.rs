//! Execution records for jobs, steps and partitions, plus step metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BatchError;
use crate::job::Properties;
use crate::status::{BatchStatus, ExecutionStatus};

/// Opaque reader/writer position marker.
pub type Checkpoint = Value;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Kinds of step metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ReadCount,
    WriteCount,
    CommitCount,
    RollbackCount,
    ReadSkipCount,
    ProcessSkipCount,
    WriteSkipCount,
    FilterCount,
}

impl MetricType {
    pub const ALL: [MetricType; 8] = [
        Self::ReadCount,
        Self::WriteCount,
        Self::CommitCount,
        Self::RollbackCount,
        Self::ReadSkipCount,
        Self::ProcessSkipCount,
        Self::WriteSkipCount,
        Self::FilterCount,
    ];
}

/// Counters of a step or partition execution.
///
/// Only `increment` and `merge` change the values, so counters never go
/// down within one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    read_count: u64,
    write_count: u64,
    commit_count: u64,
    rollback_count: u64,
    read_skip_count: u64,
    process_skip_count: u64,
    write_skip_count: u64,
    filter_count: u64,
}

impl StepMetrics {
    pub fn get(&self, metric: MetricType) -> u64 {
        match metric {
            MetricType::ReadCount => self.read_count,
            MetricType::WriteCount => self.write_count,
            MetricType::CommitCount => self.commit_count,
            MetricType::RollbackCount => self.rollback_count,
            MetricType::ReadSkipCount => self.read_skip_count,
            MetricType::ProcessSkipCount => self.process_skip_count,
            MetricType::WriteSkipCount => self.write_skip_count,
            MetricType::FilterCount => self.filter_count,
        }
    }

    pub fn increment(&mut self, metric: MetricType, by: u64) {
        let slot = match metric {
            MetricType::ReadCount => &mut self.read_count,
            MetricType::WriteCount => &mut self.write_count,
            MetricType::CommitCount => &mut self.commit_count,
            MetricType::RollbackCount => &mut self.rollback_count,
            MetricType::ReadSkipCount => &mut self.read_skip_count,
            MetricType::ProcessSkipCount => &mut self.process_skip_count,
            MetricType::WriteSkipCount => &mut self.write_skip_count,
            MetricType::FilterCount => &mut self.filter_count,
        };
        *slot = slot.saturating_add(by);
    }

    /// Add every counter of `other` into `self`.
    pub fn merge(&mut self, other: &StepMetrics) {
        for metric in MetricType::ALL {
            self.increment(metric, other.get(metric));
        }
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollback_count
    }

    pub fn read_skip_count(&self) -> u64 {
        self.read_skip_count
    }

    pub fn process_skip_count(&self) -> u64 {
        self.process_skip_count
    }

    pub fn write_skip_count(&self) -> u64 {
        self.write_skip_count
    }

    pub fn filter_count(&self) -> u64 {
        self.filter_count
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// The error recorded on an execution that ended in failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&BatchError> for FailureInfo {
    fn from(err: &BatchError) -> Self {
        Self::new(err.kind.clone(), err.message.clone())
    }
}

// ---------------------------------------------------------------------------
// Step / partition state
// ---------------------------------------------------------------------------

/// Mutable run state shared by step and partition executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub metrics: StepMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn batch_status(&self) -> BatchStatus {
        self.status.batch_status
    }

    pub fn exit_status(&self) -> &str {
        self.status.exit_status()
    }

    /// Record the first failure; later failures do not replace it.
    pub fn record_failure(&mut self, failure: FailureInfo) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }
}

/// Execution record of one step within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub step_name: String,
    #[serde(flatten)]
    pub state: ExecutionState,
    #[serde(default)]
    pub partitions: Vec<PartitionExecution>,
    pub created_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn new(job_execution_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_execution_id,
            step_name: step_name.into(),
            state: ExecutionState::default(),
            partitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.state.batch_status()
    }

    pub fn exit_status(&self) -> &str {
        self.state.exit_status()
    }

    pub fn metrics(&self) -> &StepMetrics {
        &self.state.metrics
    }
}

/// Execution record of one partition of a partitioned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionExecution {
    pub id: Uuid,
    pub step_execution_id: Uuid,
    pub partition_index: u32,
    #[serde(flatten)]
    pub state: ExecutionState,
}

impl PartitionExecution {
    /// A fresh partition record seeded from the enclosing step's state.
    ///
    /// Only the restart data (checkpoints and persistent user data) is taken
    /// from `template`; status, metrics and failure start empty.
    pub fn from_template(step_execution_id: Uuid, partition_index: u32, template: &ExecutionState) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_execution_id,
            partition_index,
            state: ExecutionState {
                persistent_user_data: template.persistent_user_data.clone(),
                reader_checkpoint: template.reader_checkpoint.clone(),
                writer_checkpoint: template.writer_checkpoint.clone(),
                ..ExecutionState::default()
            },
        }
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.state.batch_status()
    }
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

/// Execution record of a job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    /// Shared by the original execution and all its restarts.
    pub instance_id: Uuid,
    pub job_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub parameters: Properties,
    /// Element to resume from on the next restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_position: Option<String>,
    /// The execution this one restarts, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_from: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn new(job_name: impl Into<String>, parameters: Properties) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            instance_id: id,
            job_name: job_name.into(),
            status: ExecutionStatus::new(BatchStatus::Starting),
            parameters,
            restart_position: None,
            restarted_from: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// A new execution of the same instance resuming `previous`.
    pub fn restart_of(previous: &JobExecution, parameters: Properties) -> Self {
        Self {
            instance_id: previous.instance_id,
            restart_position: previous.restart_position.clone(),
            restarted_from: Some(previous.id),
            ..Self::new(previous.job_name.clone(), parameters)
        }
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.status.batch_status
    }

    pub fn exit_status(&self) -> &str {
        self.status.exit_status()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
