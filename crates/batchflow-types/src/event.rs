//! Lifecycle events published by the engine.
//!
//! `BatchEvent` is broadcast on the event bus in batchflow-core. Subscribers
//! (progress displays, audit logs, tests) observe the engine without being
//! wired into the runners.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::BatchStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    JobStarted {
        job_execution_id: Uuid,
        job_name: String,
        restart: bool,
    },
    JobFinished {
        job_execution_id: Uuid,
        job_name: String,
        batch_status: BatchStatus,
        exit_status: String,
    },
    StepStarted {
        job_execution_id: Uuid,
        step_execution_id: Uuid,
        step_name: String,
    },
    StepFinished {
        job_execution_id: Uuid,
        step_execution_id: Uuid,
        step_name: String,
        batch_status: BatchStatus,
        exit_status: String,
    },
    ChunkCommitted {
        step_execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition_index: Option<u32>,
        items_written: u64,
    },
    ChunkRolledBack {
        step_execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition_index: Option<u32>,
    },
    PartitionFinished {
        step_execution_id: Uuid,
        partition_index: u32,
        batch_status: BatchStatus,
    },
    StopRequested {
        job_execution_id: Uuid,
    },
}

impl BatchEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::JobFinished { .. } => "job_finished",
            Self::StepStarted { .. } => "step_started",
            Self::StepFinished { .. } => "step_finished",
            Self::ChunkCommitted { .. } => "chunk_committed",
            Self::ChunkRolledBack { .. } => "chunk_rolled_back",
            Self::PartitionFinished { .. } => "partition_finished",
            Self::StopRequested { .. } => "stop_requested",
        }
    }
}
