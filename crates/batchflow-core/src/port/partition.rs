//! Partition dispatch.
//!
//! The coordinating step hands each partition to a `PartitionHandler` as a
//! `PartitionTask`. Whatever runs the partition reports back through the
//! task's `PartitionReporter`: collector payloads while it runs, then exactly
//! one terminal `PartitionExecution`.

use std::sync::Arc;

use async_trait::async_trait;
use batchflow_types::error::DispatchError;
use batchflow_types::execution::PartitionExecution;
use batchflow_types::job::Step;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message on the partition result queue.
#[derive(Debug, Clone)]
pub enum PartitionMessage {
    CollectorData { partition_index: u32, data: Value },
    Terminal(PartitionExecution),
}

/// Sending half of the partition result queue, bound to one partition.
#[derive(Debug, Clone)]
pub struct PartitionReporter {
    partition_index: u32,
    sender: mpsc::Sender<PartitionMessage>,
}

impl PartitionReporter {
    pub fn new(partition_index: u32, sender: mpsc::Sender<PartitionMessage>) -> Self {
        Self {
            partition_index,
            sender,
        }
    }

    pub fn partition_index(&self) -> u32 {
        self.partition_index
    }

    /// Queue a collector payload. Returns false once the coordinator is gone.
    pub async fn collector_data(&self, data: Value) -> bool {
        self.sender
            .send(PartitionMessage::CollectorData {
                partition_index: self.partition_index,
                data,
            })
            .await
            .is_ok()
    }

    /// Report the finished partition. Returns false once the coordinator is
    /// gone.
    pub async fn terminal(&self, execution: PartitionExecution) -> bool {
        self.sender
            .send(PartitionMessage::Terminal(execution))
            .await
            .is_ok()
    }
}

/// One partition ready to run.
pub struct PartitionTask {
    /// The step with this partition's plan properties resolved.
    pub step: Arc<Step>,
    /// The partition record, seeded with restart data.
    pub execution: PartitionExecution,
    pub reporter: PartitionReporter,
    /// Runs the partition in-process and reports through `reporter`.
    pub local_body: BoxFuture<'static, ()>,
}

impl std::fmt::Debug for PartitionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTask")
            .field("step", &self.step.id)
            .field("partition_index", &self.execution.partition_index)
            .finish_non_exhaustive()
    }
}

/// Dispatches partitions for execution.
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    async fn submit(&self, task: PartitionTask) -> Result<(), DispatchError>;
}

/// Runs every partition as a tokio task in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPartitionHandler;

#[async_trait]
impl PartitionHandler for LocalPartitionHandler {
    async fn submit(&self, task: PartitionTask) -> Result<(), DispatchError> {
        tracing::debug!(
            step = task.step.id.as_str(),
            partition = task.execution.partition_index,
            "spawning local partition"
        );
        tokio::spawn(task.local_body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
