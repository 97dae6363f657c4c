//! Batch artifact traits and the factory that resolves them by name.
//!
//! Artifacts are user code plugged into the engine: readers, processors,
//! writers, batchlets, deciders, partition plugins and checkpoint algorithms.
//! They are resolved at run time from a `RefArtifact` name, so these traits
//! use `async_trait` to stay object-safe behind `Box<dyn ...>`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use batchflow_types::error::{ArtifactError, BatchError};
use batchflow_types::execution::{Checkpoint, StepExecution};
use batchflow_types::job::{PartitionPlan, Properties, RefArtifact};
use batchflow_types::status::BatchStatus;
use serde_json::Value;
use uuid::Uuid;

use super::listener::ListenerArtifact;

/// One unit of chunk data.
pub type Item = Value;

// ---------------------------------------------------------------------------
// Chunk artifacts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ItemReader: Send {
    /// Open the reader, resuming at `checkpoint` when restarting.
    async fn open(&mut self, _checkpoint: Option<Checkpoint>) -> Result<(), BatchError> {
        Ok(())
    }

    /// Next item, or `None` when the input is exhausted.
    async fn read_item(&mut self) -> Result<Option<Item>, BatchError>;

    /// Current position, persisted at each checkpoint.
    async fn checkpoint_info(&mut self) -> Result<Option<Checkpoint>, BatchError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemProcessor: Send {
    /// Transform an item. Returning `None` filters it out of the chunk.
    async fn process_item(&mut self, item: &Item) -> Result<Option<Item>, BatchError>;
}

#[async_trait]
pub trait ItemWriter: Send {
    async fn open(&mut self, _checkpoint: Option<Checkpoint>) -> Result<(), BatchError> {
        Ok(())
    }

    async fn write_items(&mut self, items: &[Item]) -> Result<(), BatchError>;

    async fn checkpoint_info(&mut self) -> Result<Option<Checkpoint>, BatchError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Decides chunk boundaries for steps with a custom checkpoint policy.
#[async_trait]
pub trait CheckpointAlgorithm: Send {
    /// Transaction timeout for the next chunk. 0 keeps the default.
    async fn checkpoint_timeout(&mut self) -> Result<u64, BatchError> {
        Ok(0)
    }

    async fn begin_checkpoint(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn is_ready_to_checkpoint(&mut self) -> Result<bool, BatchError>;

    async fn end_checkpoint(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task-oriented and routing artifacts
// ---------------------------------------------------------------------------

/// A task-oriented step body.
///
/// `stop` may be called from another task while `process` is running, so
/// both take `&self`.
#[async_trait]
pub trait Batchlet: Send + Sync {
    /// Run the task. A returned string becomes the step's exit status.
    async fn process(&self) -> Result<Option<String>, BatchError>;

    async fn stop(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait Decider: Send {
    /// Choose an exit status from the executions that ran just before the
    /// decision.
    async fn decide(&mut self, executions: &[StepExecution]) -> Result<String, BatchError>;
}

// ---------------------------------------------------------------------------
// Partition artifacts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PartitionMapper: Send {
    async fn map_partitions(&mut self) -> Result<PartitionPlan, BatchError>;
}

/// Outcome passed to `PartitionReducer::after_partitioned_step_completion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Commit,
    Rollback,
}

#[async_trait]
pub trait PartitionReducer: Send {
    async fn begin_partitioned_step(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn before_partitioned_step_completion(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn rollback_partitioned_step(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_partitioned_step_completion(
        &mut self,
        _status: PartitionStatus,
    ) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Runs inside a partition and produces data for the analyzer.
#[async_trait]
pub trait PartitionCollector: Send {
    async fn collect_partition_data(&mut self) -> Result<Value, BatchError>;
}

/// Runs on the coordinating task and sees collector data and partition
/// outcomes in arrival order.
#[async_trait]
pub trait PartitionAnalyzer: Send {
    async fn analyze_collector_data(&mut self, _data: Value) -> Result<(), BatchError> {
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        _batch_status: BatchStatus,
        _exit_status: &str,
    ) -> Result<(), BatchError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Artifact context
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StepSlots {
    persistent_user_data: Option<Value>,
    exit_status: Option<String>,
}

/// Step-scoped data shared between the runner and the artifacts of one step
/// (or one partition).
///
/// Artifacts use it to stash persistent user data, which is saved with every
/// checkpoint, and to set the step's exit status.
#[derive(Debug, Clone, Default)]
pub struct StepHandle {
    slots: Arc<Mutex<StepSlots>>,
}

impl StepHandle {
    pub fn new(persistent_user_data: Option<Value>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(StepSlots {
                persistent_user_data,
                exit_status: None,
            })),
        }
    }

    pub fn persistent_user_data(&self) -> Option<Value> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .persistent_user_data
            .clone()
    }

    pub fn set_persistent_user_data(&self, data: Value) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .persistent_user_data = Some(data);
    }

    /// The exit status last set through this handle.
    pub fn exit_status(&self) -> Option<String> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exit_status
            .clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exit_status = Some(exit_status.into());
    }
}

/// Everything an artifact factory knows about where an artifact will run.
#[derive(Debug, Clone)]
pub struct ArtifactContext {
    pub job_name: String,
    pub job_execution_id: Uuid,
    pub step_name: Option<String>,
    pub partition_index: Option<u32>,
    /// Resolved properties of the artifact reference.
    pub properties: Properties,
    /// Resolved properties of the enclosing step.
    pub step_properties: Properties,
    /// Present for step-scoped artifacts.
    pub step: Option<StepHandle>,
}

impl ArtifactContext {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Artifact factory
// ---------------------------------------------------------------------------

/// An instantiated artifact.
pub enum Artifact {
    Reader(Box<dyn ItemReader>),
    Processor(Box<dyn ItemProcessor>),
    Writer(Box<dyn ItemWriter>),
    CheckpointAlgorithm(Box<dyn CheckpointAlgorithm>),
    Batchlet(Box<dyn Batchlet>),
    Decider(Box<dyn Decider>),
    Mapper(Box<dyn PartitionMapper>),
    Reducer(Box<dyn PartitionReducer>),
    Collector(Box<dyn PartitionCollector>),
    Analyzer(Box<dyn PartitionAnalyzer>),
    Listener(ListenerArtifact),
}

impl Artifact {
    /// Human-readable kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reader(_) => "item reader",
            Self::Processor(_) => "item processor",
            Self::Writer(_) => "item writer",
            Self::CheckpointAlgorithm(_) => "checkpoint algorithm",
            Self::Batchlet(_) => "batchlet",
            Self::Decider(_) => "decider",
            Self::Mapper(_) => "partition mapper",
            Self::Reducer(_) => "partition reducer",
            Self::Collector(_) => "partition collector",
            Self::Analyzer(_) => "partition analyzer",
            Self::Listener(_) => "listener",
        }
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Artifact").field(&self.kind()).finish()
    }
}

/// Resolves artifact names to instances.
///
/// Implementations live in batchflow-infra (e.g., ArtifactRegistry).
pub trait ArtifactFactory: Send + Sync {
    fn create(&self, artifact: &RefArtifact, ctx: &ArtifactContext) -> Result<Artifact, ArtifactError>;

    /// Release an instance created by `create`.
    fn destroy(&self, artifact: Artifact) {
        drop(artifact);
    }
}

macro_rules! typed_create {
    ($fn_name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $fn_name(
            factory: &dyn ArtifactFactory,
            artifact: &RefArtifact,
            ctx: &ArtifactContext,
        ) -> Result<$ty, ArtifactError> {
            match factory.create(artifact, ctx)? {
                Artifact::$variant(instance) => Ok(instance),
                other => {
                    factory.destroy(other);
                    Err(ArtifactError::WrongKind {
                        name: artifact.name.clone(),
                        expected: $expected,
                    })
                }
            }
        }
    };
}

typed_create!(create_reader, Reader, Box<dyn ItemReader>, "item reader");
typed_create!(create_processor, Processor, Box<dyn ItemProcessor>, "item processor");
typed_create!(create_writer, Writer, Box<dyn ItemWriter>, "item writer");
typed_create!(
    create_checkpoint_algorithm,
    CheckpointAlgorithm,
    Box<dyn CheckpointAlgorithm>,
    "checkpoint algorithm"
);
typed_create!(create_batchlet, Batchlet, Box<dyn Batchlet>, "batchlet");
typed_create!(create_decider, Decider, Box<dyn Decider>, "decider");
typed_create!(create_mapper, Mapper, Box<dyn PartitionMapper>, "partition mapper");
typed_create!(create_reducer, Reducer, Box<dyn PartitionReducer>, "partition reducer");
typed_create!(create_collector, Collector, Box<dyn PartitionCollector>, "partition collector");
typed_create!(create_analyzer, Analyzer, Box<dyn PartitionAnalyzer>, "partition analyzer");
typed_create!(create_listener, Listener, ListenerArtifact, "listener");

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
