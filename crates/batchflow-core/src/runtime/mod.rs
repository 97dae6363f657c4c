//! Job graph runtime.
//!
//! One `JobRuntime` is built per job execution and shared (behind `Arc`) by
//! every runner of that execution: the job runner, composite runners, step
//! runners and partition bodies.

pub mod batchlet;
pub mod chunk;
pub mod composite;
pub mod context;
pub mod decision;
pub mod flow;
pub mod job;
pub mod listeners;
pub mod partition;
pub mod properties;
pub mod split;
pub mod step;
pub mod stop;
pub mod transition;

use std::sync::{Arc, Mutex, PoisonError};

use batchflow_types::config::EngineConfig;
use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{ExecutionState, FailureInfo, JobExecution, StepExecution};
use batchflow_types::job::{JobDefinition, Properties, RefArtifact, Step};
use batchflow_types::status::BatchStatus;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::event::EventBus;
use crate::port::artifact::{ArtifactContext, ArtifactFactory, PartitionCollector, StepHandle};
use crate::port::partition::{PartitionHandler, PartitionReporter};
use crate::port::repository::{CheckpointTarget, JobRepository};
use crate::port::transaction::TransactionManager;

use self::context::ElementContext;
use self::listeners::ListenerRegistry;
use self::properties::PropertyResolver;
use self::stop::StopSignal;

/// Step property overriding the chunk transaction timeout, in seconds.
pub const TRANSACTION_TIMEOUT_PROPERTY: &str = "batchflow.transaction.timeout";

/// Collaborators shared by every execution started through one operator.
pub struct Services<R: JobRepository> {
    pub repository: Arc<R>,
    pub artifacts: Arc<dyn ArtifactFactory>,
    pub transactions: Arc<dyn TransactionManager>,
    pub partition_handler: Arc<dyn PartitionHandler>,
    pub event_bus: EventBus,
    pub config: EngineConfig,
}

impl<R: JobRepository> Clone for Services<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            artifacts: Arc::clone(&self.artifacts),
            transactions: Arc::clone(&self.transactions),
            partition_handler: Arc::clone(&self.partition_handler),
            event_bus: self.event_bus.clone(),
            config: self.config.clone(),
        }
    }
}

/// What a job element hands to the composite walking it.
#[derive(Debug, Default)]
pub struct ElementOutcome {
    /// Id of the next element, if any.
    pub next: Option<String>,
    /// Step executions a following decision should see.
    pub preceding: Vec<StepExecution>,
    /// Final status of a composite's own context. Set by flows so a split
    /// can judge each of them after siblings shared its enclosing contexts.
    pub batch_status: Option<BatchStatus>,
}

/// State of one job execution, shared by all of its runners.
pub struct JobRuntime<R: JobRepository> {
    pub services: Services<R>,
    /// The definition with job-level property references resolved.
    pub job: Arc<JobDefinition>,
    pub job_ctx: Arc<ElementContext>,
    pub stop: StopSignal,
    pub job_execution_id: Uuid,
    pub instance_id: Uuid,
    pub parameters: Properties,
    pub is_restart: bool,
    execution: Mutex<JobExecution>,
    executed_steps: Mutex<Vec<String>>,
    deferred_steps: Mutex<Vec<StepExecution>>,
}

impl<R: JobRepository> JobRuntime<R> {
    pub fn new(services: Services<R>, job: &JobDefinition, execution: JobExecution) -> Arc<Self> {
        let resolved = PropertyResolver::new(execution.parameters.clone()).resolve_job(job);
        let job_ctx = ElementContext::job(job.id.clone());
        let stop = StopSignal::new();
        stop.register(job_ctx.clone());

        Arc::new(Self {
            services,
            job: Arc::new(resolved),
            job_ctx,
            stop,
            job_execution_id: execution.id,
            instance_id: execution.instance_id,
            parameters: execution.parameters.clone(),
            is_restart: execution.restarted_from.is_some(),
            execution: Mutex::new(execution),
            executed_steps: Mutex::new(Vec::new()),
            deferred_steps: Mutex::new(Vec::new()),
        })
    }

    pub fn repository(&self) -> &R {
        &self.services.repository
    }

    pub fn artifacts(&self) -> &dyn ArtifactFactory {
        self.services.artifacts.as_ref()
    }

    pub fn publish(&self, event: BatchEvent) {
        self.services.event_bus.publish(event);
    }

    /// Snapshot of the job execution record.
    pub fn execution(&self) -> JobExecution {
        self.execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_execution(&self, update: impl FnOnce(&mut JobExecution)) -> JobExecution {
        let mut execution = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut execution);
        execution.clone()
    }

    /// Record the first failure of the job.
    pub fn record_job_failure(&self, failure: FailureInfo) {
        self.update_execution(|execution| {
            if execution.failure.is_none() {
                execution.failure = Some(failure);
            }
        });
    }

    pub fn was_executed(&self, step_id: &str) -> bool {
        self.executed_steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s == step_id)
    }

    pub fn mark_executed(&self, step_id: &str) {
        self.executed_steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step_id.to_string());
    }

    /// Queue a step execution the job runner persists when it finishes.
    pub fn defer_step_execution(&self, execution: StepExecution) {
        self.deferred_steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(execution);
    }

    pub fn take_deferred_step_executions(&self) -> Vec<StepExecution> {
        std::mem::take(&mut *self.deferred_steps.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Chunk transaction timeout for `step`.
    pub fn transaction_timeout(&self, step: &Step) -> u64 {
        step.properties
            .get(TRANSACTION_TIMEOUT_PROPERTY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.services.config.default_transaction_timeout_secs)
    }

    /// Context for artifacts of `step` (or of the job when `None`), without
    /// artifact properties.
    pub fn base_context(
        &self,
        step: Option<&Step>,
        partition_index: Option<u32>,
        handle: Option<&StepHandle>,
    ) -> ArtifactContext {
        ArtifactContext {
            job_name: self.job.id.clone(),
            job_execution_id: self.job_execution_id,
            step_name: step.map(|s| s.id.clone()),
            partition_index,
            properties: Properties::new(),
            step_properties: step.map(|s| s.properties.clone()).unwrap_or_default(),
            step: handle.cloned(),
        }
    }

    pub fn artifact_context(
        &self,
        artifact: &RefArtifact,
        step: Option<&Step>,
        partition_index: Option<u32>,
        handle: Option<&StepHandle>,
    ) -> ArtifactContext {
        ArtifactContext {
            properties: artifact.properties.clone(),
            ..self.base_context(step, partition_index, handle)
        }
    }
}

// ---------------------------------------------------------------------------
// Step scope
// ---------------------------------------------------------------------------

/// Connection of a running partition back to its coordinating step.
pub(crate) struct PartitionLink {
    pub reporter: PartitionReporter,
    pub collector: Option<Box<dyn PartitionCollector>>,
}

impl PartitionLink {
    /// Collect a payload and queue it for the analyzer.
    pub async fn send_collector_data(&mut self) -> Result<(), RunnerError> {
        let Some(collector) = self.collector.as_mut() else {
            return Ok(());
        };
        let data = collector.collect_partition_data().await?;
        if self.reporter.collector_data(data).await {
            Ok(())
        } else {
            Err(RunnerError::Partition(
                "partition queue closed before collector data was sent".to_string(),
            ))
        }
    }
}

/// Everything a chunk or batchlet body needs from the step running it.
pub(crate) struct StepScope<'a, R: JobRepository> {
    pub rt: &'a JobRuntime<R>,
    pub step: &'a Step,
    pub target: CheckpointTarget,
    pub handle: StepHandle,
    pub listeners: &'a ListenerRegistry,
    pub partition: Option<PartitionLink>,
}

impl<R: JobRepository> StepScope<'_, R> {
    pub fn partition_index(&self) -> Option<u32> {
        self.partition.as_ref().map(|p| p.reporter.partition_index())
    }

    pub fn artifact_context(&self, artifact: &RefArtifact) -> ArtifactContext {
        self.rt.artifact_context(
            artifact,
            Some(self.step),
            self.partition_index(),
            Some(&self.handle),
        )
    }

    pub async fn send_collector_data(&mut self) -> Result<(), RunnerError> {
        match self.partition.as_mut() {
            Some(link) => link.send_collector_data().await,
            None => Ok(()),
        }
    }
}

/// Mark `state` FAILED and record `error` as its failure.
pub(crate) fn fail_state(state: &mut ExecutionState, error: &RunnerError) {
    state.record_failure(error.failure_info());
    state.status.advance(BatchStatus::Failed);
}
