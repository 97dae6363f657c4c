//! Partitioned step coordination.
//!
//! The coordinator resolves the partition plan, submits one task per
//! partition to the `PartitionHandler` and drains the partition queue inside
//! a transaction until every partition has reported its terminal execution.
//! Collector payloads are handed to the analyzer as they arrive. The step's
//! status is the consolidation of the partition statuses.

use std::sync::Arc;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{ExecutionState, PartitionExecution, StepExecution};
use batchflow_types::job::{Partition, PartitionPlan, RefArtifact, Step};
use batchflow_types::status::BatchStatus;
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};

use crate::error::RunnerError;
use crate::port::artifact::{
    Artifact, PartitionAnalyzer, PartitionMapper, PartitionReducer, PartitionStatus, StepHandle,
    create_analyzer, create_collector, create_mapper, create_reducer,
};
use crate::port::partition::{PartitionMessage, PartitionReporter, PartitionTask};
use crate::port::repository::{CheckpointTarget, JobRepository};
use crate::port::transaction::UserTransaction;

use super::batchlet::run_batchlet;
use super::chunk::run_chunk;
use super::listeners::ListenerRegistry;
use super::properties::PropertyResolver;
use super::{JobRuntime, PartitionLink, StepScope, fail_state};

/// Run `step` as a partitioned step, recording the consolidated outcome on
/// `execution`.
pub(crate) async fn run_partitioned<R: JobRepository + 'static>(
    rt: &Arc<JobRuntime<R>>,
    step: &Step,
    partition: &Partition,
    execution: &mut StepExecution,
    restart_from: Option<&StepExecution>,
    handle: &StepHandle,
) {
    let coordinator = match PartitionCoordinator::create(rt, step, partition, handle) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            tracing::error!(step = step.id.as_str(), error = %err, "failed to set up partitions");
            fail_state(&mut execution.state, &err);
            return;
        }
    };
    coordinator.run(execution, restart_from).await;
}

/// Step status for a set of partition outcomes: FAILED if any failed, else
/// STOPPED if any stopped, else COMPLETED.
pub(crate) fn consolidate(statuses: impl IntoIterator<Item = BatchStatus>) -> BatchStatus {
    statuses
        .into_iter()
        .fold(BatchStatus::Completed, |acc, status| match (acc, status) {
            (BatchStatus::Failed, _) | (_, BatchStatus::Failed) => BatchStatus::Failed,
            (BatchStatus::Stopped, _) | (_, BatchStatus::Stopped) => BatchStatus::Stopped,
            _ => acc,
        })
}

struct PartitionCoordinator<'a, R: JobRepository> {
    rt: &'a Arc<JobRuntime<R>>,
    step: &'a Step,
    partition: &'a Partition,
    mapper: Option<Box<dyn PartitionMapper>>,
    reducer: Option<Box<dyn PartitionReducer>>,
    analyzer: Option<Box<dyn PartitionAnalyzer>>,
    tx: Box<dyn UserTransaction>,
    reducer_rolled_back: bool,
}

impl<'a, R: JobRepository + 'static> PartitionCoordinator<'a, R> {
    fn create(
        rt: &'a Arc<JobRuntime<R>>,
        step: &'a Step,
        partition: &'a Partition,
        handle: &StepHandle,
    ) -> Result<Self, RunnerError> {
        let factory = rt.artifacts();
        let ctx = |artifact: &RefArtifact| rt.artifact_context(artifact, Some(step), None, Some(handle));

        let mapper = match &partition.mapper {
            Some(a) => Some(create_mapper(factory, a, &ctx(a))?),
            None => None,
        };
        let reducer = match &partition.reducer {
            Some(a) => Some(create_reducer(factory, a, &ctx(a))?),
            None => None,
        };
        let analyzer = match &partition.analyzer {
            Some(a) => Some(create_analyzer(factory, a, &ctx(a))?),
            None => None,
        };

        Ok(Self {
            rt,
            step,
            partition,
            mapper,
            reducer,
            analyzer,
            tx: rt.services.transactions.transaction(),
            reducer_rolled_back: false,
        })
    }

    async fn run(mut self, execution: &mut StepExecution, restart_from: Option<&StepExecution>) {
        if let Err(err) = self.coordinate(execution, restart_from).await {
            tracing::error!(
                job_execution_id = %self.rt.job_execution_id,
                step = self.step.id.as_str(),
                error = %err,
                "partitioned step failed"
            );
            fail_state(&mut execution.state, &err);
            self.rollback_reducer().await;
            if self.tx.status().is_in_flight() {
                if let Err(err) = self.tx.rollback().await {
                    tracing::warn!(step = self.step.id.as_str(), error = %err, "partition rollback failed");
                }
            }
            self.after_completion(PartitionStatus::Rollback).await;
        }

        let factory = self.rt.artifacts();
        if let Some(mapper) = self.mapper.take() {
            factory.destroy(Artifact::Mapper(mapper));
        }
        if let Some(reducer) = self.reducer.take() {
            factory.destroy(Artifact::Reducer(reducer));
        }
        if let Some(analyzer) = self.analyzer.take() {
            factory.destroy(Artifact::Analyzer(analyzer));
        }
    }

    async fn coordinate(
        &mut self,
        execution: &mut StepExecution,
        restart_from: Option<&StepExecution>,
    ) -> Result<(), RunnerError> {
        if let Some(reducer) = self.reducer.as_mut() {
            reducer.begin_partitioned_step().await?;
        }

        let plan = self.plan().await?;
        let seeds = self.seed_partitions(execution, &plan, restart_from).await?;

        let (sender, mut receiver) = mpsc::channel((3 * seeds.len()).max(1));
        let threads = Arc::new(Semaphore::new(plan.effective_threads() as usize));
        let expected = seeds.len();

        tracing::info!(
            step = self.step.id.as_str(),
            partitions = expected,
            threads = plan.effective_threads(),
            "starting partitions"
        );

        for seed in seeds {
            let overlay = plan
                .properties
                .get(seed.partition_index as usize)
                .cloned()
                .unwrap_or_default();
            let partition_step = Arc::new(
                PropertyResolver::new(self.rt.parameters.clone())
                    .with_partition_plan(overlay)
                    .resolve_step(self.step),
            );

            self.rt.repository().add_partition_execution(&seed).await?;
            let reporter = PartitionReporter::new(seed.partition_index, sender.clone());
            let body = run_partition(
                Arc::clone(self.rt),
                Arc::clone(&partition_step),
                seed.clone(),
                reporter.clone(),
                Arc::clone(&threads),
            );
            let task = PartitionTask {
                step: partition_step,
                execution: seed,
                reporter,
                local_body: Box::pin(body),
            };
            self.rt
                .services
                .partition_handler
                .submit(task)
                .await?;
        }
        drop(sender);

        self.tx.begin().await?;
        let mut remaining = expected;
        while remaining > 0 {
            let Some(message) = receiver.recv().await else {
                return Err(RunnerError::Partition(format!(
                    "partition queue closed with {remaining} partitions outstanding"
                )));
            };
            match message {
                PartitionMessage::CollectorData { data, .. } => {
                    if let Some(analyzer) = self.analyzer.as_mut() {
                        analyzer.analyze_collector_data(data).await?;
                    }
                }
                PartitionMessage::Terminal(partition_execution) => {
                    remaining -= 1;
                    self.record_terminal(execution, partition_execution).await?;
                }
            }
        }

        let outcome = consolidate(execution.partitions.iter().map(PartitionExecution::batch_status));
        if matches!(outcome, BatchStatus::Failed | BatchStatus::Stopped) {
            self.tx.rollback().await?;
            self.rollback_reducer().await;
            self.after_completion(PartitionStatus::Rollback).await;
            execution.state.status.advance(outcome);
        } else {
            if let Some(reducer) = self.reducer.as_mut() {
                reducer.before_partitioned_step_completion().await?;
            }
            self.tx.commit().await?;
            self.after_completion(PartitionStatus::Commit).await;
        }
        Ok(())
    }

    async fn plan(&mut self) -> Result<PartitionPlan, RunnerError> {
        if let Some(mapper) = self.mapper.as_mut() {
            return Ok(mapper.map_partitions().await?);
        }
        self.partition.plan.clone().ok_or_else(|| {
            RunnerError::Partition(format!(
                "step '{}' has neither a partition plan nor a mapper",
                self.step.id
            ))
        })
    }

    /// Partition records to run. On restart without a partition override the
    /// partitions that did not complete are run again from their own restart
    /// data.
    async fn seed_partitions(
        &mut self,
        execution: &StepExecution,
        plan: &PartitionPlan,
        restart_from: Option<&StepExecution>,
    ) -> Result<Vec<PartitionExecution>, RunnerError> {
        if let Some(previous) = restart_from {
            if plan.partitions_override {
                self.rollback_reducer().await;
            } else {
                let earlier = self.rt.repository().partition_executions(previous.id).await?;
                if !earlier.is_empty() {
                    return Ok(earlier
                        .iter()
                        .filter(|p| p.batch_status() != BatchStatus::Completed)
                        .map(|p| PartitionExecution::from_template(execution.id, p.partition_index, &p.state))
                        .collect());
                }
            }
        }

        let fresh = ExecutionState::default();
        Ok((0..plan.partitions)
            .map(|index| PartitionExecution::from_template(execution.id, index, &fresh))
            .collect())
    }

    async fn record_terminal(
        &mut self,
        execution: &mut StepExecution,
        partition: PartitionExecution,
    ) -> Result<(), RunnerError> {
        tracing::debug!(
            step = self.step.id.as_str(),
            partition = partition.partition_index,
            batch_status = %partition.batch_status(),
            "partition finished"
        );
        if self.step.chunk.is_some() {
            execution.state.metrics.merge(&partition.state.metrics);
        }
        self.rt.repository().update_partition_execution(&partition).await?;

        if partition.batch_status() == BatchStatus::Failed {
            if let Some(failure) = &partition.state.failure {
                execution.state.record_failure(failure.clone());
            }
        }
        if let Some(analyzer) = self.analyzer.as_mut() {
            analyzer
                .analyze_status(partition.batch_status(), partition.state.exit_status())
                .await?;
        }
        execution.partitions.push(partition);
        Ok(())
    }

    async fn rollback_reducer(&mut self) {
        if self.reducer_rolled_back {
            return;
        }
        if let Some(reducer) = self.reducer.as_mut() {
            self.reducer_rolled_back = true;
            if let Err(err) = reducer.rollback_partitioned_step().await {
                tracing::warn!(step = self.step.id.as_str(), error = %err, "reducer rollback failed");
            }
        }
    }

    async fn after_completion(&mut self, status: PartitionStatus) {
        if let Some(reducer) = self.reducer.as_mut() {
            if let Err(err) = reducer.after_partitioned_step_completion(status).await {
                tracing::warn!(step = self.step.id.as_str(), error = %err, "reducer completion callback failed");
            }
        }
    }
}

/// Body of one partition. Always ends by reporting a terminal execution.
async fn run_partition<R: JobRepository + 'static>(
    rt: Arc<JobRuntime<R>>,
    step: Arc<Step>,
    mut execution: PartitionExecution,
    reporter: PartitionReporter,
    threads: Arc<Semaphore>,
) {
    let _permit = threads.acquire_owned().await.ok();
    let index = execution.partition_index;

    execution.state.status.advance(BatchStatus::Started);
    execution.state.started_at = Some(Utc::now());
    let handle = StepHandle::new(execution.state.persistent_user_data.clone());

    if let Err(err) = execute_partition(&rt, &step, &mut execution, &reporter, &handle).await {
        tracing::error!(step = step.id.as_str(), partition = index, error = %err, "partition failed");
        fail_state(&mut execution.state, &err);
    }

    match execution.batch_status() {
        BatchStatus::Started => {
            execution.state.status.advance(BatchStatus::Completed);
        }
        BatchStatus::Stopping => {
            execution.state.status.advance(BatchStatus::Stopped);
        }
        _ => {}
    }
    if let Some(data) = handle.persistent_user_data() {
        execution.state.persistent_user_data = Some(data);
    }
    if let Some(exit_status) = handle.exit_status() {
        execution.state.status.set_exit_status(exit_status);
    }
    execution.state.ended_at = Some(Utc::now());

    rt.publish(BatchEvent::PartitionFinished {
        step_execution_id: execution.step_execution_id,
        partition_index: index,
        batch_status: execution.batch_status(),
    });
    if !reporter.terminal(execution).await {
        tracing::warn!(step = step.id.as_str(), partition = index, "coordinator gone before partition reported");
    }
}

async fn execute_partition<R: JobRepository>(
    rt: &JobRuntime<R>,
    step: &Step,
    execution: &mut PartitionExecution,
    reporter: &PartitionReporter,
    handle: &StepHandle,
) -> Result<(), RunnerError> {
    let index = Some(execution.partition_index);
    let listeners = ListenerRegistry::create(
        rt.artifacts(),
        &step.listeners,
        &rt.base_context(Some(step), index, Some(handle)),
    )?;
    let collector = match step.partition.as_ref().and_then(|p| p.collector.as_ref()) {
        Some(artifact) => match create_collector(
            rt.artifacts(),
            artifact,
            &rt.artifact_context(artifact, Some(step), index, Some(handle)),
        ) {
            Ok(collector) => Some(collector),
            Err(err) => {
                listeners.destroy(rt.artifacts());
                return Err(err.into());
            }
        },
        None => None,
    };

    let mut scope = StepScope {
        rt,
        step,
        target: CheckpointTarget::Partition {
            step_execution_id: execution.step_execution_id,
            partition_execution_id: execution.id,
        },
        handle: handle.clone(),
        listeners: &listeners,
        partition: Some(PartitionLink {
            reporter: reporter.clone(),
            collector,
        }),
    };
    if let Some(chunk) = &step.chunk {
        run_chunk(&mut scope, chunk, &mut execution.state).await;
    } else if let Some(batchlet) = &step.batchlet {
        run_batchlet(&mut scope, batchlet, &mut execution.state).await;
    }

    if let Some(collector) = scope.partition.and_then(|link| link.collector) {
        rt.artifacts().destroy(Artifact::Collector(collector));
    }
    listeners.destroy(rt.artifacts());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
