//! Wiring of a single-process engine.
//!
//! Builds `Services` from the infrastructure in this crate: the in-memory
//! repository, local transactions, the local partition handler and an
//! `ArtifactRegistry`.

use std::path::Path;
use std::sync::Arc;

use batchflow_core::port::partition::LocalPartitionHandler;
use batchflow_core::{EventBus, JobOperator, Services};
use batchflow_types::config::EngineConfig;

use crate::artifacts::ArtifactRegistry;
use crate::config::load_engine_config;
use crate::memory::InMemoryJobRepository;
use crate::transaction::LocalTransactionManager;

/// Services for running jobs in this process with in-memory state.
pub fn local_services(config: EngineConfig, artifacts: ArtifactRegistry) -> Services<InMemoryJobRepository> {
    Services {
        repository: Arc::new(InMemoryJobRepository::new()),
        artifacts: Arc::new(artifacts),
        transactions: Arc::new(LocalTransactionManager::new(
            config.default_transaction_timeout_secs,
        )),
        partition_handler: Arc::new(LocalPartitionHandler),
        event_bus: EventBus::new(config.event_bus_capacity),
        config,
    }
}

/// A job operator over [`local_services`].
pub fn local_operator(config: EngineConfig, artifacts: ArtifactRegistry) -> JobOperator<InMemoryJobRepository> {
    JobOperator::new(local_services(config, artifacts))
}

/// A job operator configured from `{config_dir}/batchflow.toml`.
///
/// Also installs the global tracing subscriber described by the `[logging]`
/// table, unless the host has already installed one.
pub async fn local_operator_from_dir(
    config_dir: &Path,
    artifacts: ArtifactRegistry,
) -> JobOperator<InMemoryJobRepository> {
    let config = load_engine_config(config_dir).await;
    if let Err(err) = batchflow_observe::init_tracing(&config.logging) {
        tracing::debug!(error = %err, "keeping existing tracing subscriber");
    }
    tracing::info!(
        config_dir = %config_dir.display(),
        split_timeout_secs = ?config.split_timeout_secs,
        transaction_timeout_secs = config.default_transaction_timeout_secs,
        "engine configured"
    );
    local_operator(config, artifacts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use batchflow_core::port::artifact::{Artifact, Batchlet, Item, ItemReader, ItemWriter};
    use batchflow_core::port::repository::JobRepository;
    use batchflow_types::error::BatchError;
    use batchflow_types::execution::Checkpoint;
    use batchflow_types::filter::ExceptionClassFilter;
    use batchflow_types::job::{
        Chunk, Flow, JobDefinition, Partition, PartitionPlan, Properties, RefArtifact, Split, Step,
    };
    use batchflow_types::status::BatchStatus;
    use serde_json::json;

    use super::*;

    /// Reads `start..=end` from its properties; checkpoint is the count read.
    struct NumberReader {
        next: u64,
        start: u64,
        end: u64,
    }

    #[async_trait]
    impl ItemReader for NumberReader {
        async fn open(&mut self, checkpoint: Option<Checkpoint>) -> Result<(), BatchError> {
            self.next = self.start + checkpoint.and_then(|c| c.as_u64()).unwrap_or(0);
            Ok(())
        }

        async fn read_item(&mut self) -> Result<Option<Item>, BatchError> {
            if self.next > self.end {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(json!(self.next - 1)))
        }

        async fn checkpoint_info(&mut self) -> Result<Option<Checkpoint>, BatchError> {
            Ok(Some(json!(self.next - self.start)))
        }
    }

    /// Collects written items; fails once when a chunk contains `fail_on`.
    #[derive(Clone, Default)]
    struct Sink {
        items: Arc<Mutex<Vec<Item>>>,
        fail_on: Arc<Mutex<Option<Item>>>,
    }

    #[async_trait]
    impl ItemWriter for Sink {
        async fn write_items(&mut self, items: &[Item]) -> Result<(), BatchError> {
            let mut fail_on = self.fail_on.lock().unwrap();
            if fail_on.as_ref().is_some_and(|bad| items.contains(bad)) {
                *fail_on = None;
                return Err(BatchError::new("io", "sink unavailable"));
            }
            self.items.lock().unwrap().extend_from_slice(items);
            Ok(())
        }
    }

    struct Note {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Batchlet for Note {
        async fn process(&self) -> Result<Option<String>, BatchError> {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.log.lock().unwrap().push(self.name.clone());
            Ok(None)
        }
    }

    fn registry(sink: &Sink, log: &Arc<Mutex<Vec<String>>>) -> ArtifactRegistry {
        let sink = sink.clone();
        let log = Arc::clone(log);
        ArtifactRegistry::new()
            .with("numbers", |ctx| {
                let bound = |name: &str, default: u64| {
                    ctx.property(name)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(default)
                };
                Artifact::Reader(Box::new(NumberReader {
                    next: 0,
                    start: bound("start", 1),
                    end: bound("end", 30),
                }))
            })
            .with("sink", move |_| Artifact::Writer(Box::new(sink.clone())))
            .with("note", move |ctx| {
                Artifact::Batchlet(Box::new(Note {
                    name: ctx.step_name.clone().unwrap_or_default(),
                    log: Arc::clone(&log),
                }))
            })
    }

    fn numbers_chunk() -> Chunk {
        Chunk::new(RefArtifact::new("numbers"), RefArtifact::new("sink")).with_item_count(10)
    }

    #[tokio::test]
    async fn single_chunk_step_commits_every_ten_items() {
        let sink = Sink::default();
        let operator = local_operator(EngineConfig::default(), registry(&sink, &Arc::default()));
        let job = JobDefinition::new("numbers").with_element(Step::new("load").with_chunk(numbers_chunk()));

        let finished = operator.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);

        let steps = operator.repository().step_executions(finished.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        let metrics = steps[0].metrics();
        assert_eq!(metrics.read_count(), 30);
        assert_eq!(metrics.write_count(), 30);
        assert_eq!(metrics.commit_count(), 3);
        assert_eq!(sink.items.lock().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn no_rollback_write_retry_keeps_the_chunk() {
        let sink = Sink::default();
        *sink.fail_on.lock().unwrap() = Some(json!(29));
        let operator = local_operator(EngineConfig::default(), registry(&sink, &Arc::default()));
        let chunk = numbers_chunk()
            .with_retryable(ExceptionClassFilter::new().include("io"))
            .with_no_rollback(ExceptionClassFilter::new().include("io"));
        let job = JobDefinition::new("numbers").with_element(Step::new("load").with_chunk(chunk));

        let finished = operator.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);

        let steps = operator.repository().step_executions(finished.id).await.unwrap();
        let metrics = steps[0].metrics();
        assert_eq!(metrics.rollback_count(), 0);
        assert_eq!(metrics.write_count(), 30);
        assert_eq!(sink.items.lock().unwrap().len(), 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_then_step_runs_three_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let operator = local_operator(EngineConfig::default(), registry(&Sink::default(), &log));
        let note = |id: &str| Step::new(id).with_batchlet(RefArtifact::new("note"));
        let job = JobDefinition::new("fan-out")
            .with_element(
                Split::new("split")
                    .with_flow(Flow::new("left").with_element(note("left-step")))
                    .with_flow(Flow::new("right").with_element(note("right-step")))
                    .with_next("last"),
            )
            .with_element(note("last"));

        let finished = operator.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);

        let steps = operator.repository().step_executions(finished.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        let last = steps.iter().find(|s| s.step_name == "last").unwrap();
        for flow_step in steps.iter().filter(|s| s.step_name != "last") {
            assert!(flow_step.state.ended_at <= last.state.started_at);
        }
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("last"));
    }

    #[tokio::test]
    async fn partitioned_step_resolves_plan_properties() {
        let sink = Sink::default();
        let operator = local_operator(EngineConfig::default(), registry(&sink, &Arc::default()));
        let reader = RefArtifact::new("numbers")
            .with_property("start", "#{partitionPlan['start']}")
            .with_property("end", "#{partitionPlan['end']}");
        let plan = PartitionPlan::new(2).with_properties(vec![
            [("start", "1"), ("end", "15")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            [("start", "16"), ("end", "30")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ]);
        let step = Step::new("load")
            .with_chunk(Chunk::new(reader, RefArtifact::new("sink")).with_item_count(10))
            .with_partition(Partition::with_plan(plan));
        let job = JobDefinition::new("numbers").with_element(step);

        let finished = operator.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);

        let steps = operator.repository().step_executions(finished.id).await.unwrap();
        assert_eq!(steps[0].metrics().read_count(), 30);
        assert_eq!(steps[0].metrics().commit_count(), 4);
        let partitions = operator.repository().partition_executions(steps[0].id).await.unwrap();
        assert_eq!(partitions.len(), 2);

        let mut items: Vec<u64> = sink.items.lock().unwrap().iter().filter_map(|v| v.as_u64()).collect();
        items.sort_unstable();
        assert_eq!(items, (1..=30).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn operator_from_dir_applies_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("batchflow.toml"), "job_wait_timeout_secs = 30\n")
            .await
            .unwrap();
        let operator = local_operator_from_dir(tmp.path(), ArtifactRegistry::new()).await;

        let job = JobDefinition::new("empty");
        let finished = operator.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);

        // The subscriber is global, so a second operator keeps the first one.
        let again = local_operator_from_dir(tmp.path(), ArtifactRegistry::new()).await;
        let finished = again.run(&job, Properties::new()).await.unwrap();
        assert_eq!(finished.batch_status(), BatchStatus::Completed);
    }
}
