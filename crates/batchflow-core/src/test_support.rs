//! In-memory fakes shared by the runtime tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use batchflow_types::config::EngineConfig;
use batchflow_types::error::{ArtifactError, BatchError, RepositoryError, TransactionError};
use batchflow_types::execution::{
    Checkpoint, ExecutionState, JobExecution, PartitionExecution, StepExecution,
};
use batchflow_types::job::{Chunk, JobDefinition, PartitionPlan, Properties, RefArtifact, Step};
use batchflow_types::status::BatchStatus;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::event::EventBus;
use crate::port::artifact::{
    Artifact, ArtifactContext, ArtifactFactory, Batchlet, CheckpointAlgorithm, Decider, Item,
    ItemProcessor, ItemReader, ItemWriter, PartitionAnalyzer, PartitionCollector, PartitionMapper,
    PartitionReducer, PartitionStatus,
};
use crate::port::listener::{ChunkListener, JobListener, ListenerArtifact, StepListener};
use crate::port::partition::LocalPartitionHandler;
use crate::port::repository::{CheckpointTarget, JobRepository};
use crate::port::transaction::{TransactionManager, TransactionStatus, UserTransaction};
use crate::runtime::{JobRuntime, Services};

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoInner {
    jobs: HashMap<Uuid, JobExecution>,
    steps: Vec<StepExecution>,
    partitions: Vec<PartitionExecution>,
    checkpoint_saves: usize,
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<RepoInner>>,
}

impl MemoryRepository {
    pub fn checkpoint_saves(&self) -> usize {
        self.inner.lock().unwrap().checkpoint_saves
    }

    pub fn steps(&self) -> Vec<StepExecution> {
        self.inner.lock().unwrap().steps.clone()
    }

    pub fn step(&self, name: &str) -> Option<StepExecution> {
        self.steps().into_iter().rev().find(|s| s.step_name == name)
    }

    pub fn partitions(&self, step_execution_id: Uuid) -> Vec<PartitionExecution> {
        let mut partitions: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .partitions
            .iter()
            .filter(|p| p.step_execution_id == step_execution_id)
            .cloned()
            .collect();
        partitions.sort_by_key(|p| p.partition_index);
        partitions
    }

    pub fn job(&self, id: Uuid) -> Option<JobExecution> {
        self.inner.lock().unwrap().jobs.get(&id).cloned()
    }
}

fn apply_checkpoint(target: &mut ExecutionState, state: &ExecutionState) {
    target.reader_checkpoint = state.reader_checkpoint.clone();
    target.writer_checkpoint = state.writer_checkpoint.clone();
    target.persistent_user_data = state.persistent_user_data.clone();
    target.metrics = state.metrics;
}

impl JobRepository for MemoryRepository {
    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_job_execution(&self, id: Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.job(id))
    }

    async fn add_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        self.inner.lock().unwrap().steps.push(execution.clone());
        Ok(())
    }

    async fn update_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.steps.iter_mut().find(|s| s.id == execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn save_checkpoint(
        &self,
        target: &CheckpointTarget,
        state: &ExecutionState,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.checkpoint_saves += 1;
        match target {
            CheckpointTarget::Step(id) => {
                if let Some(step) = inner.steps.iter_mut().find(|s| s.id == *id) {
                    apply_checkpoint(&mut step.state, state);
                }
            }
            CheckpointTarget::Partition {
                partition_execution_id,
                ..
            } => {
                if let Some(p) = inner
                    .partitions
                    .iter_mut()
                    .find(|p| p.id == *partition_execution_id)
                {
                    apply_checkpoint(&mut p.state, state);
                }
            }
        }
        Ok(())
    }

    async fn add_partition_execution(
        &self,
        execution: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        self.inner.lock().unwrap().partitions.push(execution.clone());
        Ok(())
    }

    async fn update_partition_execution(
        &self,
        execution: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.partitions.iter_mut().find(|p| p.id == execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn partition_executions(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Vec<PartitionExecution>, RepositoryError> {
        Ok(self.partitions(step_execution_id))
    }

    async fn step_executions(
        &self,
        job_execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self
            .steps()
            .into_iter()
            .filter(|s| s.job_execution_id == job_execution_id)
            .collect())
    }

    async fn count_step_starts(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<u32, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .steps
            .iter()
            .filter(|s| s.step_name == step_name)
            .filter(|s| {
                inner
                    .jobs
                    .get(&s.job_execution_id)
                    .is_some_and(|j| j.instance_id == instance_id)
            })
            .count();
        Ok(count as u32)
    }

    async fn last_step_execution(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .steps
            .iter()
            .rev()
            .find(|s| {
                s.step_name == step_name
                    && inner
                        .jobs
                        .get(&s.job_execution_id)
                        .is_some_and(|j| j.instance_id == instance_id)
            })
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CountingTransactions {
    pub commits: Arc<AtomicUsize>,
    pub rollbacks: Arc<AtomicUsize>,
}

struct CountingTransaction {
    status: TransactionStatus,
    counters: CountingTransactions,
}

#[async_trait]
impl UserTransaction for CountingTransaction {
    async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.status.is_in_flight() {
            return Err(TransactionError::AlreadyActive);
        }
        self.status = TransactionStatus::Active;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if !self.status.is_in_flight() {
            return Err(TransactionError::NotActive);
        }
        self.status = TransactionStatus::Committed;
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.status.is_in_flight() {
            return Err(TransactionError::NotActive);
        }
        self.status = TransactionStatus::RolledBack;
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_timeout(&mut self, _secs: u64) {}

    fn status(&self) -> TransactionStatus {
        self.status
    }
}

impl TransactionManager for CountingTransactions {
    fn transaction(&self) -> Box<dyn UserTransaction> {
        Box::new(CountingTransaction {
            status: TransactionStatus::NoTransaction,
            counters: self.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Artifact factory
// ---------------------------------------------------------------------------

pub type Maker = Arc<dyn Fn(&ArtifactContext) -> Artifact + Send + Sync>;

pub fn maker(f: impl Fn(&ArtifactContext) -> Artifact + Send + Sync + 'static) -> Maker {
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct FnArtifacts {
    makers: HashMap<String, Maker>,
    destroyed: Arc<Mutex<Vec<&'static str>>>,
}

impl FnArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, maker: Maker) -> Self {
        self.makers.insert(name.to_string(), maker);
        self
    }

    /// Kinds of the instances handed back through `destroy`, in order.
    pub fn destroyed(&self) -> Vec<&'static str> {
        self.destroyed.lock().unwrap().clone()
    }
}

impl ArtifactFactory for FnArtifacts {
    fn create(&self, artifact: &RefArtifact, ctx: &ArtifactContext) -> Result<Artifact, ArtifactError> {
        self.makers
            .get(&artifact.name)
            .map(|maker| maker(ctx))
            .ok_or_else(|| ArtifactError::Unknown(artifact.name.clone()))
    }

    fn destroy(&self, artifact: Artifact) {
        self.destroyed.lock().unwrap().push(artifact.kind());
    }
}

// ---------------------------------------------------------------------------
// Readers, processors, writers
// ---------------------------------------------------------------------------

/// Reads the numbers `start..=end`; the checkpoint is the count already read.
struct RangeReader {
    start: u64,
    end: u64,
    offset: u64,
}

#[async_trait]
impl ItemReader for RangeReader {
    async fn open(&mut self, checkpoint: Option<Checkpoint>) -> Result<(), BatchError> {
        self.offset = checkpoint.and_then(|c| c.as_u64()).unwrap_or(0);
        Ok(())
    }

    async fn read_item(&mut self) -> Result<Option<Item>, BatchError> {
        let value = self.start + self.offset;
        if value > self.end {
            return Ok(None);
        }
        self.offset += 1;
        Ok(Some(json!(value)))
    }

    async fn checkpoint_info(&mut self) -> Result<Option<Checkpoint>, BatchError> {
        Ok(Some(json!(self.offset)))
    }
}

pub fn range_reader(count: u64) -> Maker {
    maker(move |_| {
        Artifact::Reader(Box::new(RangeReader {
            start: 1,
            end: count,
            offset: 0,
        }))
    })
}

/// A range reader that sleeps `millis` before every item.
pub fn slow_range_reader(count: u64, millis: u64) -> Maker {
    struct SlowRangeReader {
        inner: RangeReader,
        millis: u64,
    }

    #[async_trait]
    impl ItemReader for SlowRangeReader {
        async fn open(&mut self, checkpoint: Option<Checkpoint>) -> Result<(), BatchError> {
            self.inner.open(checkpoint).await
        }

        async fn read_item(&mut self) -> Result<Option<Item>, BatchError> {
            if self.inner.start + self.inner.offset <= self.inner.end {
                tokio::time::sleep(std::time::Duration::from_millis(self.millis)).await;
            }
            self.inner.read_item().await
        }

        async fn checkpoint_info(&mut self) -> Result<Option<Checkpoint>, BatchError> {
            self.inner.checkpoint_info().await
        }
    }

    maker(move |_| {
        Artifact::Reader(Box::new(SlowRangeReader {
            inner: RangeReader {
                start: 1,
                end: count,
                offset: 0,
            },
            millis,
        }))
    })
}

/// A range reader bounded by its `start` and `end` properties.
pub fn property_range_reader() -> Maker {
    maker(|ctx| {
        let bound = |name: &str| ctx.property(name).and_then(|v| v.parse().ok()).unwrap_or(0);
        Artifact::Reader(Box::new(RangeReader {
            start: bound("start"),
            end: bound("end"),
            offset: 0,
        }))
    })
}

#[derive(Clone)]
pub struct FailingReader {
    calls: Arc<AtomicUsize>,
    /// `None` fails every read, otherwise fail once at this 1-based position.
    fail_at: Option<u64>,
    items: u64,
    kind: &'static str,
}

struct FailingReaderImpl {
    plan: FailingReader,
    offset: u64,
    failed: bool,
}

impl FailingReader {
    pub fn always(kind: &'static str) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_at: None,
            items: 0,
            kind,
        }
    }

    /// Yield `1..=items`, failing once in place of `position`.
    pub fn once_at(position: u64, items: u64, kind: &'static str) -> Self {
        Self {
            fail_at: Some(position),
            items,
            ..Self::always(kind)
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn factory(&self) -> Maker {
        let plan = self.clone();
        maker(move |_| {
            Artifact::Reader(Box::new(FailingReaderImpl {
                plan: plan.clone(),
                offset: 0,
                failed: false,
            }))
        })
    }
}

#[async_trait]
impl ItemReader for FailingReaderImpl {
    async fn read_item(&mut self) -> Result<Option<Item>, BatchError> {
        self.plan.calls.fetch_add(1, Ordering::SeqCst);
        let kind = self.plan.kind;
        let error = move || BatchError::new(kind, "read failed");
        match self.plan.fail_at {
            None => Err(error()),
            Some(position) => {
                if self.offset >= self.plan.items {
                    return Ok(None);
                }
                self.offset += 1;
                if self.offset == position && !self.failed {
                    self.failed = true;
                    return Err(error());
                }
                Ok(Some(json!(self.offset)))
            }
        }
    }
}

struct EvenFilter;

#[async_trait]
impl ItemProcessor for EvenFilter {
    async fn process_item(&mut self, item: &Item) -> Result<Option<Item>, BatchError> {
        Ok(item.as_u64().filter(|n| n % 2 == 0).map(|n| json!(n)))
    }
}

pub fn even_filter() -> Maker {
    maker(|_| Artifact::Processor(Box::new(EvenFilter)))
}

struct FailOnceProcessor {
    bad: Value,
    kind: &'static str,
    failed: Arc<AtomicBool>,
}

#[async_trait]
impl ItemProcessor for FailOnceProcessor {
    async fn process_item(&mut self, item: &Item) -> Result<Option<Item>, BatchError> {
        if *item == self.bad && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(BatchError::new(self.kind, "process failed"));
        }
        Ok(Some(item.clone()))
    }
}

/// Passes items through, failing with `kind` the first time it sees `bad`.
pub fn failing_once_processor(bad: Value, kind: &'static str) -> Maker {
    let failed = Arc::new(AtomicBool::new(false));
    maker(move |_| {
        Artifact::Processor(Box::new(FailOnceProcessor {
            bad: bad.clone(),
            kind,
            failed: Arc::clone(&failed),
        }))
    })
}

#[derive(Clone, Default)]
pub struct ListWriter {
    items: Arc<Mutex<Vec<Item>>>,
    fail_on: Option<Value>,
    failed: Arc<AtomicBool>,
}

struct ListWriterImpl(ListWriter);

impl ListWriter {
    pub fn items(&self) -> Vec<Item> {
        self.items.lock().unwrap().clone()
    }

    /// Fail the first write whose batch contains `value`.
    pub fn failing_once_on(mut self, value: Value) -> Self {
        self.fail_on = Some(value);
        self
    }

    pub fn factory(&self) -> Maker {
        let writer = self.clone();
        maker(move |_| Artifact::Writer(Box::new(ListWriterImpl(writer.clone()))))
    }
}

pub fn list_writer() -> ListWriter {
    ListWriter::default()
}

#[async_trait]
impl ItemWriter for ListWriterImpl {
    async fn write_items(&mut self, items: &[Item]) -> Result<(), BatchError> {
        let writer = &self.0;
        if let Some(bad) = &writer.fail_on {
            if items.contains(bad) && !writer.failed.swap(true, Ordering::SeqCst) {
                return Err(BatchError::new("io", "write failed"));
            }
        }
        writer.items.lock().unwrap().extend_from_slice(items);
        Ok(())
    }
}

struct EveryN {
    n: u32,
    seen: u32,
}

#[async_trait]
impl CheckpointAlgorithm for EveryN {
    async fn begin_checkpoint(&mut self) -> Result<(), BatchError> {
        self.seen = 0;
        Ok(())
    }

    async fn is_ready_to_checkpoint(&mut self) -> Result<bool, BatchError> {
        self.seen += 1;
        Ok(self.seen >= self.n)
    }
}

pub fn every_n_algorithm(n: u32) -> Maker {
    maker(move |_| Artifact::CheckpointAlgorithm(Box::new(EveryN { n, seen: 0 })))
}

// ---------------------------------------------------------------------------
// Batchlets, deciders, listeners
// ---------------------------------------------------------------------------

type BatchletFn = Arc<dyn Fn(&ArtifactContext) -> Result<Option<String>, BatchError> + Send + Sync>;

struct FnBatchlet {
    ctx: ArtifactContext,
    body: BatchletFn,
}

#[async_trait]
impl Batchlet for FnBatchlet {
    async fn process(&self) -> Result<Option<String>, BatchError> {
        (self.body)(&self.ctx)
    }
}

pub fn batchlet<F>(body: F) -> Maker
where
    F: Fn(&ArtifactContext) -> Result<Option<String>, BatchError> + Send + Sync + 'static,
{
    let body: BatchletFn = Arc::new(body);
    maker(move |ctx| {
        Artifact::Batchlet(Box::new(FnBatchlet {
            ctx: ctx.clone(),
            body: Arc::clone(&body),
        }))
    })
}

/// A batchlet that appends its step name to `log` and returns `exit`.
pub fn logging_batchlet(log: &Arc<Mutex<Vec<String>>>, exit: Option<&str>) -> Maker {
    let log = Arc::clone(log);
    let exit = exit.map(str::to_string);
    batchlet(move |ctx| {
        log.lock()
            .unwrap()
            .push(ctx.step_name.clone().unwrap_or_default());
        Ok(exit.clone())
    })
}

pub fn failing_batchlet(kind: &'static str) -> Maker {
    batchlet(move |_| Err(BatchError::new(kind, "batchlet failed")))
}

/// A batchlet that blocks until stopped, then returns `exit`.
pub fn blocking_batchlet(exit: &'static str) -> Maker {
    struct Blocking {
        released: tokio::sync::Notify,
        exit: &'static str,
    }

    #[async_trait]
    impl Batchlet for Blocking {
        async fn process(&self) -> Result<Option<String>, BatchError> {
            self.released.notified().await;
            Ok(Some(self.exit.to_string()))
        }

        async fn stop(&self) -> Result<(), BatchError> {
            self.released.notify_one();
            Ok(())
        }
    }

    maker(move |_| {
        Artifact::Batchlet(Box::new(Blocking {
            released: tokio::sync::Notify::new(),
            exit,
        }))
    })
}

/// A batchlet that fails with `kind` after sleeping `millis`.
pub fn slow_failing_batchlet(kind: &'static str, millis: u64) -> Maker {
    struct SlowFailing {
        kind: &'static str,
        millis: u64,
    }

    #[async_trait]
    impl Batchlet for SlowFailing {
        async fn process(&self) -> Result<Option<String>, BatchError> {
            tokio::time::sleep(std::time::Duration::from_millis(self.millis)).await;
            Err(BatchError::new(self.kind, "batchlet failed"))
        }
    }

    maker(move |_| Artifact::Batchlet(Box::new(SlowFailing { kind, millis })))
}

struct FixedDecider {
    exit: String,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Decider for FixedDecider {
    async fn decide(&mut self, executions: &[StepExecution]) -> Result<String, BatchError> {
        self.seen
            .lock()
            .unwrap()
            .extend(executions.iter().map(|e| e.step_name.clone()));
        Ok(self.exit.clone())
    }
}

/// A decider returning `exit` and recording the step names it was given.
pub fn decider(exit: &str, seen: &Arc<Mutex<Vec<String>>>) -> Maker {
    let exit = exit.to_string();
    let seen = Arc::clone(seen);
    maker(move |_| {
        Artifact::Decider(Box::new(FixedDecider {
            exit: exit.clone(),
            seen: Arc::clone(&seen),
        }))
    })
}

/// Records job, step and chunk callbacks; fails the callback named `fail_on`.
pub struct RecordingListener {
    pub log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<&'static str>,
}

impl RecordingListener {
    fn record(&self, event: &'static str) -> Result<(), BatchError> {
        self.log.lock().unwrap().push(event.to_string());
        if self.fail_on == Some(event) {
            return Err(BatchError::new("listener", format!("{event} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobListener for RecordingListener {
    async fn before_job(&self) -> Result<(), BatchError> {
        self.record("before_job")
    }

    async fn after_job(&self) -> Result<(), BatchError> {
        self.record("after_job")
    }
}

#[async_trait]
impl StepListener for RecordingListener {
    async fn before_step(&self) -> Result<(), BatchError> {
        self.record("before_step")
    }

    async fn after_step(&self) -> Result<(), BatchError> {
        self.record("after_step")
    }
}

#[async_trait]
impl ChunkListener for RecordingListener {
    async fn before_chunk(&self) -> Result<(), BatchError> {
        self.record("before_chunk")
    }

    async fn after_chunk(&self) -> Result<(), BatchError> {
        self.record("after_chunk")
    }
}

pub fn recording_listener(log: &Arc<Mutex<Vec<String>>>, fail_on: Option<&'static str>) -> Maker {
    let log = Arc::clone(log);
    maker(move |_| {
        let listener = Arc::new(RecordingListener {
            log: Arc::clone(&log),
            fail_on,
        });
        Artifact::Listener(
            ListenerArtifact::new()
                .job(listener.clone())
                .step(listener.clone())
                .chunk(listener),
        )
    })
}

// ---------------------------------------------------------------------------
// Partition plugins
// ---------------------------------------------------------------------------

type Log = Arc<Mutex<Vec<String>>>;

struct RecordingReducer(Log);

#[async_trait]
impl PartitionReducer for RecordingReducer {
    async fn begin_partitioned_step(&mut self) -> Result<(), BatchError> {
        self.0.lock().unwrap().push("begin".to_string());
        Ok(())
    }

    async fn before_partitioned_step_completion(&mut self) -> Result<(), BatchError> {
        self.0.lock().unwrap().push("before_completion".to_string());
        Ok(())
    }

    async fn rollback_partitioned_step(&mut self) -> Result<(), BatchError> {
        self.0.lock().unwrap().push("rollback".to_string());
        Ok(())
    }

    async fn after_partitioned_step_completion(
        &mut self,
        status: PartitionStatus,
    ) -> Result<(), BatchError> {
        self.0.lock().unwrap().push(format!("after:{status:?}"));
        Ok(())
    }
}

pub fn recording_reducer(log: &Log) -> Maker {
    let log = Arc::clone(log);
    maker(move |_| Artifact::Reducer(Box::new(RecordingReducer(Arc::clone(&log)))))
}

struct RecordingAnalyzer(Log);

#[async_trait]
impl PartitionAnalyzer for RecordingAnalyzer {
    async fn analyze_collector_data(&mut self, data: Value) -> Result<(), BatchError> {
        self.0.lock().unwrap().push(format!("data:{data}"));
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        batch_status: BatchStatus,
        exit_status: &str,
    ) -> Result<(), BatchError> {
        self.0
            .lock()
            .unwrap()
            .push(format!("status:{batch_status}:{exit_status}"));
        Ok(())
    }
}

/// Records `data:<json>` and `status:<batch>:<exit>` entries.
pub fn recording_analyzer(log: &Log) -> Maker {
    let log = Arc::clone(log);
    maker(move |_| Artifact::Analyzer(Box::new(RecordingAnalyzer(Arc::clone(&log)))))
}

struct IndexCollector(Option<u32>);

#[async_trait]
impl PartitionCollector for IndexCollector {
    async fn collect_partition_data(&mut self) -> Result<Value, BatchError> {
        Ok(json!(self.0))
    }
}

/// Collects the index of the partition it runs in.
pub fn index_collector() -> Maker {
    maker(|ctx| Artifact::Collector(Box::new(IndexCollector(ctx.partition_index))))
}

struct FixedMapper(PartitionPlan);

#[async_trait]
impl PartitionMapper for FixedMapper {
    async fn map_partitions(&mut self) -> Result<PartitionPlan, BatchError> {
        Ok(self.0.clone())
    }
}

pub fn fixed_mapper(plan: PartitionPlan) -> Maker {
    maker(move |_| Artifact::Mapper(Box::new(FixedMapper(plan.clone()))))
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn chunk_step(id: &str, chunk: Chunk) -> Step {
    Step::new(id).with_chunk(chunk)
}

pub fn batchlet_step(id: &str, batchlet: &str) -> Step {
    Step::new(id).with_batchlet(RefArtifact::new(batchlet))
}

pub fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn services(repository: MemoryRepository, artifacts: FnArtifacts) -> Services<MemoryRepository> {
    Services {
        repository: Arc::new(repository),
        artifacts: Arc::new(artifacts),
        transactions: Arc::new(CountingTransactions::default()),
        partition_handler: Arc::new(LocalPartitionHandler),
        event_bus: EventBus::new(256),
        config: EngineConfig::default(),
    }
}

pub fn runtime_for(
    repository: MemoryRepository,
    artifacts: FnArtifacts,
    job: &JobDefinition,
) -> Arc<JobRuntime<MemoryRepository>> {
    let execution = JobExecution::new(job.id.clone(), Properties::new());
    JobRuntime::new(services(repository, artifacts), job, execution)
}
