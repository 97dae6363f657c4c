//! Chunk-oriented processing: read, process and buffer items, then write the
//! buffer and commit at each checkpoint.
//!
//! The loop is driven by two small state machines. `ChunkState` tracks the
//! chunk as a whole (new chunk, retrying after a rollback, input depleted,
//! stop requested). `ItemState` tracks the item in flight (skipped, or
//! waiting to be re-read, re-processed or re-written without a rollback).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use batchflow_types::error::BatchError;
use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{Checkpoint, ExecutionState, MetricType};
use batchflow_types::filter::ExceptionClassFilter;
use batchflow_types::job::{CheckpointPolicy, Chunk};
use batchflow_types::status::BatchStatus;
use tokio::task::JoinHandle;

use crate::error::RunnerError;
use crate::port::artifact::{
    Artifact, CheckpointAlgorithm, Item, ItemProcessor, ItemReader, ItemWriter,
    create_checkpoint_algorithm, create_processor, create_reader, create_writer,
};
use crate::port::repository::JobRepository;
use crate::port::transaction::UserTransaction;

use super::{StepScope, fail_state};

// ---------------------------------------------------------------------------
// Processing state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Running,
    ToStartNew,
    /// Rolled back; the next chunk re-reads from the last checkpoint.
    ToRetry,
    Retrying,
    /// The retried chunk reached the original failure point.
    ToEndRetry,
    Depleted,
    JobStopping,
    JobStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemState {
    Running,
    ToSkip,
    ToRetryRead,
    RetryingRead,
    ToRetryProcess,
    RetryingProcess,
    ToRetryWrite,
    RetryingWrite,
}

impl ItemState {
    pub fn is_to_retry(self) -> bool {
        matches!(
            self,
            Self::ToRetryRead | Self::ToRetryProcess | Self::ToRetryWrite
        )
    }

    pub fn is_retrying(self) -> bool {
        matches!(
            self,
            Self::RetryingRead | Self::RetryingProcess | Self::RetryingWrite
        )
    }

    /// Whether the rest of the current loop pass is skipped.
    pub fn stops_item(self) -> bool {
        self == Self::ToSkip || self.is_to_retry()
    }
}

#[derive(Debug)]
pub(crate) struct ProcessingInfo {
    /// Items read into the current chunk.
    pub count: u32,
    pub timer_expired: Arc<AtomicBool>,
    pub chunk_state: ChunkState,
    pub item_state: ItemState,
    /// Reader position when the chunk was rolled back for a retry.
    pub failure_point: Option<Checkpoint>,
}

impl ProcessingInfo {
    pub fn new() -> Self {
        Self {
            count: 0,
            timer_expired: Arc::new(AtomicBool::new(false)),
            chunk_state: ChunkState::ToStartNew,
            item_state: ItemState::Running,
            failure_point: None,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.timer_expired = Arc::new(AtomicBool::new(false));
        self.chunk_state = ChunkState::Running;
        self.item_state = ItemState::Running;
        self.failure_point = None;
    }

    /// Whether the current chunk is a retry of a rolled back one.
    fn in_retry(&self) -> bool {
        matches!(
            self.chunk_state,
            ChunkState::Retrying | ChunkState::ToEndRetry
        ) || self.item_state.is_retrying()
    }
}

// ---------------------------------------------------------------------------
// Skip / retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorAction {
    Skip,
    Retry,
    Fail,
}

/// Skip and retry budgets of one chunk step execution.
#[derive(Debug)]
pub(crate) struct ErrorPolicy {
    skippable: ExceptionClassFilter,
    retryable: ExceptionClassFilter,
    no_rollback: ExceptionClassFilter,
    skip_limit: i64,
    retry_limit: i64,
    pub skip_count: i64,
    pub retry_count: i64,
}

impl ErrorPolicy {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            skippable: chunk.skippable.clone(),
            retryable: chunk.retryable.clone(),
            no_rollback: chunk.no_rollback.clone(),
            skip_limit: chunk.skip_limit,
            retry_limit: chunk.retry_limit,
            skip_count: 0,
            retry_count: 0,
        }
    }

    fn need_skip(&self, err: &BatchError) -> bool {
        (self.skip_limit < 0 || self.skip_count < self.skip_limit) && self.skippable.matches(err)
    }

    fn need_retry(&self, err: &BatchError) -> bool {
        (self.retry_limit < 0 || self.retry_count < self.retry_limit)
            && self.retryable.matches(err)
    }

    /// Whether retrying after `err` first rolls the chunk back.
    pub fn needs_rollback(&self, err: &BatchError) -> bool {
        !self.no_rollback.matches(err)
    }

    /// Decide what to do with an artifact error.
    ///
    /// While a chunk or item is being retried, skipping wins over another
    /// retry. Otherwise retrying wins.
    pub fn classify(&self, err: &BatchError, info: &ProcessingInfo) -> ErrorAction {
        let (skip, retry) = (self.need_skip(err), self.need_retry(err));
        if info.in_retry() {
            if skip {
                return ErrorAction::Skip;
            }
            if retry {
                return ErrorAction::Retry;
            }
        } else {
            if retry {
                return ErrorAction::Retry;
            }
            if skip {
                return ErrorAction::Skip;
            }
        }
        ErrorAction::Fail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointOutcome {
    Committable,
    Deferred,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run the chunk of the step in `scope`, leaving the outcome in `state`.
///
/// On return `state` is COMPLETED, STOPPED or FAILED (with the failure
/// recorded). Errors never escape.
pub(crate) async fn run_chunk<R: JobRepository>(
    scope: &mut StepScope<'_, R>,
    chunk: &Chunk,
    state: &mut ExecutionState,
) {
    let artifacts = match ChunkArtifacts::create(scope, chunk) {
        Ok(artifacts) => artifacts,
        Err(err) => {
            tracing::error!(step = scope.step.id.as_str(), error = %err, "failed to set up chunk");
            fail_state(state, &err);
            return;
        }
    };
    ChunkRunner::new(scope, chunk, state, artifacts).run().await;
}

struct ChunkArtifacts {
    reader: Box<dyn ItemReader>,
    processor: Option<Box<dyn ItemProcessor>>,
    writer: Box<dyn ItemWriter>,
    algorithm: Option<Box<dyn CheckpointAlgorithm>>,
}

impl ChunkArtifacts {
    fn create<R: JobRepository>(scope: &StepScope<'_, R>, chunk: &Chunk) -> Result<Self, RunnerError> {
        let invalid = |reason: &str| RunnerError::InvalidChunk {
            step: scope.step.id.clone(),
            reason: reason.to_string(),
        };
        if chunk.item_count < 1 {
            return Err(invalid("item-count must be at least 1"));
        }
        let algorithm_ref = match (chunk.checkpoint_policy, &chunk.checkpoint_algorithm) {
            (CheckpointPolicy::Item, _) => None,
            (CheckpointPolicy::Custom, Some(algorithm)) => Some(algorithm),
            (CheckpointPolicy::Custom, None) => {
                return Err(invalid("custom checkpoint policy needs a checkpoint algorithm"));
            }
        };

        let factory = scope.rt.artifacts();
        let reader = create_reader(factory, &chunk.reader, &scope.artifact_context(&chunk.reader))?;
        let processor = chunk
            .processor
            .as_ref()
            .map(|p| create_processor(factory, p, &scope.artifact_context(p)))
            .transpose()?;
        let writer = create_writer(factory, &chunk.writer, &scope.artifact_context(&chunk.writer))?;
        let algorithm = algorithm_ref
            .map(|a| create_checkpoint_algorithm(factory, a, &scope.artifact_context(a)))
            .transpose()?;

        Ok(Self {
            reader,
            processor,
            writer,
            algorithm,
        })
    }
}

struct ChunkRunner<'s, 'a, R: JobRepository> {
    scope: &'s mut StepScope<'a, R>,
    state: &'s mut ExecutionState,
    chunk: &'s Chunk,
    reader: Box<dyn ItemReader>,
    processor: Option<Box<dyn ItemProcessor>>,
    writer: Box<dyn ItemWriter>,
    algorithm: Option<Box<dyn CheckpointAlgorithm>>,
    tx: Box<dyn UserTransaction>,
    policy: ErrorPolicy,
    info: ProcessingInfo,
    item_read: Option<Item>,
    outputs: Vec<Item>,
    /// Items written since the last commit.
    pending_written: u64,
    timer: Option<JoinHandle<()>>,
    streams_open: bool,
}

impl<'s, 'a, R: JobRepository> ChunkRunner<'s, 'a, R> {
    fn new(
        scope: &'s mut StepScope<'a, R>,
        chunk: &'s Chunk,
        state: &'s mut ExecutionState,
        artifacts: ChunkArtifacts,
    ) -> Self {
        let tx = scope.rt.services.transactions.transaction();
        Self {
            scope,
            state,
            chunk,
            reader: artifacts.reader,
            processor: artifacts.processor,
            writer: artifacts.writer,
            algorithm: artifacts.algorithm,
            tx,
            policy: ErrorPolicy::from_chunk(chunk),
            info: ProcessingInfo::new(),
            item_read: None,
            outputs: Vec::with_capacity(chunk.item_count as usize),
            pending_written: 0,
            timer: None,
            streams_open: false,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.execute().await {
            tracing::error!(
                job = self.scope.rt.job.id.as_str(),
                step = self.scope.step.id.as_str(),
                partition = ?self.scope.partition_index(),
                error = %err,
                "chunk processing failed"
            );
            fail_state(self.state, &err);
        }

        self.cancel_timer();
        self.safe_close().await;

        let factory = self.scope.rt.artifacts();
        factory.destroy(Artifact::Reader(self.reader));
        factory.destroy(Artifact::Writer(self.writer));
        if let Some(processor) = self.processor {
            factory.destroy(Artifact::Processor(processor));
        }
        if let Some(algorithm) = self.algorithm {
            factory.destroy(Artifact::CheckpointAlgorithm(algorithm));
        }
    }

    async fn execute(&mut self) -> Result<(), RunnerError> {
        let timeout = self.scope.rt.transaction_timeout(self.scope.step);
        self.tx.set_timeout(timeout);

        self.tx.begin().await?;
        if let Err(err) = self.open_streams().await {
            self.abort_transaction().await;
            return Err(err);
        }
        self.tx.commit().await?;

        self.read_process_write().await?;

        self.tx.begin().await?;
        if let Err(err) = self.close_streams().await {
            self.abort_transaction().await;
            return Err(err);
        }
        self.tx.commit().await?;

        self.scope.send_collector_data().await
    }

    async fn read_process_write(&mut self) -> Result<(), RunnerError> {
        let result = self.chunk_loop().await;
        if let Err(err) = &result {
            self.abort_transaction().await;
            let error = err.to_batch_error();
            for listener in &self.scope.listeners.chunk {
                if let Err(listener_err) = listener.on_error(&error).await {
                    tracing::warn!(
                        step = self.scope.step.id.as_str(),
                        error = %listener_err,
                        "chunk listener on_error failed"
                    );
                }
            }
        }
        result
    }

    async fn chunk_loop(&mut self) -> Result<(), RunnerError> {
        let listeners = self.scope.listeners;
        loop {
            let state = self.info.chunk_state;
            if state == ChunkState::JobStopped
                || (state == ChunkState::Depleted && !self.info.item_state.is_to_retry())
            {
                break;
            }

            self.info.item_state = match self.info.item_state {
                ItemState::ToSkip => ItemState::Running,
                ItemState::ToRetryRead => ItemState::RetryingRead,
                ItemState::ToRetryProcess => ItemState::RetryingProcess,
                ItemState::ToRetryWrite => ItemState::RetryingWrite,
                other => other,
            };

            if matches!(
                state,
                ChunkState::ToStartNew
                    | ChunkState::ToRetry
                    | ChunkState::Retrying
                    | ChunkState::ToEndRetry
            ) {
                if matches!(state, ChunkState::ToStartNew | ChunkState::ToEndRetry) {
                    self.info.reset();
                }
                if !self.tx.status().is_in_flight() {
                    if let Some(algorithm) = self.algorithm.as_mut() {
                        let timeout = algorithm.checkpoint_timeout().await?;
                        if timeout > 0 {
                            self.tx.set_timeout(timeout);
                        }
                    }
                    self.tx.begin().await?;
                }
                for listener in &listeners.chunk {
                    listener.before_chunk().await.map_err(RunnerError::Listener)?;
                }
                self.begin_checkpoint().await?;
            }

            if !matches!(
                self.info.item_state,
                ItemState::RetryingProcess | ItemState::RetryingWrite
            ) {
                self.read_item().await?;
            }
            if self.item_read.is_some() && self.info.item_state != ItemState::RetryingWrite {
                self.process_item().await?;
            }
            if self.info.item_state.stops_item() {
                continue;
            }

            if self.is_ready_to_checkpoint().await? {
                if let Err(err) = self.checkpoint_and_commit().await {
                    if self.tx.status().is_in_flight() {
                        match self.tx.rollback().await {
                            Ok(()) => self.state.metrics.increment(MetricType::RollbackCount, 1),
                            Err(rollback_err) => tracing::warn!(
                                step = self.scope.step.id.as_str(),
                                error = %rollback_err,
                                "rollback after failed checkpoint failed"
                            ),
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn checkpoint_and_commit(&mut self) -> Result<(), RunnerError> {
        if self.do_checkpoint().await? == CheckpointOutcome::Deferred {
            return Ok(());
        }
        for listener in &self.scope.listeners.chunk {
            listener.after_chunk().await.map_err(RunnerError::Listener)?;
        }
        self.tx.commit().await?;

        // A depleted pass that read nothing commits an empty chunk.
        if self.info.count > 0 {
            self.state.metrics.increment(MetricType::CommitCount, 1);
        }
        self.scope.rt.publish(BatchEvent::ChunkCommitted {
            step_execution_id: self.scope.target.step_execution_id(),
            partition_index: self.scope.partition_index(),
            items_written: std::mem::take(&mut self.pending_written),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Item handling
    // -----------------------------------------------------------------------

    async fn read_item(&mut self) -> Result<(), RunnerError> {
        let listeners = self.scope.listeners;
        for listener in &listeners.item_read {
            listener.before_read().await.map_err(RunnerError::Listener)?;
        }

        match self.reader.read_item().await {
            Ok(item) => {
                if item.is_some() {
                    self.state.metrics.increment(MetricType::ReadCount, 1);
                    self.info.count += 1;
                } else {
                    self.info.chunk_state = ChunkState::Depleted;
                }
                for listener in &listeners.item_read {
                    listener
                        .after_read(item.as_ref())
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                self.item_read = item;
                if self.info.item_state == ItemState::RetryingRead {
                    self.info.item_state = ItemState::Running;
                }
                return Ok(());
            }
            Err(err) => {
                for listener in &listeners.item_read {
                    listener.on_read_error(&err).await.map_err(RunnerError::Listener)?;
                }
                self.item_read = None;
                match self.policy.classify(&err, &self.info) {
                    ErrorAction::Skip => {
                        tracing::debug!(step = self.scope.step.id.as_str(), error = %err, "skipping read");
                        for listener in &listeners.skip_read {
                            listener.on_skip_read_item(&err).await.map_err(RunnerError::Listener)?;
                        }
                        self.state.metrics.increment(MetricType::ReadSkipCount, 1);
                        self.state.metrics.increment(MetricType::ReadCount, 1);
                        self.policy.skip_count += 1;
                        self.info.item_state = ItemState::ToSkip;
                    }
                    ErrorAction::Retry => {
                        tracing::debug!(step = self.scope.step.id.as_str(), error = %err, "retrying read");
                        for listener in &listeners.retry_read {
                            listener.on_retry_read_error(&err).await.map_err(RunnerError::Listener)?;
                        }
                        self.policy.retry_count += 1;
                        if self.policy.needs_rollback(&err) {
                            self.rollback_checkpoint().await?;
                        } else {
                            self.info.item_state = ItemState::ToRetryRead;
                        }
                    }
                    ErrorAction::Fail => return Err(err.into()),
                }
            }
        }

        let position = self.reader.checkpoint_info().await?;
        self.check_if_end_retry(position);
        if self.info.item_state == ItemState::RetryingRead {
            self.info.item_state = ItemState::Running;
        }
        Ok(())
    }

    async fn process_item(&mut self) -> Result<(), RunnerError> {
        let Some(item) = self.item_read.take() else {
            return Ok(());
        };

        let output = self.run_processor(&item).await?;
        if let Some(output) = output {
            self.outputs.push(output);
        }
        if self.info.item_state == ItemState::ToRetryProcess {
            self.item_read = Some(item);
        }

        let position = self.reader.checkpoint_info().await?;
        self.check_if_end_retry(position);
        if self.info.item_state == ItemState::RetryingProcess {
            self.info.item_state = ItemState::Running;
        }
        Ok(())
    }

    async fn run_processor(&mut self, item: &Item) -> Result<Option<Item>, RunnerError> {
        let listeners = self.scope.listeners;
        let Some(processor) = self.processor.as_mut() else {
            return Ok(Some(item.clone()));
        };

        for listener in &listeners.item_process {
            listener.before_process(item).await.map_err(RunnerError::Listener)?;
        }
        let err = match processor.process_item(item).await {
            Ok(output) => {
                for listener in &listeners.item_process {
                    listener
                        .after_process(item, output.as_ref())
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                if output.is_none() {
                    self.state.metrics.increment(MetricType::FilterCount, 1);
                }
                return Ok(output);
            }
            Err(err) => err,
        };

        for listener in &listeners.item_process {
            listener
                .on_process_error(item, &err)
                .await
                .map_err(RunnerError::Listener)?;
        }
        match self.policy.classify(&err, &self.info) {
            ErrorAction::Skip => {
                tracing::debug!(step = self.scope.step.id.as_str(), error = %err, "skipping item");
                for listener in &listeners.skip_process {
                    listener
                        .on_skip_process_item(item, &err)
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                self.state.metrics.increment(MetricType::ProcessSkipCount, 1);
                self.policy.skip_count += 1;
                self.info.item_state = ItemState::ToSkip;
            }
            ErrorAction::Retry => {
                tracing::debug!(step = self.scope.step.id.as_str(), error = %err, "retrying item");
                for listener in &listeners.retry_process {
                    listener
                        .on_retry_process_error(item, &err)
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                self.policy.retry_count += 1;
                if self.policy.needs_rollback(&err) {
                    self.rollback_checkpoint().await?;
                } else {
                    self.info.item_state = ItemState::ToRetryProcess;
                }
            }
            ErrorAction::Fail => return Err(err.into()),
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn begin_checkpoint(&mut self) -> Result<(), RunnerError> {
        match self.chunk.checkpoint_policy {
            CheckpointPolicy::Item => {
                if let Some(secs) = self.chunk.time_limit_secs.filter(|s| *s > 0) {
                    self.start_timer(secs);
                }
            }
            CheckpointPolicy::Custom => {
                if let Some(algorithm) = self.algorithm.as_mut() {
                    algorithm.begin_checkpoint().await?;
                }
            }
        }

        self.info.chunk_state = match self.info.chunk_state {
            ChunkState::ToRetry | ChunkState::Retrying => ChunkState::Retrying,
            _ => ChunkState::Running,
        };
        Ok(())
    }

    async fn is_ready_to_checkpoint(&mut self) -> Result<bool, RunnerError> {
        if self.scope.rt.stop.is_stop_requested() {
            self.info.chunk_state = ChunkState::JobStopping;
            return Ok(true);
        }
        if matches!(
            self.info.chunk_state,
            ChunkState::Depleted | ChunkState::Retrying | ChunkState::ToEndRetry
        ) {
            return Ok(true);
        }
        match self.algorithm.as_mut() {
            Some(algorithm) => Ok(algorithm.is_ready_to_checkpoint().await?),
            None => Ok(self.info.count >= self.chunk.item_count
                || self.info.timer_expired.load(Ordering::SeqCst)),
        }
    }

    async fn do_checkpoint(&mut self) -> Result<CheckpointOutcome, RunnerError> {
        let listeners = self.scope.listeners;
        if !self.outputs.is_empty() {
            for listener in &listeners.item_write {
                listener.before_write(&self.outputs).await.map_err(RunnerError::Listener)?;
            }
            match self.writer.write_items(&self.outputs).await {
                Ok(()) => {
                    let written = self.outputs.len() as u64;
                    self.state.metrics.increment(MetricType::WriteCount, written);
                    self.pending_written += written;
                    for listener in &listeners.item_write {
                        listener.after_write(&self.outputs).await.map_err(RunnerError::Listener)?;
                    }
                    self.persist_checkpoint().await?;
                    self.outputs.clear();
                    self.finish_checkpoint().await?;
                }
                Err(err) => self.handle_write_error(err).await?,
            }
        } else if self.info.chunk_state == ChunkState::JobStopping {
            self.mark_stopped();
        }

        let position = self.reader.checkpoint_info().await?;
        self.check_if_end_retry(position);
        if self.info.item_state == ItemState::RetryingWrite {
            self.info.item_state = ItemState::Running;
        }

        if self.info.chunk_state == ChunkState::ToRetry
            || self.info.item_state == ItemState::ToRetryWrite
        {
            Ok(CheckpointOutcome::Deferred)
        } else {
            Ok(CheckpointOutcome::Committable)
        }
    }

    async fn handle_write_error(&mut self, err: BatchError) -> Result<(), RunnerError> {
        let listeners = self.scope.listeners;
        for listener in &listeners.item_write {
            listener
                .on_write_error(&self.outputs, &err)
                .await
                .map_err(RunnerError::Listener)?;
        }

        match self.policy.classify(&err, &self.info) {
            ErrorAction::Skip if self.info.chunk_state == ChunkState::JobStopping => {
                self.outputs.clear();
                self.mark_stopped();
            }
            ErrorAction::Skip => {
                tracing::debug!(
                    step = self.scope.step.id.as_str(),
                    items = self.outputs.len(),
                    error = %err,
                    "skipping write"
                );
                for listener in &listeners.skip_write {
                    listener
                        .on_skip_write_item(&self.outputs, &err)
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                self.state.metrics.increment(MetricType::WriteSkipCount, 1);
                self.policy.skip_count += self.outputs.len() as i64;
                self.outputs.clear();
                self.persist_checkpoint().await?;
                self.finish_checkpoint().await?;
                self.info.item_state = ItemState::ToSkip;
            }
            ErrorAction::Retry => {
                tracing::debug!(step = self.scope.step.id.as_str(), error = %err, "retrying write");
                for listener in &listeners.retry_write {
                    listener
                        .on_retry_write_error(&self.outputs, &err)
                        .await
                        .map_err(RunnerError::Listener)?;
                }
                self.policy.retry_count += 1;
                if self.policy.needs_rollback(&err) {
                    self.rollback_checkpoint().await?;
                } else {
                    self.info.item_state = ItemState::ToRetryWrite;
                }
            }
            ErrorAction::Fail => return Err(err.into()),
        }
        Ok(())
    }

    async fn finish_checkpoint(&mut self) -> Result<(), RunnerError> {
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.end_checkpoint().await?;
        }
        match self.info.chunk_state {
            ChunkState::JobStopping => self.mark_stopped(),
            ChunkState::Depleted | ChunkState::Retrying => {}
            _ => self.info.chunk_state = ChunkState::ToStartNew,
        }
        self.scope.send_collector_data().await
    }

    fn mark_stopped(&mut self) {
        self.info.chunk_state = ChunkState::JobStopped;
        self.state.status.advance(BatchStatus::Stopped);
        tracing::info!(step = self.scope.step.id.as_str(), "chunk stopped at checkpoint");
    }

    async fn persist_checkpoint(&mut self) -> Result<(), RunnerError> {
        self.state.reader_checkpoint = self.reader.checkpoint_info().await?;
        self.state.writer_checkpoint = self.writer.checkpoint_info().await?;
        self.state.persistent_user_data = self.scope.handle.persistent_user_data();
        self.scope
            .rt
            .repository()
            .save_checkpoint(&self.scope.target, self.state)
            .await?;
        Ok(())
    }

    async fn rollback_checkpoint(&mut self) -> Result<(), RunnerError> {
        self.outputs.clear();
        self.info.failure_point = self.reader.checkpoint_info().await?;
        self.tx.rollback().await?;
        self.state.metrics.increment(MetricType::RollbackCount, 1);
        self.scope.rt.publish(BatchEvent::ChunkRolledBack {
            step_execution_id: self.scope.target.step_execution_id(),
            partition_index: self.scope.partition_index(),
        });

        let reopened = match self.close_streams().await {
            Ok(()) => self.open_streams().await,
            Err(err) => Err(err),
        };
        if let Err(err) = reopened {
            self.safe_close().await;
            return Err(err);
        }

        self.info.chunk_state = ChunkState::ToRetry;
        self.info.item_state = ItemState::Running;
        self.scope.send_collector_data().await
    }

    fn check_if_end_retry(&mut self, position: Option<Checkpoint>) {
        if self.info.chunk_state == ChunkState::Retrying
            && !self.info.item_state.is_to_retry()
            && self.info.failure_point == position
        {
            self.info.chunk_state = ChunkState::ToEndRetry;
        }
    }

    // -----------------------------------------------------------------------
    // Streams, timer, transaction
    // -----------------------------------------------------------------------

    async fn open_streams(&mut self) -> Result<(), RunnerError> {
        self.streams_open = true;
        self.reader.open(self.state.reader_checkpoint.clone()).await?;
        self.writer.open(self.state.writer_checkpoint.clone()).await?;
        Ok(())
    }

    async fn close_streams(&mut self) -> Result<(), RunnerError> {
        let reader = self.reader.close().await;
        let writer = self.writer.close().await;
        self.streams_open = false;
        reader?;
        writer?;
        Ok(())
    }

    async fn safe_close(&mut self) {
        if !self.streams_open {
            return;
        }
        if let Err(err) = self.close_streams().await {
            tracing::warn!(step = self.scope.step.id.as_str(), error = %err, "failed to close chunk streams");
        }
    }

    async fn abort_transaction(&mut self) {
        if !self.tx.status().is_in_flight() {
            return;
        }
        if let Err(err) = self.tx.rollback().await {
            tracing::warn!(step = self.scope.step.id.as_str(), error = %err, "transaction rollback failed");
        }
    }

    fn start_timer(&mut self, secs: u64) {
        self.cancel_timer();
        let expired = Arc::new(AtomicBool::new(false));
        self.info.timer_expired = Arc::clone(&expired);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            expired.store(true, Ordering::SeqCst);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
