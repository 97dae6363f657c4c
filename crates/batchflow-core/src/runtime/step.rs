//! Step execution: restart handling, step listeners, the chunk or batchlet
//! body (optionally partitioned) and selection of the next element.

use std::sync::Arc;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::StepExecution;
use batchflow_types::job::Step;
use batchflow_types::status::BatchStatus;
use chrono::Utc;

use crate::error::RunnerError;
use crate::port::artifact::StepHandle;
use crate::port::repository::{CheckpointTarget, JobRepository};

use super::batchlet::run_batchlet;
use super::chunk::run_chunk;
use super::context::{ContextKind, ElementContext};
use super::listeners::ListenerRegistry;
use super::partition::run_partitioned;
use super::transition::resolve;
use super::{ElementOutcome, JobRuntime, StepScope, fail_state};

/// Run `step` inside `ctx` and pick the element that follows it.
///
/// Errors raised by the step body are recorded on the step execution and do
/// not escape; the returned error is reserved for repository failures while
/// persisting the finished step.
pub async fn run_step<R: JobRepository + 'static>(
    rt: &Arc<JobRuntime<R>>,
    step: &Step,
    ctx: &Arc<ElementContext>,
) -> Result<ElementOutcome, RunnerError> {
    let mut execution = StepExecution::new(rt.job_execution_id, step.id.clone());

    if rt.stop.is_stop_requested() {
        tracing::info!(
            job_execution_id = %rt.job_execution_id,
            step = step.id.as_str(),
            "stop requested before step started"
        );
        execution.state.status.advance(BatchStatus::Stopped);
        execution.state.ended_at = Some(Utc::now());
        rt.defer_step_execution(execution);
        return Ok(ElementOutcome::default());
    }

    let mut restart_from = None;
    if rt.is_restart && !rt.was_executed(&step.id) {
        if let Some(previous) = previous_execution(rt, step).await? {
            if previous.batch_status() == BatchStatus::Completed {
                if !step.allow_start_if_complete {
                    return Ok(skip_completed(rt, step, ctx, previous));
                }
            } else {
                execution.state.persistent_user_data = previous.state.persistent_user_data.clone();
                execution.state.reader_checkpoint = previous.state.reader_checkpoint.clone();
                execution.state.writer_checkpoint = previous.state.writer_checkpoint.clone();
                restart_from = Some(previous);
            }
        }
    }

    let mut added = false;
    if let Err(err) = execute_step(rt, step, &mut execution, restart_from.as_ref(), &mut added).await {
        tracing::error!(
            job_execution_id = %rt.job_execution_id,
            step = step.id.as_str(),
            error = %err,
            "step failed"
        );
        fail_state(&mut execution.state, &err);
    }

    match execution.batch_status() {
        BatchStatus::Started => {
            execution.state.status.advance(BatchStatus::Completed);
        }
        BatchStatus::Failed => {
            if let Some(failure) = &execution.state.failure {
                rt.record_job_failure(failure.clone());
            }
            for context in ctx.chain() {
                context.set_batch_status(BatchStatus::Failed);
            }
        }
        BatchStatus::Stopping => {
            execution.state.status.advance(BatchStatus::Stopped);
        }
        BatchStatus::Abandoned => {
            for context in ctx.chain() {
                context.set_batch_status(BatchStatus::Abandoned);
            }
        }
        _ => {}
    }
    execution.state.ended_at = Some(Utc::now());

    if added {
        rt.repository().update_step_execution(&execution).await?;
    } else {
        rt.defer_step_execution(execution.clone());
    }

    let exit_status = execution.exit_status().to_string();
    rt.publish(BatchEvent::StepFinished {
        job_execution_id: rt.job_execution_id,
        step_execution_id: execution.id,
        step_name: step.id.clone(),
        batch_status: execution.batch_status(),
        exit_status: exit_status.clone(),
    });
    tracing::info!(
        job_execution_id = %rt.job_execution_id,
        step = step.id.as_str(),
        batch_status = %execution.batch_status(),
        exit_status = exit_status.as_str(),
        "step finished"
    );

    if ctx.kind() == ContextKind::Flow {
        ctx.set_last_step_execution(execution.clone());
    }

    let next = match execution.batch_status() {
        BatchStatus::Completed => resolve(
            &step.transitions,
            &exit_status,
            step.next.as_deref(),
            ctx,
            false,
        ),
        BatchStatus::Failed => next_after_failure(rt, step, ctx, &exit_status),
        _ => None,
    };

    Ok(ElementOutcome {
        next,
        preceding: vec![execution],
        batch_status: None,
    })
}

/// The most recent execution of `step` in an earlier execution of this job
/// instance.
async fn previous_execution<R: JobRepository>(
    rt: &JobRuntime<R>,
    step: &Step,
) -> Result<Option<StepExecution>, RunnerError> {
    let previous = rt
        .repository()
        .last_step_execution(rt.instance_id, &step.id)
        .await?;
    Ok(previous.filter(|p| p.job_execution_id != rt.job_execution_id))
}

/// Carry a step that completed in the previous execution forward without
/// running it.
fn skip_completed<R: JobRepository>(
    rt: &JobRuntime<R>,
    step: &Step,
    ctx: &Arc<ElementContext>,
    previous: StepExecution,
) -> ElementOutcome {
    tracing::info!(
        job_execution_id = %rt.job_execution_id,
        step = step.id.as_str(),
        previous_execution = %previous.job_execution_id,
        "step already completed, skipping"
    );
    rt.mark_executed(&step.id);

    let mut execution = StepExecution::new(rt.job_execution_id, step.id.clone());
    execution.state = previous.state;
    if ctx.kind() == ContextKind::Flow {
        ctx.set_last_step_execution(execution.clone());
    }

    let next = resolve(
        &step.transitions,
        execution.exit_status(),
        step.next.as_deref(),
        ctx,
        false,
    );
    ElementOutcome {
        next,
        preceding: vec![execution],
        batch_status: None,
    }
}

async fn execute_step<R: JobRepository + 'static>(
    rt: &Arc<JobRuntime<R>>,
    step: &Step,
    execution: &mut StepExecution,
    restart_from: Option<&StepExecution>,
    added: &mut bool,
) -> Result<(), RunnerError> {
    if rt.was_executed(&step.id) {
        return Err(RunnerError::LoopBack {
            step: step.id.clone(),
        });
    }
    if step.start_limit > 0 {
        let starts = rt
            .repository()
            .count_step_starts(rt.instance_id, &step.id)
            .await?;
        if starts >= step.start_limit {
            return Err(RunnerError::StartLimitReached {
                step: step.id.clone(),
                limit: step.start_limit,
            });
        }
    }

    execution.state.status.advance(BatchStatus::Started);
    execution.state.started_at = Some(Utc::now());
    rt.repository().add_step_execution(execution).await?;
    *added = true;
    rt.publish(BatchEvent::StepStarted {
        job_execution_id: rt.job_execution_id,
        step_execution_id: execution.id,
        step_name: step.id.clone(),
    });
    tracing::info!(
        job_execution_id = %rt.job_execution_id,
        step = step.id.as_str(),
        restart = restart_from.is_some(),
        "step started"
    );

    if step.chunk.is_some() == step.batchlet.is_some() {
        tracing::warn!(
            step = step.id.as_str(),
            "step must declare exactly one of chunk or batchlet, abandoning"
        );
        execution.state.status.advance(BatchStatus::Abandoned);
        return Ok(());
    }

    let handle = StepHandle::new(execution.state.persistent_user_data.clone());
    let listeners = ListenerRegistry::create(
        rt.artifacts(),
        &step.listeners,
        &rt.base_context(Some(step), None, Some(&handle)),
    )?;

    for listener in &listeners.step {
        if let Err(err) = listener.before_step().await {
            listeners.destroy(rt.artifacts());
            return Err(RunnerError::Listener(err));
        }
    }

    match &step.partition {
        Some(partition) => {
            run_partitioned(rt, step, partition, execution, restart_from, &handle).await;
        }
        None => {
            let mut scope = StepScope {
                rt: rt.as_ref(),
                step,
                target: CheckpointTarget::Step(execution.id),
                handle: handle.clone(),
                listeners: &listeners,
                partition: None,
            };
            if let Some(chunk) = &step.chunk {
                run_chunk(&mut scope, chunk, &mut execution.state).await;
            } else if let Some(batchlet) = &step.batchlet {
                run_batchlet(&mut scope, batchlet, &mut execution.state).await;
            }
        }
    }
    rt.mark_executed(&step.id);

    for listener in &listeners.step {
        if let Err(err) = listener.after_step().await {
            tracing::error!(step = step.id.as_str(), error = %err, "after_step listener failed");
            fail_state(&mut execution.state, &RunnerError::Listener(err));
        }
    }
    listeners.destroy(rt.artifacts());

    if let Some(data) = handle.persistent_user_data() {
        execution.state.persistent_user_data = Some(data);
    }
    if let Some(exit_status) = handle.exit_status() {
        execution.state.status.set_exit_status(exit_status);
    }
    rt.repository()
        .save_checkpoint(&CheckpointTarget::Step(execution.id), &execution.state)
        .await?;
    Ok(())
}

/// After a failed step only an explicit transition continues the walk, and
/// never back into a step that already ran.
fn next_after_failure<R: JobRepository>(
    rt: &JobRuntime<R>,
    step: &Step,
    ctx: &Arc<ElementContext>,
    exit_status: &str,
) -> Option<String> {
    let next = resolve(&step.transitions, exit_status, None, ctx, false)?;
    if rt.was_executed(&next) {
        tracing::warn!(
            step = step.id.as_str(),
            next = next.as_str(),
            "not following transition back to an executed step"
        );
        return None;
    }
    if rt.stop.is_stop_requested() {
        return None;
    }
    for context in ctx.chain() {
        context.reopen();
    }
    Some(next)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use batchflow_types::execution::JobExecution;
    use batchflow_types::job::{Chunk, JobDefinition, Properties, RefArtifact, Transition};
    use serde_json::json;

    use super::*;
    use crate::port::repository::JobRepository as _;
    use crate::test_support::*;

    async fn start_runtime(
        repository: &MemoryRepository,
        artifacts: FnArtifacts,
        step: &Step,
    ) -> Arc<JobRuntime<MemoryRepository>> {
        let job = JobDefinition::new("job").with_element(step.clone());
        let execution = JobExecution::new("job", Properties::new());
        repository.create_job_execution(&execution).await.unwrap();
        let rt = JobRuntime::new(services(repository.clone(), artifacts), &job, execution);
        rt.job_ctx.set_batch_status(BatchStatus::Started);
        rt
    }

    /// A previous execution holding one `step` record in `previous_state`,
    /// and a runtime restarting it.
    async fn restart_runtime(
        repository: &MemoryRepository,
        artifacts: FnArtifacts,
        step: &Step,
        previous_state: batchflow_types::execution::ExecutionState,
    ) -> Arc<JobRuntime<MemoryRepository>> {
        let job = JobDefinition::new("job").with_element(step.clone());
        let first = JobExecution::new("job", Properties::new());
        repository.create_job_execution(&first).await.unwrap();
        let mut previous = StepExecution::new(first.id, step.id.clone());
        previous.state = previous_state;
        repository.add_step_execution(&previous).await.unwrap();

        let second = JobExecution::restart_of(&first, Properties::new());
        repository.create_job_execution(&second).await.unwrap();
        let rt = JobRuntime::new(services(repository.clone(), artifacts), &job, second);
        rt.job_ctx.set_batch_status(BatchStatus::Started);
        rt
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn completed_step_is_persisted_and_follows_next() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, Some("DONE")));
        let step = batchlet_step("a", "task").with_next("b");
        let rt = start_runtime(&repository, artifacts, &step).await;

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(outcome.next.as_deref(), Some("b"));
        assert_eq!(outcome.preceding.len(), 1);

        let stored = repository.step("a").unwrap();
        assert_eq!(stored.batch_status(), BatchStatus::Completed);
        assert_eq!(stored.exit_status(), "DONE");
        assert!(stored.state.started_at.is_some());
        assert!(stored.state.ended_at.is_some());
        assert!(rt.was_executed("a"));
    }

    #[tokio::test]
    async fn step_without_body_is_abandoned() {
        let repository = MemoryRepository::default();
        let step = Step::new("empty").with_next("b");
        let rt = start_runtime(&repository, FnArtifacts::new(), &step).await;

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert!(outcome.next.is_none());
        assert_eq!(repository.step("empty").unwrap().batch_status(), BatchStatus::Abandoned);
        assert_eq!(rt.job_ctx.batch_status(), BatchStatus::Abandoned);
    }

    #[tokio::test]
    async fn loop_back_fails_the_step() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, None));
        let step = batchlet_step("a", "task");
        let rt = start_runtime(&repository, artifacts, &step).await;
        rt.mark_executed("a");

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert!(outcome.next.is_none());
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(rt.job_ctx.batch_status(), BatchStatus::Failed);
        assert_eq!(rt.execution().failure.unwrap().kind, "loop_back");

        let deferred = rt.take_deferred_step_executions();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].batch_status(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn start_limit_counts_earlier_starts() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, None));
        let step = batchlet_step("a", "task").with_start_limit(1);
        let mut failed = batchflow_types::execution::ExecutionState::default();
        failed.status.advance(BatchStatus::Failed);
        let rt = restart_runtime(&repository, artifacts, &step, failed).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(rt.execution().failure.unwrap().kind, "start_limit");
    }

    #[tokio::test]
    async fn failed_step_continues_only_through_explicit_transition() {
        let repository = MemoryRepository::default();
        let artifacts = FnArtifacts::new().with("task", failing_batchlet("io"));
        let step = batchlet_step("a", "task")
            .with_next("never")
            .with_transition(Transition::next("FAILED", "cleanup"));
        let rt = start_runtime(&repository, artifacts, &step).await;

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(outcome.next.as_deref(), Some("cleanup"));
        assert_eq!(rt.job_ctx.batch_status(), BatchStatus::Started);
        assert_eq!(repository.step("a").unwrap().batch_status(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn failed_step_without_transition_fails_job_context() {
        let repository = MemoryRepository::default();
        let artifacts = FnArtifacts::new().with("task", failing_batchlet("io"));
        let step = batchlet_step("a", "task").with_next("b");
        let rt = start_runtime(&repository, artifacts, &step).await;

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert!(outcome.next.is_none());
        assert_eq!(rt.job_ctx.batch_status(), BatchStatus::Failed);
        assert_eq!(rt.execution().failure.unwrap().kind, "io");
    }

    #[tokio::test]
    async fn after_step_listener_failure_fails_step() {
        let repository = MemoryRepository::default();
        let events = log();
        let runs = log();
        let artifacts = FnArtifacts::new()
            .with("task", logging_batchlet(&runs, None))
            .with("listener", recording_listener(&events, Some("after_step")));
        let step = batchlet_step("a", "task").with_listener(RefArtifact::new("listener"));
        let rt = start_runtime(&repository, artifacts, &step).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["before_step", "after_step"]);
        assert_eq!(runs.lock().unwrap().len(), 1);
        assert_eq!(repository.step("a").unwrap().batch_status(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn step_listeners_are_destroyed_when_step_ends() {
        let repository = MemoryRepository::default();
        let events = log();
        let artifacts = FnArtifacts::new()
            .with("task", logging_batchlet(&log(), None))
            .with("listener", recording_listener(&events, None));
        let step = batchlet_step("a", "task").with_listener(RefArtifact::new("listener"));
        let rt = start_runtime(&repository, artifacts.clone(), &step).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["before_step", "after_step"]);
        assert_eq!(artifacts.destroyed(), vec!["batchlet", "listener"]);
    }

    #[tokio::test]
    async fn before_step_listener_failure_skips_body() {
        let repository = MemoryRepository::default();
        let events = log();
        let runs = log();
        let artifacts = FnArtifacts::new()
            .with("task", logging_batchlet(&runs, None))
            .with("listener", recording_listener(&events, Some("before_step")));
        let step = batchlet_step("a", "task").with_listener(RefArtifact::new("listener"));
        let rt = start_runtime(&repository, artifacts, &step).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["before_step"]);
        assert!(runs.lock().unwrap().is_empty());
        let stored = repository.step("a").unwrap();
        assert_eq!(stored.batch_status(), BatchStatus::Failed);
        assert_eq!(stored.state.failure.unwrap().kind, "listener");
    }

    #[tokio::test]
    async fn restart_skips_completed_step() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, None));
        let step = batchlet_step("a", "task")
            .with_transition(Transition::next("PARTIAL", "fixup"))
            .with_next("b");
        let mut completed = batchflow_types::execution::ExecutionState::default();
        completed.status.advance(BatchStatus::Completed);
        completed.status.set_exit_status("PARTIAL");
        let rt = restart_runtime(&repository, artifacts, &step, completed).await;

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(outcome.next.as_deref(), Some("fixup"));
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(repository.steps().len(), 1);
        assert_eq!(outcome.preceding[0].exit_status(), "PARTIAL");
    }

    #[tokio::test]
    async fn restart_reruns_completed_step_when_allowed() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, None));
        let step = batchlet_step("a", "task").allow_start_if_complete(true);
        let mut completed = batchflow_types::execution::ExecutionState::default();
        completed.status.advance(BatchStatus::Completed);
        let rt = restart_runtime(&repository, artifacts, &step, completed).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert_eq!(runs.lock().unwrap().len(), 1);
        assert_eq!(repository.steps().len(), 2);
    }

    #[tokio::test]
    async fn restart_resumes_from_last_checkpoint() {
        let repository = MemoryRepository::default();
        let written = list_writer();
        let artifacts = FnArtifacts::new()
            .with("reader", range_reader(30))
            .with("writer", written.factory());
        let step = chunk_step(
            "load",
            Chunk::new(RefArtifact::new("reader"), RefArtifact::new("writer")).with_item_count(10),
        );
        let mut failed = batchflow_types::execution::ExecutionState::default();
        failed.status.advance(BatchStatus::Failed);
        failed.reader_checkpoint = Some(json!(20));
        let rt = restart_runtime(&repository, artifacts, &step, failed).await;

        run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        let stored = repository
            .steps()
            .into_iter()
            .find(|s| s.job_execution_id == rt.job_execution_id)
            .unwrap();
        assert_eq!(stored.batch_status(), BatchStatus::Completed);
        assert_eq!(stored.metrics().read_count(), 10);
        assert_eq!(written.items().len(), 10);
        assert_eq!(stored.state.reader_checkpoint, Some(json!(30)));
    }

    #[tokio::test]
    async fn stop_before_start_defers_stopped_record() {
        let repository = MemoryRepository::default();
        let runs = log();
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&runs, None));
        let step = batchlet_step("a", "task").with_next("b");
        let rt = start_runtime(&repository, artifacts, &step).await;
        rt.stop.request_stop();

        let outcome = run_step(&rt, &step, &rt.job_ctx).await.unwrap();
        assert!(outcome.next.is_none());
        assert!(runs.lock().unwrap().is_empty());
        assert!(repository.steps().is_empty());
        let deferred = rt.take_deferred_step_executions();
        assert_eq!(deferred[0].batch_status(), BatchStatus::Stopped);
    }
}
