//! Top-level job execution.

use std::sync::Arc;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::JobExecution;
use batchflow_types::status::BatchStatus;
use chrono::Utc;

use crate::error::RunnerError;
use crate::port::repository::JobRepository;

use super::JobRuntime;
use super::composite::run_elements;
use super::listeners::ListenerRegistry;

/// Run a job execution to its end and return the final record.
///
/// The walk starts at the head of the job, or at the restart position left by
/// a `stop` transition of the execution being restarted. Job listener
/// failures are fatal: a failing `before_job` skips the walk, a failing
/// `after_job` fails an otherwise successful job. Step executions that never
/// got persisted (stopped before they started, loop-backs, start limits) are
/// stored before the job record is finalized.
pub async fn run_job<R: JobRepository + 'static>(rt: Arc<JobRuntime<R>>) -> JobExecution {
    let restart_position = rt.execution().restart_position;
    let started = rt.update_execution(|execution| {
        execution.status.advance(BatchStatus::Started);
        execution.started_at = Some(Utc::now());
        execution.restart_position = None;
    });
    rt.job_ctx.set_batch_status(BatchStatus::Started);
    if let Err(err) = rt.repository().update_job_execution(&started).await {
        fail_job(&rt, &RunnerError::from(err));
    }
    rt.publish(BatchEvent::JobStarted {
        job_execution_id: rt.job_execution_id,
        job_name: rt.job.id.clone(),
        restart: rt.is_restart,
    });
    tracing::info!(
        job_execution_id = %rt.job_execution_id,
        job = rt.job.id.as_str(),
        restart = rt.is_restart,
        restart_position = ?restart_position,
        "job started"
    );

    let listeners = match ListenerRegistry::create(
        rt.artifacts(),
        &rt.job.listeners,
        &rt.base_context(None, None, None),
    ) {
        Ok(listeners) => Some(listeners),
        Err(err) => {
            fail_job(&rt, &err);
            None
        }
    };

    if let Some(listeners) = &listeners {
        if before_job(&rt, listeners).await {
            if rt.job_ctx.batch_status() != BatchStatus::Failed {
                if let Err(err) = run_elements(&rt, &rt.job.elements, &rt.job_ctx, restart_position).await {
                    fail_job(&rt, &err);
                }
            }
            for listener in &listeners.job {
                if let Err(err) = listener.after_job().await {
                    fail_job(&rt, &RunnerError::Listener(err));
                }
            }
        }
    }
    if let Some(listeners) = listeners {
        listeners.destroy(rt.artifacts());
    }

    match rt.job_ctx.batch_status() {
        BatchStatus::Started => {
            rt.job_ctx.set_batch_status(BatchStatus::Completed);
        }
        BatchStatus::Stopping => {
            rt.job_ctx.set_batch_status(BatchStatus::Stopped);
        }
        _ => {}
    }

    for execution in rt.take_deferred_step_executions() {
        if let Err(err) = rt.repository().add_step_execution(&execution).await {
            tracing::error!(
                job_execution_id = %rt.job_execution_id,
                step = execution.step_name.as_str(),
                error = %err,
                "failed to persist step execution"
            );
        }
    }

    let finished = rt.update_execution(|execution| {
        execution.status = rt.job_ctx.status();
        execution.restart_position = rt.job_ctx.restart_position();
        execution.ended_at = Some(Utc::now());
    });
    if let Err(err) = rt.repository().update_job_execution(&finished).await {
        tracing::error!(
            job_execution_id = %rt.job_execution_id,
            error = %err,
            "failed to persist finished job execution"
        );
    }

    rt.publish(BatchEvent::JobFinished {
        job_execution_id: rt.job_execution_id,
        job_name: rt.job.id.clone(),
        batch_status: finished.batch_status(),
        exit_status: finished.exit_status().to_string(),
    });
    tracing::info!(
        job_execution_id = %rt.job_execution_id,
        job = rt.job.id.as_str(),
        batch_status = %finished.batch_status(),
        exit_status = finished.exit_status(),
        "job finished"
    );
    finished
}

/// Run every `before_job` callback; `false` once one of them failed.
async fn before_job<R: JobRepository>(rt: &JobRuntime<R>, listeners: &ListenerRegistry) -> bool {
    for listener in &listeners.job {
        if let Err(err) = listener.before_job().await {
            fail_job(rt, &RunnerError::Listener(err));
            return false;
        }
    }
    true
}

fn fail_job<R: JobRepository>(rt: &JobRuntime<R>, err: &RunnerError) {
    tracing::error!(
        job_execution_id = %rt.job_execution_id,
        job = rt.job.id.as_str(),
        error = %err,
        "job failed"
    );
    rt.record_job_failure(err.failure_info());
    // Also overrides a COMPLETED set by an `end` transition.
    rt.job_ctx.terminate(BatchStatus::Failed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
