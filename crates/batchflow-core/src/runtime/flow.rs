//! Flow elements: a nested sub-graph walked like the job itself.

use std::sync::Arc;

use batchflow_types::job::Flow;
use batchflow_types::status::BatchStatus;

use crate::port::repository::JobRepository;

use super::composite::run_elements;
use super::context::{ContextKind, ElementContext};
use super::transition::resolve;
use super::{ElementOutcome, JobRuntime};

/// Run `flow` in a child context of `parent` and pick the element that
/// follows it in `parent`.
///
/// The flow's own transitions are consulted only when it completed and was
/// not already finished by a terminating transition inside it.
pub async fn run_flow<R: JobRepository + 'static>(
    rt: &Arc<JobRuntime<R>>,
    flow: &Flow,
    parent: &Arc<ElementContext>,
) -> ElementOutcome {
    let flow_ctx = parent.child(flow.id.clone(), ContextKind::Flow);
    flow_ctx.set_batch_status(BatchStatus::Started);
    tracing::debug!(
        job_execution_id = %rt.job_execution_id,
        flow = flow.id.as_str(),
        "flow started"
    );

    if let Err(err) = run_elements(rt, &flow.elements, &flow_ctx, None).await {
        tracing::error!(
            job_execution_id = %rt.job_execution_id,
            flow = flow.id.as_str(),
            error = %err,
            "flow failed"
        );
        rt.record_job_failure(err.failure_info());
        for context in flow_ctx.chain() {
            context.set_batch_status(BatchStatus::Failed);
        }
    }

    finish_composite(rt, &flow_ctx);
    let last = flow_ctx.last_step_execution();
    if let Some(execution) = &last {
        if parent.kind() == ContextKind::Flow {
            parent.set_last_step_execution(execution.clone());
        }
    }

    let next = if flow_ctx.batch_status() == BatchStatus::Completed && !flow_ctx.is_ended() {
        resolve(
            &flow.transitions,
            &flow_ctx.exit_status(),
            flow.next.as_deref(),
            parent,
            false,
        )
    } else {
        None
    };
    tracing::debug!(
        flow = flow.id.as_str(),
        batch_status = %flow_ctx.batch_status(),
        next = ?next,
        "flow finished"
    );

    ElementOutcome {
        next,
        preceding: last.into_iter().collect(),
        batch_status: Some(flow_ctx.batch_status()),
    }
}

/// Settle a flow or split context once its elements have run: a stop request
/// turns it STOPPED, otherwise a context still STARTED has completed.
pub(crate) fn finish_composite<R: JobRepository>(rt: &JobRuntime<R>, ctx: &ElementContext) {
    if rt.stop.is_stop_requested() {
        ctx.set_batch_status(BatchStatus::Stopping);
    }
    match ctx.batch_status() {
        BatchStatus::Started => {
            ctx.set_batch_status(BatchStatus::Completed);
        }
        BatchStatus::Stopping => {
            ctx.set_batch_status(BatchStatus::Stopped);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
