//! Split elements: child flows run concurrently, joined before moving on.

use std::sync::Arc;
use std::time::Duration;

use batchflow_types::job::Split;
use batchflow_types::status::BatchStatus;
use tokio::task::JoinSet;

use crate::error::RunnerError;
use crate::port::repository::JobRepository;

use super::context::{ContextKind, ElementContext};
use super::flow::{finish_composite, run_flow};
use super::{ElementOutcome, JobRuntime};

/// Run every flow of `split` as its own task and wait for all of them.
///
/// The wait is bounded by the split's timeout, or the engine default when the
/// split sets none. Running out of time aborts the remaining flows and fails
/// the split. The outcome carries the last step execution of each flow, in
/// declaration order, for a decision that may follow.
pub async fn run_split<R: JobRepository + 'static>(
    rt: &Arc<JobRuntime<R>>,
    split: &Split,
    parent: &Arc<ElementContext>,
) -> ElementOutcome {
    let split_ctx = parent.child(split.id.clone(), ContextKind::Split);
    split_ctx.set_batch_status(BatchStatus::Started);
    tracing::debug!(
        job_execution_id = %rt.job_execution_id,
        split = split.id.as_str(),
        flows = split.flows.len(),
        "split started"
    );

    let mut set = JoinSet::new();
    for (index, flow) in split.flows.iter().enumerate() {
        let rt = Arc::clone(rt);
        let ctx = Arc::clone(&split_ctx);
        let flow = flow.clone();
        set.spawn(async move {
            let outcome = run_flow(&rt, &flow, &ctx).await;
            (index, outcome)
        });
    }

    let timeout_secs = split
        .timeout_secs
        .or(rt.services.config.split_timeout_secs);
    let results = match timeout_secs {
        Some(secs) => {
            let drained = tokio::time::timeout(Duration::from_secs(secs), drain(&mut set)).await;
            match drained {
                Ok(results) => results,
                Err(_) => {
                    set.abort_all();
                    Err(RunnerError::SplitTimeout {
                        split: split.id.clone(),
                        secs,
                    })
                }
            }
        }
        None => drain(&mut set).await,
    };

    let mut preceding = Vec::new();
    match results {
        Ok(mut finished) => {
            finished.sort_by_key(|(index, _)| *index);
            let any_failed = finished
                .iter()
                .any(|(_, outcome)| outcome.batch_status == Some(BatchStatus::Failed));
            for (_, outcome) in finished {
                preceding.extend(outcome.preceding);
            }
            // A sibling continuing past a failed step reopens the shared
            // contexts, so settle on the flows' own statuses.
            if any_failed {
                for context in split_ctx.chain() {
                    context.terminate(BatchStatus::Failed);
                }
            }
        }
        Err(err) => {
            tracing::error!(
                job_execution_id = %rt.job_execution_id,
                split = split.id.as_str(),
                error = %err,
                "split failed"
            );
            rt.record_job_failure(err.failure_info());
            for context in split_ctx.chain() {
                context.set_batch_status(BatchStatus::Failed);
            }
        }
    }

    finish_composite(rt, &split_ctx);
    let next = if split_ctx.batch_status() == BatchStatus::Completed && !split_ctx.is_ended() {
        split.next.clone()
    } else {
        None
    };
    tracing::debug!(
        split = split.id.as_str(),
        batch_status = %split_ctx.batch_status(),
        next = ?next,
        "split finished"
    );

    ElementOutcome {
        next,
        preceding,
        batch_status: None,
    }
}

/// Wait for every flow task. A task that panicked or was cancelled is an
/// error; the remaining tasks are still awaited.
async fn drain(
    set: &mut JoinSet<(usize, ElementOutcome)>,
) -> Result<Vec<(usize, ElementOutcome)>, RunnerError> {
    let mut finished = Vec::new();
    let mut join_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => finished.push(result),
            Err(err) => {
                tracing::error!(error = %err, "split flow task failed");
                join_error.get_or_insert_with(|| RunnerError::Join(err.to_string()));
            }
        }
    }
    match join_error {
        Some(err) => Err(err),
        None => Ok(finished),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
