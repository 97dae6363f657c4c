//! Decision elements: route on the exit status chosen by a decider.

use std::sync::Arc;

use batchflow_types::execution::StepExecution;
use batchflow_types::job::Decision;
use batchflow_types::status::BatchStatus;

use crate::error::RunnerError;
use crate::port::artifact::{Artifact, create_decider};
use crate::port::repository::JobRepository;

use super::context::ElementContext;
use super::transition::resolve;
use super::{ElementOutcome, JobRuntime};

/// Ask the decider for an exit status given the executions that ran just
/// before the decision, set it on `ctx` and resolve the transitions.
///
/// A decider failure fails `ctx` and every enclosing context.
pub(crate) async fn run_decision<R: JobRepository>(
    rt: &Arc<JobRuntime<R>>,
    decision: &Decision,
    ctx: &Arc<ElementContext>,
    preceding: &[StepExecution],
) -> ElementOutcome {
    let exit_status = match decide(rt, decision, preceding).await {
        Ok(exit_status) => exit_status,
        Err(err) => {
            tracing::error!(
                job_execution_id = %rt.job_execution_id,
                decision = decision.id.as_str(),
                error = %err,
                "decision failed"
            );
            rt.record_job_failure(err.failure_info());
            for context in ctx.chain() {
                context.set_batch_status(BatchStatus::Failed);
            }
            return ElementOutcome::default();
        }
    };

    tracing::debug!(
        decision = decision.id.as_str(),
        exit_status = exit_status.as_str(),
        "decided"
    );
    ctx.set_exit_status(exit_status.clone());
    let next = resolve(&decision.transitions, &exit_status, None, ctx, true);

    ElementOutcome {
        next,
        preceding: preceding.to_vec(),
        batch_status: None,
    }
}

async fn decide<R: JobRepository>(
    rt: &JobRuntime<R>,
    decision: &Decision,
    preceding: &[StepExecution],
) -> Result<String, RunnerError> {
    let ctx = rt.artifact_context(&decision.decider, None, None, None);
    let mut decider = create_decider(rt.artifacts(), &decision.decider, &ctx)?;
    let result = decider.decide(preceding).await;
    rt.artifacts().destroy(Artifact::Decider(decider));
    Ok(result?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
