//! Walking the elements of a job or flow.

use std::sync::Arc;

use batchflow_types::execution::StepExecution;
use batchflow_types::job::JobElement;
use futures_util::future::BoxFuture;

use crate::error::RunnerError;
use crate::port::repository::JobRepository;

use super::context::ElementContext;
use super::decision::run_decision;
use super::flow::run_flow;
use super::split::run_split;
use super::step::run_step;
use super::{ElementOutcome, JobRuntime};

/// Run `elements` inside `ctx`, from the element named `start` or from the
/// head, following each element's next element until none remains.
///
/// Boxed because flows and splits recurse back into it.
pub(crate) fn run_elements<'a, R: JobRepository + 'static>(
    rt: &'a Arc<JobRuntime<R>>,
    elements: &'a [JobElement],
    ctx: &'a Arc<ElementContext>,
    start: Option<String>,
) -> BoxFuture<'a, Result<(), RunnerError>> {
    Box::pin(async move {
        let mut current = match start {
            Some(id) => find(elements, &id, ctx)?,
            None => match elements.first() {
                Some(JobElement::Decision(decision)) => {
                    return Err(RunnerError::DecisionFirst {
                        id: decision.id.clone(),
                        container: ctx.id().to_string(),
                    });
                }
                Some(head) => head,
                None => return Ok(()),
            },
        };
        let mut preceding: Vec<StepExecution> = Vec::new();

        loop {
            tracing::debug!(
                job_execution_id = %rt.job_execution_id,
                container = ctx.id(),
                element = current.id(),
                "running element"
            );
            let outcome: ElementOutcome = match current {
                JobElement::Step(step) => run_step(rt, step, ctx).await?,
                JobElement::Flow(flow) => run_flow(rt, flow, ctx).await,
                JobElement::Split(split) => run_split(rt, split, ctx).await,
                JobElement::Decision(decision) => run_decision(rt, decision, ctx, &preceding).await,
            };

            let Some(next) = outcome.next else {
                return Ok(());
            };
            preceding = outcome.preceding;
            current = find(elements, &next, ctx)?;
        }
    })
}

fn find<'a>(
    elements: &'a [JobElement],
    id: &str,
    ctx: &ElementContext,
) -> Result<&'a JobElement, RunnerError> {
    elements
        .iter()
        .find(|element| element.id() == id)
        .ok_or_else(|| RunnerError::UnknownElement {
            id: id.to_string(),
            container: ctx.id().to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
