//! Task-oriented step body.

use batchflow_types::execution::ExecutionState;
use batchflow_types::job::RefArtifact;
use batchflow_types::status::BatchStatus;

use crate::error::RunnerError;
use crate::port::artifact::{Artifact, Batchlet, create_batchlet};
use crate::port::repository::JobRepository;

use super::{StepScope, fail_state};

/// Run the batchlet of a step or partition.
///
/// A stop request while `process` is running moves the execution to STOPPING
/// and calls `Batchlet::stop`; `process` is still awaited to completion. A
/// successful run leaves the status for the caller to translate.
pub(crate) async fn run_batchlet<R: JobRepository>(
    scope: &mut StepScope<'_, R>,
    artifact: &RefArtifact,
    state: &mut ExecutionState,
) {
    let ctx = scope.artifact_context(artifact);
    let batchlet = match create_batchlet(scope.rt.artifacts(), artifact, &ctx) {
        Ok(batchlet) => batchlet,
        Err(err) => {
            let err = RunnerError::from(err);
            tracing::error!(step = scope.step.id.as_str(), error = %err, "failed to create batchlet");
            fail_state(state, &err);
            return;
        }
    };

    if let Err(err) = process(scope, batchlet.as_ref(), state).await {
        tracing::error!(
            step = scope.step.id.as_str(),
            partition = ?scope.partition_index(),
            error = %err,
            "batchlet failed"
        );
        fail_state(state, &err);
    }

    scope.rt.artifacts().destroy(Artifact::Batchlet(batchlet));
}

async fn process<R: JobRepository>(
    scope: &mut StepScope<'_, R>,
    batchlet: &dyn Batchlet,
    state: &mut ExecutionState,
) -> Result<(), RunnerError> {
    let process = batchlet.process();
    tokio::pin!(process);

    let result = tokio::select! {
        biased;
        result = &mut process => result,
        _ = scope.rt.stop.cancelled() => {
            state.status.advance(BatchStatus::Stopping);
            tracing::info!(step = scope.step.id.as_str(), "stopping batchlet");
            if let Err(err) = batchlet.stop().await {
                tracing::warn!(step = scope.step.id.as_str(), error = %err, "batchlet stop failed");
            }
            process.await
        }
    };

    if let Some(exit_status) = result? {
        scope.handle.set_exit_status(exit_status);
    }
    scope.send_collector_data().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use batchflow_types::job::JobDefinition;
    use uuid::Uuid;

    use super::*;
    use crate::port::artifact::StepHandle;
    use crate::port::repository::CheckpointTarget;
    use crate::runtime::listeners::ListenerRegistry;
    use crate::test_support::*;

    async fn run(artifacts: FnArtifacts, stop_after: Option<std::time::Duration>) -> (ExecutionState, StepHandle) {
        let step = batchlet_step("task", "task");
        let job = JobDefinition::new("job").with_element(step.clone());
        let rt = runtime_for(MemoryRepository::default(), artifacts, &job);
        if let Some(delay) = stop_after {
            let stop = rt.stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                stop.request_stop();
            });
        }
        let listeners = ListenerRegistry::default();
        let handle = StepHandle::new(None);
        let mut scope = StepScope {
            rt: &rt,
            step: &step,
            target: CheckpointTarget::Step(Uuid::now_v7()),
            handle: handle.clone(),
            listeners: &listeners,
            partition: None,
        };
        let mut state = ExecutionState::default();
        state.status.advance(BatchStatus::Started);
        let artifact = step.batchlet.clone().unwrap();
        run_batchlet(&mut scope, &artifact, &mut state).await;
        (state, handle)
    }

    #[tokio::test]
    async fn returned_exit_status_is_kept() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let artifacts = FnArtifacts::new().with("task", logging_batchlet(&log, Some("DONE")));

        let (state, handle) = run(artifacts, None).await;
        assert_eq!(state.batch_status(), BatchStatus::Started);
        assert_eq!(handle.exit_status().as_deref(), Some("DONE"));
        assert_eq!(*log.lock().unwrap(), vec!["task".to_string()]);
    }

    #[tokio::test]
    async fn failure_is_recorded() {
        let artifacts = FnArtifacts::new().with("task", failing_batchlet("boom"));

        let (state, handle) = run(artifacts, None).await;
        assert_eq!(state.batch_status(), BatchStatus::Failed);
        assert_eq!(state.failure.as_ref().unwrap().kind, "boom");
        assert!(handle.exit_status().is_none());
    }

    #[tokio::test]
    async fn stop_request_reaches_running_batchlet() {
        let artifacts = FnArtifacts::new().with("task", blocking_batchlet("INTERRUPTED"));

        let (state, handle) = run(artifacts, Some(std::time::Duration::from_millis(20))).await;
        assert_eq!(state.batch_status(), BatchStatus::Stopping);
        assert_eq!(handle.exit_status().as_deref(), Some("INTERRUPTED"));
    }

    #[tokio::test]
    async fn unknown_batchlet_fails_setup() {
        let (state, _) = run(FnArtifacts::new(), None).await;
        assert_eq!(state.batch_status(), BatchStatus::Failed);
        assert_eq!(state.failure.as_ref().unwrap().kind, "artifact_creation");
    }
}
