//! Job operator: start, restart, stop, abandon and wait for job executions.
//!
//! Every started execution runs as its own tokio task. The operator keeps the
//! stop signal and a completion channel of each running execution in a
//! `DashMap` keyed by execution id; entries are removed when the job runner
//! returns. Finished executions are looked up in the repository.

use std::sync::Arc;
use std::time::Duration;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::JobExecution;
use batchflow_types::job::{JobDefinition, Properties};
use batchflow_types::status::BatchStatus;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::port::repository::JobRepository;
use crate::runtime::job::run_job;
use crate::runtime::stop::StopSignal;
use crate::runtime::{JobRuntime, Services};

struct RunningJob {
    stop: StopSignal,
    done: watch::Receiver<Option<JobExecution>>,
}

/// Entry point for hosts running batch jobs.
///
/// Generic over `R: JobRepository` for storage flexibility.
pub struct JobOperator<R: JobRepository> {
    services: Services<R>,
    running: Arc<DashMap<Uuid, RunningJob>>,
}

impl<R: JobRepository + 'static> JobOperator<R> {
    pub fn new(services: Services<R>) -> Self {
        Self {
            services,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn repository(&self) -> &R {
        &self.services.repository
    }

    /// Subscribe to lifecycle events of every execution started from here.
    pub fn events(&self) -> broadcast::Receiver<BatchEvent> {
        self.services.event_bus.subscribe()
    }

    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.running.contains_key(&execution_id)
    }

    /// Start a new execution of `job` and return its id without waiting.
    pub async fn start(&self, job: &JobDefinition, parameters: Properties) -> Result<Uuid, RunnerError> {
        let execution = JobExecution::new(job.id.clone(), parameters);
        self.services.repository.create_job_execution(&execution).await?;
        Ok(self.launch(job, execution))
    }

    /// Start `job` and wait for it to finish.
    pub async fn run(&self, job: &JobDefinition, parameters: Properties) -> Result<JobExecution, RunnerError> {
        let id = self.start(job, parameters).await?;
        self.wait_for_completion(id, None).await
    }

    /// Start a new execution of the job instance behind `execution_id`.
    ///
    /// Only a STOPPED or FAILED execution that is no longer running can be
    /// restarted, and only when the job is restartable.
    pub async fn restart(
        &self,
        execution_id: Uuid,
        job: &JobDefinition,
        parameters: Properties,
    ) -> Result<Uuid, RunnerError> {
        let previous = self.get_execution(execution_id).await?;
        if !job.restartable {
            return Err(RunnerError::NotRestartable(job.id.clone()));
        }
        let status = previous.batch_status();
        if self.is_running(execution_id) || !matches!(status, BatchStatus::Stopped | BatchStatus::Failed) {
            return Err(RunnerError::InvalidState {
                execution: execution_id,
                status,
            });
        }

        let execution = JobExecution::restart_of(&previous, parameters);
        self.services.repository.create_job_execution(&execution).await?;
        tracing::info!(
            job = job.id.as_str(),
            previous_execution = %execution_id,
            job_execution_id = %execution.id,
            restart_position = ?execution.restart_position,
            "restarting job"
        );
        Ok(self.launch(job, execution))
    }

    /// Ask a running execution to stop. Returns once the request is posted.
    pub async fn stop(&self, execution_id: Uuid) -> Result<(), RunnerError> {
        let stop = self.running.get(&execution_id).map(|job| job.stop.clone());
        let Some(stop) = stop else {
            let execution = self.get_execution(execution_id).await?;
            return Err(RunnerError::InvalidState {
                execution: execution_id,
                status: execution.batch_status(),
            });
        };

        tracing::info!(job_execution_id = %execution_id, "stop requested");
        stop.request_stop();
        self.services.event_bus.publish(BatchEvent::StopRequested {
            job_execution_id: execution_id,
        });
        Ok(())
    }

    /// Mark a finished execution ABANDONED so it can no longer be restarted.
    pub async fn abandon(&self, execution_id: Uuid) -> Result<JobExecution, RunnerError> {
        let mut execution = self.get_execution(execution_id).await?;
        let status = execution.batch_status();
        if self.is_running(execution_id)
            || matches!(
                status,
                BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
            )
        {
            return Err(RunnerError::InvalidState {
                execution: execution_id,
                status,
            });
        }

        execution.status.advance(BatchStatus::Abandoned);
        self.services.repository.update_job_execution(&execution).await?;
        tracing::info!(job_execution_id = %execution_id, previous = %status, "job execution abandoned");
        Ok(execution)
    }

    /// Wait until `execution_id` finishes and return its final record.
    ///
    /// `timeout` defaults to the engine's `job_wait_timeout_secs`; without
    /// either the wait is unbounded.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<JobExecution, RunnerError> {
        let done = self.running.get(&execution_id).map(|job| job.done.clone());
        let Some(done) = done else {
            return self.get_execution(execution_id).await;
        };

        let timeout = timeout.or(self.services.config.job_wait_timeout_secs.map(Duration::from_secs));
        let finished = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait_done(done))
                .await
                .map_err(|_| RunnerError::WaitTimeout(execution_id))?,
            None => wait_done(done).await,
        };

        match finished {
            Some(execution) => Ok(execution),
            None => self.get_execution(execution_id).await,
        }
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<JobExecution, RunnerError> {
        self.services
            .repository
            .get_job_execution(execution_id)
            .await?
            .ok_or(RunnerError::ExecutionNotFound(execution_id))
    }

    fn launch(&self, job: &JobDefinition, execution: JobExecution) -> Uuid {
        let id = execution.id;
        let rt = JobRuntime::new(self.services.clone(), job, execution);
        let (done_tx, done_rx) = watch::channel(None);
        self.running.insert(
            id,
            RunningJob {
                stop: rt.stop.clone(),
                done: done_rx,
            },
        );

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let finished = run_job(rt).await;
            let _ = done_tx.send(Some(finished));
            running.remove(&id);
        });
        id
    }
}

/// The final record, or `None` if the job task ended without reporting.
async fn wait_done(mut done: watch::Receiver<Option<JobExecution>>) -> Option<JobExecution> {
    let finished = done.wait_for(Option::is_some).await.ok()?.clone();
    finished
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
