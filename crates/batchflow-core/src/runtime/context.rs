//! Runtime contexts of composite elements (job, flow, split).
//!
//! Contexts form a parent chain from the innermost composite up to the job.
//! Flows running in a split share the real job context as their root, so a
//! status set through one flow is visible to all of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use batchflow_types::execution::StepExecution;
use batchflow_types::status::{BatchStatus, ExecutionStatus};

use super::stop::StopObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Job,
    Flow,
    Split,
}

#[derive(Debug)]
pub struct ElementContext {
    id: String,
    kind: ContextKind,
    parent: Option<Arc<ElementContext>>,
    status: Mutex<ExecutionStatus>,
    ended: AtomicBool,
    restart_position: Mutex<Option<String>>,
    last_step_execution: Mutex<Option<StepExecution>>,
}

impl ElementContext {
    /// Root context of a job execution.
    pub fn job(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(id.into(), ContextKind::Job, None))
    }

    /// A flow or split context nested in `self`.
    pub fn child(self: &Arc<Self>, id: impl Into<String>, kind: ContextKind) -> Arc<Self> {
        Arc::new(Self::build(id.into(), kind, Some(Arc::clone(self))))
    }

    fn build(id: String, kind: ContextKind, parent: Option<Arc<Self>>) -> Self {
        Self {
            id,
            kind,
            parent,
            status: Mutex::new(ExecutionStatus::default()),
            ended: AtomicBool::new(false),
            restart_position: Mutex::new(None),
            last_step_execution: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Arc<ElementContext>> {
        self.parent.as_ref()
    }

    /// `self` followed by every enclosing context up to the job.
    pub fn chain(self: &Arc<Self>) -> Vec<Arc<ElementContext>> {
        let mut chain = vec![Arc::clone(self)];
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            current = ctx.parent.clone();
            chain.push(ctx);
        }
        chain
    }

    /// The job context at the top of the chain.
    pub fn root(self: &Arc<Self>) -> Arc<ElementContext> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    fn lock_status(&self) -> MutexGuard<'_, ExecutionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lock_status().clone()
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.lock_status().batch_status
    }

    pub fn exit_status(&self) -> String {
        self.lock_status().exit_status().to_string()
    }

    /// Move to `next` unless that would regress the lifecycle.
    pub fn set_batch_status(&self, next: BatchStatus) -> bool {
        let mut status = self.lock_status();
        let current = status.batch_status;
        let moved = status.advance(next);
        if !moved {
            tracing::debug!(
                context = self.id.as_str(),
                current = %current,
                rejected = %next,
                "ignoring status regression"
            );
        }
        moved
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.lock_status().set_exit_status(exit_status);
    }

    /// Put the context back to STARTED to continue after a failed step.
    pub fn reopen(&self) {
        self.lock_status().reopen();
    }

    /// Force a terminal status chosen by a transition.
    pub fn terminate(&self, status: BatchStatus) {
        self.lock_status().terminate(status);
    }

    /// Mark that an `end` transition finished this composite.
    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn restart_position(&self) -> Option<String> {
        self.restart_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_restart_position(&self, position: Option<String>) {
        *self
            .restart_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = position;
    }

    pub fn last_step_execution(&self) -> Option<StepExecution> {
        self.last_step_execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_last_step_execution(&self, execution: StepExecution) {
        *self
            .last_step_execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(execution);
    }
}

/// A stop request moves a running job to STOPPING.
impl StopObserver for ElementContext {
    fn on_stop(&self) {
        let current = self.batch_status();
        if matches!(current, BatchStatus::Starting | BatchStatus::Started) {
            self.set_batch_status(BatchStatus::Stopping);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
