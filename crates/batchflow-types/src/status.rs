//! Batch status lifecycle and exit status handling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Enumerated lifecycle state of a job, step or partition execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// Wire name of the status, also used as the default exit status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Abandoned => "ABANDONED",
        }
    }

    /// Whether no further work happens for an execution in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Failed | Self::Completed | Self::Abandoned
        )
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Statuses only advance toward a terminal state. The one chain that passes
    /// through non-terminal states is STARTING -> STARTED -> STOPPING -> STOPPED.
    /// Any terminal execution may still be abandoned. Re-setting the current
    /// status is always allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Starting => true,
            Self::Started => next != Self::Starting,
            Self::Stopping => matches!(next, Self::Stopped | Self::Failed | Self::Abandoned),
            Self::Stopped | Self::Failed | Self::Completed => next == Self::Abandoned,
            Self::Abandoned => false,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "STARTED" => Ok(Self::Started),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            "ABANDONED" => Ok(Self::Abandoned),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Batch status paired with an optional explicit exit status.
///
/// The effective exit status is the explicit value when one was set, otherwise
/// the name of the current batch status. Changing the batch status never
/// touches an explicit exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
}

impl ExecutionStatus {
    pub fn new(batch_status: BatchStatus) -> Self {
        Self {
            batch_status,
            exit_status: None,
        }
    }

    /// The exit status used for transition matching.
    pub fn exit_status(&self) -> &str {
        self.exit_status
            .as_deref()
            .unwrap_or_else(|| self.batch_status.as_str())
    }

    /// Whether an exit status was set explicitly.
    pub fn has_explicit_exit_status(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        self.exit_status = Some(exit_status.into());
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: BatchStatus) -> bool {
        if self.batch_status.can_transition_to(next) {
            self.batch_status = next;
            true
        } else {
            false
        }
    }

    /// Put a failed composite back to STARTED so it can continue through an
    /// explicit transition out of a failed step.
    pub fn reopen(&mut self) {
        self.batch_status = BatchStatus::Started;
    }

    /// Settle on `status` regardless of the current one. Used by `end`,
    /// `fail` and `stop` transitions, which decide the outcome of their
    /// enclosing contexts even after a failed step.
    pub fn terminate(&mut self, status: BatchStatus) {
        self.batch_status = status;
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::new(BatchStatus::Starting)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
