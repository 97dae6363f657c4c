//! Exit status pattern matching and transition resolution.

use std::sync::Arc;

use batchflow_types::job::Transition;
use batchflow_types::status::BatchStatus;

use super::context::ElementContext;

/// Glob match of an exit status against a transition pattern.
///
/// `*` matches any run of characters (including none), `?` exactly one
/// character. Everything else matches literally.
pub fn matches(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    // Position after the last `*` and the value index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p + 1, v));
            p += 1;
        } else if let Some((star_p, star_v)) = backtrack {
            p = star_p;
            v = star_v + 1;
            backtrack = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// The first transition whose pattern matches `exit_status`.
pub fn first_match<'a>(transitions: &'a [Transition], exit_status: &str) -> Option<&'a Transition> {
    transitions.iter().find(|t| matches(t.on(), exit_status))
}

/// Pick the next element after an element finished with `exit_status`.
///
/// Transitions are scanned in order and the first match wins:
///
/// - `next` returns its target.
/// - `end`, `fail` and `stop` set COMPLETED, FAILED or STOPPED on `ctx` and
///   every enclosing context, mark the enclosing flows as ended, apply the
///   transition's exit status and return `None`. `stop` also records the
///   restart position on the job.
///
/// Without a match the `next` attribute is returned.
///
/// A transition's exit status is applied to every context when present. For a
/// decision (`part_of_decision`) the contexts otherwise take the current exit
/// status, so the decider's value propagates outward.
pub fn resolve(
    transitions: &[Transition],
    exit_status: &str,
    next_attr: Option<&str>,
    ctx: &Arc<ElementContext>,
    part_of_decision: bool,
) -> Option<String> {
    let Some(transition) = first_match(transitions, exit_status) else {
        return next_attr.map(str::to_string);
    };

    let (status, new_exit_status, restart) = match transition {
        Transition::Next { to, .. } => return Some(to.clone()),
        Transition::End { exit_status, .. } => (BatchStatus::Completed, exit_status, None),
        Transition::Fail { exit_status, .. } => (BatchStatus::Failed, exit_status, None),
        Transition::Stop {
            exit_status,
            restart,
            ..
        } => (BatchStatus::Stopped, exit_status, restart.as_ref()),
    };

    tracing::debug!(
        context = ctx.id(),
        on = transition.on(),
        status = %status,
        "terminating transition matched"
    );

    let applied_exit_status = match new_exit_status {
        Some(value) => Some(value.clone()),
        None if part_of_decision => Some(exit_status.to_string()),
        None => None,
    };

    for context in ctx.chain() {
        context.terminate(status);
        if let Some(value) = &applied_exit_status {
            context.set_exit_status(value.clone());
        }
        context.mark_ended();
    }

    if let Some(position) = restart {
        ctx.root().set_restart_position(Some(position.clone()));
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
