//! Include/exclude matching of errors by kind lineage.
//!
//! Backs the skippable, retryable and no-rollback error sets of a chunk.

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Ordered include and exclude lists of error kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionClassFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ExceptionClassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let trimmed = kind.trim();
        if !trimmed.is_empty() {
            self.include.push(trimmed.to_string());
        }
        self
    }

    pub fn exclude(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let trimmed = kind.trim();
        if !trimmed.is_empty() {
            self.exclude.push(trimmed.to_string());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Whether `error` belongs to this filter.
    ///
    /// An empty include list matches nothing. An exact include wins, an exact
    /// exclude loses. Otherwise the nearest ancestor decides: an include at
    /// distance 1 matches, an include with no exclude list matches, and
    /// otherwise the include must be strictly nearer than any exclude.
    pub fn matches(&self, error: &BatchError) -> bool {
        if self.include.is_empty() {
            return false;
        }
        if self.include.iter().any(|k| *k == error.kind) {
            return true;
        }
        if self.exclude.iter().any(|k| *k == error.kind) {
            return false;
        }

        let Some(to_include) = shortest_ancestor_distance(error, &self.include) else {
            return false;
        };
        if to_include == 1 || self.exclude.is_empty() {
            return true;
        }
        match shortest_ancestor_distance(error, &self.exclude) {
            Some(to_exclude) => to_include < to_exclude,
            None => true,
        }
    }
}

fn shortest_ancestor_distance(error: &BatchError, kinds: &[String]) -> Option<usize> {
    kinds
        .iter()
        .filter_map(|k| error.distance_to(k))
        .filter(|d| *d > 0)
        .min()
}
