//! Name-based artifact registry.
//!
//! Hosts register one constructor per logical artifact name. Job definitions
//! refer to artifacts by that name; the runtime asks the registry for a fresh
//! instance, with the resolved properties of the reference, every time one is
//! needed.

use std::sync::Arc;

use batchflow_core::port::artifact::{Artifact, ArtifactContext, ArtifactFactory};
use batchflow_types::error::ArtifactError;
use batchflow_types::job::RefArtifact;
use dashmap::DashMap;

type Constructor = Arc<dyn Fn(&ArtifactContext) -> Result<Artifact, ArtifactError> + Send + Sync>;

/// `DashMap`-backed registry mapping artifact names to constructors.
#[derive(Clone, Default)]
pub struct ArtifactRegistry {
    constructors: Arc<DashMap<String, Constructor>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fallible constructor under `name`, replacing any previous
    /// one.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&ArtifactContext) -> Result<Artifact, ArtifactError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .constructors
            .insert(name.clone(), Arc::new(constructor))
            .is_some()
        {
            tracing::debug!(artifact = name.as_str(), "replaced artifact constructor");
        }
    }

    /// Builder form of [`register`](Self::register) for constructors that
    /// cannot fail.
    pub fn with<F>(self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ArtifactContext) -> Artifact + Send + Sync + 'static,
    {
        self.register(name, move |ctx| Ok(constructor(ctx)));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl ArtifactFactory for ArtifactRegistry {
    fn create(&self, artifact: &RefArtifact, ctx: &ArtifactContext) -> Result<Artifact, ArtifactError> {
        // Clone the constructor out so user code never runs under a map lock.
        let constructor = self
            .constructors
            .get(&artifact.name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ArtifactError::Unknown(artifact.name.clone()))?;

        let instance = constructor(ctx)?;
        tracing::trace!(
            artifact = artifact.name.as_str(),
            kind = instance.kind(),
            step = ?ctx.step_name,
            partition = ?ctx.partition_index,
            "created artifact"
        );
        Ok(instance)
    }

    fn destroy(&self, artifact: Artifact) {
        tracing::trace!(kind = artifact.kind(), "destroyed artifact");
        drop(artifact);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
