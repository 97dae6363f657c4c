//! Per-scope registry of instantiated listeners.

use std::sync::Arc;

use batchflow_types::job::RefArtifact;

use crate::error::RunnerError;
use crate::port::artifact::{Artifact, ArtifactContext, ArtifactFactory, create_listener};
use crate::port::listener::{
    ChunkListener, ItemProcessListener, ItemReadListener, ItemWriteListener, JobListener,
    ListenerArtifact, RetryProcessListener, RetryReadListener, RetryWriteListener,
    SkipProcessListener, SkipReadListener, SkipWriteListener, StepListener,
};

/// Listeners of one job, step or partition, grouped by capability.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    pub job: Vec<Arc<dyn JobListener>>,
    pub step: Vec<Arc<dyn StepListener>>,
    pub chunk: Vec<Arc<dyn ChunkListener>>,
    pub item_read: Vec<Arc<dyn ItemReadListener>>,
    pub item_process: Vec<Arc<dyn ItemProcessListener>>,
    pub item_write: Vec<Arc<dyn ItemWriteListener>>,
    pub skip_read: Vec<Arc<dyn SkipReadListener>>,
    pub skip_process: Vec<Arc<dyn SkipProcessListener>>,
    pub skip_write: Vec<Arc<dyn SkipWriteListener>>,
    pub retry_read: Vec<Arc<dyn RetryReadListener>>,
    pub retry_process: Vec<Arc<dyn RetryProcessListener>>,
    pub retry_write: Vec<Arc<dyn RetryWriteListener>>,
    /// Instances obtained from the factory, handed back by `destroy`.
    created: Vec<ListenerArtifact>,
}

impl ListenerRegistry {
    /// Instantiate every listener reference, in declaration order.
    pub fn create(
        factory: &dyn ArtifactFactory,
        refs: &[RefArtifact],
        ctx: &ArtifactContext,
    ) -> Result<Self, RunnerError> {
        let mut registry = Self::default();
        for artifact in refs {
            let ctx = ArtifactContext {
                properties: artifact.properties.clone(),
                ..ctx.clone()
            };
            let listener = match create_listener(factory, artifact, &ctx) {
                Ok(listener) => listener,
                Err(err) => {
                    registry.destroy(factory);
                    return Err(err.into());
                }
            };
            registry.created.push(listener.clone());
            registry.register(listener);
        }
        Ok(registry)
    }

    /// Return every factory-created listener once its scope has ended.
    pub fn destroy(self, factory: &dyn ArtifactFactory) {
        for listener in self.created {
            factory.destroy(Artifact::Listener(listener));
        }
    }

    /// File every capability present on `listener`.
    pub fn register(&mut self, listener: ListenerArtifact) {
        let ListenerArtifact {
            job,
            step,
            chunk,
            item_read,
            item_process,
            item_write,
            skip_read,
            skip_process,
            skip_write,
            retry_read,
            retry_process,
            retry_write,
        } = listener;

        self.job.extend(job);
        self.step.extend(step);
        self.chunk.extend(chunk);
        self.item_read.extend(item_read);
        self.item_process.extend(item_process);
        self.item_write.extend(item_write);
        self.skip_read.extend(skip_read);
        self.skip_process.extend(skip_process);
        self.skip_write.extend(skip_write);
        self.retry_read.extend(retry_read);
        self.retry_process.extend(retry_process);
        self.retry_write.extend(retry_write);
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("job", &self.job.len())
            .field("step", &self.step.len())
            .field("chunk", &self.chunk.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FnArtifacts, recording_listener};
    use async_trait::async_trait;

    struct Both;

    fn ctx() -> ArtifactContext {
        ArtifactContext {
            job_name: "job".to_string(),
            job_execution_id: uuid::Uuid::nil(),
            step_name: None,
            partition_index: None,
            properties: Default::default(),
            step_properties: Default::default(),
            step: None,
        }
    }

    #[async_trait]
    impl StepListener for Both {}

    #[async_trait]
    impl ChunkListener for Both {}

    #[test]
    fn register_files_each_capability() {
        let both = Arc::new(Both);
        let mut registry = ListenerRegistry::default();
        registry.register(ListenerArtifact::new().step(both.clone()).chunk(both));
        registry.register(ListenerArtifact::new().step(Arc::new(Both)));

        assert_eq!(registry.step.len(), 2);
        assert_eq!(registry.chunk.len(), 1);
        assert!(registry.job.is_empty());
        assert!(registry.item_read.is_empty());
    }

    #[test]
    fn destroy_returns_created_listeners() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let factory = FnArtifacts::new().with("listener", recording_listener(&events, None));
        let refs = vec![RefArtifact::new("listener"), RefArtifact::new("listener")];
        let registry = ListenerRegistry::create(&factory, &refs, &ctx()).unwrap();
        assert_eq!(registry.step.len(), 2);
        assert!(factory.destroyed().is_empty());

        registry.destroy(&factory);
        assert_eq!(factory.destroyed(), vec!["listener", "listener"]);
    }

    #[test]
    fn failed_create_destroys_earlier_listeners() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let factory = FnArtifacts::new().with("listener", recording_listener(&events, None));
        let refs = vec![RefArtifact::new("listener"), RefArtifact::new("missing")];
        let err = ListenerRegistry::create(&factory, &refs, &ctx()).unwrap_err();
        assert!(matches!(err, RunnerError::ArtifactCreation(_)));
        assert_eq!(factory.destroyed(), vec!["listener"]);
    }
}
