//! Listener traits and the capability set a listener artifact exposes.
//!
//! A single listener object may implement several listener traits. The
//! artifact factory returns it as a `ListenerArtifact` with one slot filled
//! per implemented trait, and the runtime files each slot separately.

use std::sync::Arc;

use async_trait::async_trait;
use batchflow_types::error::BatchError;

use super::artifact::Item;

#[async_trait]
pub trait JobListener: Send + Sync {
    async fn before_job(&self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_job(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait StepListener: Send + Sync {
    async fn before_step(&self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_step(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait ChunkListener: Send + Sync {
    async fn before_chunk(&self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_chunk(&self) -> Result<(), BatchError> {
        Ok(())
    }

    /// Called once when the chunk loop fails, before the step fails.
    async fn on_error(&self, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemReadListener: Send + Sync {
    async fn before_read(&self) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_read(&self, _item: Option<&Item>) -> Result<(), BatchError> {
        Ok(())
    }

    async fn on_read_error(&self, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemProcessListener: Send + Sync {
    async fn before_process(&self, _item: &Item) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_process(&self, _item: &Item, _result: Option<&Item>) -> Result<(), BatchError> {
        Ok(())
    }

    async fn on_process_error(&self, _item: &Item, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemWriteListener: Send + Sync {
    async fn before_write(&self, _items: &[Item]) -> Result<(), BatchError> {
        Ok(())
    }

    async fn after_write(&self, _items: &[Item]) -> Result<(), BatchError> {
        Ok(())
    }

    async fn on_write_error(&self, _items: &[Item], _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait SkipReadListener: Send + Sync {
    async fn on_skip_read_item(&self, error: &BatchError) -> Result<(), BatchError>;
}

#[async_trait]
pub trait SkipProcessListener: Send + Sync {
    async fn on_skip_process_item(&self, item: &Item, error: &BatchError) -> Result<(), BatchError>;
}

#[async_trait]
pub trait SkipWriteListener: Send + Sync {
    async fn on_skip_write_item(&self, items: &[Item], error: &BatchError) -> Result<(), BatchError>;
}

#[async_trait]
pub trait RetryReadListener: Send + Sync {
    async fn on_retry_read_error(&self, error: &BatchError) -> Result<(), BatchError>;
}

#[async_trait]
pub trait RetryProcessListener: Send + Sync {
    async fn on_retry_process_error(&self, item: &Item, error: &BatchError) -> Result<(), BatchError>;
}

#[async_trait]
pub trait RetryWriteListener: Send + Sync {
    async fn on_retry_write_error(&self, items: &[Item], error: &BatchError) -> Result<(), BatchError>;
}

/// The listener capabilities of one instantiated listener artifact.
#[derive(Default, Clone)]
pub struct ListenerArtifact {
    pub job: Option<Arc<dyn JobListener>>,
    pub step: Option<Arc<dyn StepListener>>,
    pub chunk: Option<Arc<dyn ChunkListener>>,
    pub item_read: Option<Arc<dyn ItemReadListener>>,
    pub item_process: Option<Arc<dyn ItemProcessListener>>,
    pub item_write: Option<Arc<dyn ItemWriteListener>>,
    pub skip_read: Option<Arc<dyn SkipReadListener>>,
    pub skip_process: Option<Arc<dyn SkipProcessListener>>,
    pub skip_write: Option<Arc<dyn SkipWriteListener>>,
    pub retry_read: Option<Arc<dyn RetryReadListener>>,
    pub retry_process: Option<Arc<dyn RetryProcessListener>>,
    pub retry_write: Option<Arc<dyn RetryWriteListener>>,
}

impl ListenerArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.job = Some(listener);
        self
    }

    pub fn step(mut self, listener: Arc<dyn StepListener>) -> Self {
        self.step = Some(listener);
        self
    }

    pub fn chunk(mut self, listener: Arc<dyn ChunkListener>) -> Self {
        self.chunk = Some(listener);
        self
    }

    pub fn item_read(mut self, listener: Arc<dyn ItemReadListener>) -> Self {
        self.item_read = Some(listener);
        self
    }

    pub fn item_process(mut self, listener: Arc<dyn ItemProcessListener>) -> Self {
        self.item_process = Some(listener);
        self
    }

    pub fn item_write(mut self, listener: Arc<dyn ItemWriteListener>) -> Self {
        self.item_write = Some(listener);
        self
    }

    pub fn skip_read(mut self, listener: Arc<dyn SkipReadListener>) -> Self {
        self.skip_read = Some(listener);
        self
    }

    pub fn skip_process(mut self, listener: Arc<dyn SkipProcessListener>) -> Self {
        self.skip_process = Some(listener);
        self
    }

    pub fn skip_write(mut self, listener: Arc<dyn SkipWriteListener>) -> Self {
        self.skip_write = Some(listener);
        self
    }

    pub fn retry_read(mut self, listener: Arc<dyn RetryReadListener>) -> Self {
        self.retry_read = Some(listener);
        self
    }

    pub fn retry_process(mut self, listener: Arc<dyn RetryProcessListener>) -> Self {
        self.retry_process = Some(listener);
        self
    }

    pub fn retry_write(mut self, listener: Arc<dyn RetryWriteListener>) -> Self {
        self.retry_write = Some(listener);
        self
    }
}

impl std::fmt::Debug for ListenerArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerArtifact")
            .field("job", &self.job.is_some())
            .field("step", &self.step.is_some())
            .field("chunk", &self.chunk.is_some())
            .finish_non_exhaustive()
    }
}
