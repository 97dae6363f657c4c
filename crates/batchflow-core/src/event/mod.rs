//! Engine event bus.
//!
//! `EventBus` distributes `BatchEvent` lifecycle notifications to any number
//! of subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
