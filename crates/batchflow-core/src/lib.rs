//! Job graph runtime and port traits for batchflow.
//!
//! This crate runs job definitions from `batchflow-types`: the graph walk,
//! the chunk engine with its skip/retry/checkpoint policy, batchlets,
//! partitioned steps, splits and decisions. Storage, transactions and artifact
//! instantiation are reached through the traits in [`port`]; their
//! implementations live in `batchflow-infra`.

pub mod error;
pub mod event;
pub mod operator;
pub mod port;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use error::RunnerError;
pub use event::EventBus;
pub use operator::JobOperator;
pub use runtime::Services;
