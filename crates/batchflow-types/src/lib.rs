//! Shared domain types for batchflow.
//!
//! This crate holds the job graph model (`JobDefinition` and its elements),
//! batch statuses, execution records and metrics, the exception class filter
//! used for skip/retry classification, events, engine configuration and the
//! error types shared across the workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod filter;
pub mod job;
pub mod status;
