//! Infrastructure for batchflow.
//!
//! Implements the `batchflow-core` ports for a single process: an in-memory
//! job repository, a local transaction manager and a name-based artifact
//! registry. Also loads `batchflow.toml` and wires everything into a
//! ready-to-use [`JobOperator`](batchflow_core::JobOperator).

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod memory;
pub mod transaction;

pub use artifacts::ArtifactRegistry;
pub use config::load_engine_config;
pub use engine::{local_operator, local_operator_from_dir, local_services};
pub use memory::InMemoryJobRepository;
pub use transaction::LocalTransactionManager;
