//! Ports: the traits infrastructure and user artifacts implement.

pub mod artifact;
pub mod listener;
pub mod partition;
pub mod repository;
pub mod transaction;
