//! Durable store for the drover control plane.
//!
//! Owns the entity schema (tasks, subtasks, workers, API keys, evaluations,
//! checkpoints, corrections), the connection pool, migrations, and the typed
//! query modules. The store is the source of truth for every conflict with
//! the ephemeral coordination layer.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
