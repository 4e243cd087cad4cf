//! drover-core: the control-plane logic of the drover platform.
//!
//! Tasks are decomposed into dependency DAGs of subtasks, scheduled onto a
//! fleet of worker machines, evaluated, and gated by human-in-the-loop
//! checkpoints with bounded correction cycles. Durable state lives in
//! `drover-db`; ephemeral coordination state (mirrors, queues, pub/sub,
//! locks) lives behind the [`coordination::CoordinationStore`] capability.

pub mod allocator;
pub mod checkpoint;
pub mod config;
pub mod coordination;
pub mod decomposer;
pub mod error;
pub mod ingest;
pub mod recovery;
pub mod registry;
pub mod review;
pub mod scheduler;
