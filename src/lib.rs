//! Distributed Batch Executor Library
//!
//! A single-master, many-worker executor for embarrassingly parallel jobs:
//! the master splits a job's indices into batches, ships each batch to an
//! idle worker together with the variables it needs, merges what comes
//! back, checkpoints long runs, and reassigns work from workers that die.
//!
//! ## Architecture Modules
//!
//! - **`transport`**: Rank-addressed, tag-matched messaging with blocking and
//!   pollable requests, over in-process channels or TCP.
//! - **`protocol`**: The job envelope (`Job`, `JobOutput`) and the
//!   done/ack/output completion handshake.
//! - **`value`**: The variable payload type with merge and slicing.
//! - **`worker`**: The command registry and the compute-node job loop.
//! - **`scheduler`**: The master loop, variable partitioning, output
//!   handling and dead-worker recovery.
//! - **`checkpoint`**: Durable snapshots of accumulated output for resuming.
//! - **`config`**: Scheduler settings from defaults, file and environment.
//! - **`node`**: Picks the master or compute role for a process.

pub mod checkpoint;
pub mod config;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod value;
pub mod worker;
