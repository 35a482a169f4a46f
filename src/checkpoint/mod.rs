//! Checkpoint Store
//!
//! Periodically persists accumulated output plus the indices it covers, so a
//! crashed run can be resumed without recomputing finished work. Writes are
//! best-effort: a failed checkpoint is logged and the run carries on.

pub mod store;


pub use store::{CheckpointStore, Restored};
