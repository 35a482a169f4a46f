//! Scheduler Module
//!
//! The master side of the executor. Owns the authoritative work state for a
//! job, hands out batches to idle workers, merges what comes back, and
//! recovers from workers that disappear.
//!
//! ## Submodules
//! - **`scheduler`**: `Scheduler` and its poll loop.
//! - **`state`**: `ExecutionState` (completed / pending / assignments / idle queue).
//! - **`partition`**: builds the per-worker job from the caller's template.
//! - **`outputs`**: merging, partial chunk files, column files, checkpoints.
//! - **`params`**: batch size and checkpoint interval heuristics.
//! - **`progress`** / **`handlers`**: progress snapshots and `GET /progress`.

pub mod handlers;
pub mod outputs;
pub mod params;
pub mod partition;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use params::Parameters;
pub use progress::ProgressBoard;
pub use scheduler::Scheduler;
pub use state::ExecutionState;
pub use types::*;
