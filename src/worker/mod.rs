//! Worker Module
//!
//! Everything that runs on a compute node.
//!
//! ## Submodules
//! - **`registry`**: the process-wide command table (`CommandRegistry`) and
//!   the `CommandHandler` capability.
//! - **`cache`**: worker-local copies of variables the master sends only once.
//! - **`worker`**: the job loop and its state machine
//!   (`WaitingForJob -> Executing -> SendingResult -> WaitingForJob`,
//!   terminal `Finished`).

pub mod cache;
pub mod registry;
pub mod worker;


pub use cache::VariableCache;
pub use registry::{CommandHandler, CommandRegistry};
pub use worker::{Worker, WorkerState};
