//! Job Envelope Protocol
//!
//! Defines the unit of work (`Job`) and the unit of output (`JobOutput`) and
//! how both travel between the master and a worker.
//!
//! ## Contents
//! - **`types`**: `Job`, `JobOutput`, `VariableKind` and the reserved
//!   command/variable names understood by every worker.
//! - **`envelope`**: the multi-frame wire format, dispatch (`start_job`),
//!   receipt (`receive_job`), and the done/ack/payload completion handshake.

pub mod envelope;
pub mod types;

#[cfg(test)]
mod tests;

pub use envelope::*;
pub use types::*;
