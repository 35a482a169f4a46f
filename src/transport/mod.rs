//! Transport Module
//!
//! Point-to-point messaging between the master and its workers.
//!
//! ## Model
//! - Every process has a **rank**; the master is rank 0.
//! - Messages are opaque byte frames addressed by `(rank, tag)`. Frames with
//!   the same source and tag arrive in send order, so a multi-part message
//!   can be reassembled by reading its parts back in sequence.
//! - Every primitive has a blocking form (`send`, `recv`) and a pollable
//!   form (`send_async`, `recv_async`) returning a [`Request`].
//!
//! ## Failure classification
//! A peer is reported as [`TransportError::PeerUnreachable`] when its link
//! is closed (connection reset or ended, endpoint dropped) or when the rank
//! does not exist. Everything else (encoding problems, a local endpoint that
//! has been shut) is reported as a local failure and says nothing about the
//! peer's health.
//!
//! ## Submodules
//! - **`mailbox`**: the tag-matched inbox.
//! - **`communicator`**: the per-process endpoint.
//! - **`local`**: an in-process group for tests and single-machine runs.
//! - **`tcp`**: a star-shaped TCP group for real deployments.

pub mod communicator;
pub mod local;
pub mod mailbox;
pub mod tcp;
pub mod types;


pub use communicator::Communicator;
pub use local::LocalCluster;
pub use types::*;
