//! In-process process group.
//!
//! Every rank gets its own inbox and a direct link to every other rank, so a
//! whole master + workers cluster can run inside one tokio runtime.

use super::communicator::{Communicator, Link};
use super::mailbox::Inbox;

use std::collections::HashMap;
use std::sync::Arc;

pub struct LocalCluster;

impl LocalCluster {
    /// Builds `size` fully connected communicators; index `i` has rank `i`.
    pub fn build(size: usize) -> Vec<Arc<Communicator>> {
        let inboxes: Vec<_> = (0..size).map(|_| Inbox::new()).collect();

        (0..size)
            .map(|rank| {
                let links: HashMap<_, _> = (0..size)
                    .filter(|&peer| peer != rank)
                    .map(|peer| (peer, Link::Local(inboxes[peer].clone())))
                    .collect();
                Arc::new(Communicator::new(rank, size, inboxes[rank].clone(), links))
            })
            .collect()
    }
}
