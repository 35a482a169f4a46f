//! Process Roles
//!
//! Every process in a group calls [`start`] once the group is formed. Rank 0
//! becomes the master and gets a [`Scheduler`] back; every other rank serves
//! jobs until the master sends the finish command and then returns
//! [`NodeRole::Compute`].

use crate::config::SchedulerConfig;
use crate::scheduler::Scheduler;
use crate::transport::Communicator;
use crate::worker::{CommandRegistry, Worker};

use anyhow::Context;
use std::sync::Arc;

pub enum NodeRole {
    Master(Scheduler),
    Compute,
}

pub async fn start(
    comm: Arc<Communicator>,
    registry: Arc<CommandRegistry>,
    config: SchedulerConfig,
    host: &str,
) -> anyhow::Result<NodeRole> {
    if comm.is_master() {
        tracing::info!(
            "Node {} ({}) is the master of {} processes",
            comm.rank(),
            host,
            comm.size()
        );
        return Ok(NodeRole::Master(Scheduler::new(comm, config)));
    }

    let rank = comm.rank();
    let worker = Worker::new(comm, registry, host);
    worker
        .run()
        .await
        .with_context(|| format!("Compute node {} lost its link to the master", rank))?;
    Ok(NodeRole::Compute)
}

/// Host identifier reported to the master.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}
