use crate::protocol::CompletionHandle;
use crate::transport::TransportError;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("the process group has no workers")]
    NoWorkers,

    #[error("every worker is dead or retired with {remaining} indices left")]
    NoLiveWorkers { remaining: usize },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// The master's view of one worker's in-flight request.
#[derive(Debug, Default)]
pub enum WorkerSlot {
    #[default]
    Idle,
    Outstanding(CompletionHandle),
}

impl WorkerSlot {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, WorkerSlot::Outstanding(_))
    }
}

/// Progress summary published every master loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub command: String,
    pub pending: usize,
    pub completed: usize,
    pub total: usize,
    pub available: usize,
    pub running: usize,
    pub dead: usize,
    pub finished: bool,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} completed ({:.1}%), {} pending, {} available, {} running, {} dead",
            self.command,
            self.completed,
            self.total,
            self.percent(),
            self.pending,
            self.available,
            self.running,
            self.dead
        )
    }
}
