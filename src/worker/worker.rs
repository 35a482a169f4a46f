//! Compute Node Loop
//!
//! Runs on every non-master process. Receives one job at a time from the
//! master, executes the registered command, and hands the output back
//! through the completion handshake.
//!
//! ## Responsibilities
//! - **Sentinels**: exits on the finish command, answers the identify command.
//! - **Execution**: per-index narrowing, or a single call when the job asks
//!   for all indices at once. Handlers run on the blocking pool.
//! - **Fail-soft**: unknown commands and panicking handlers still report the
//!   indices they were given, so the master never loses track of them.

use super::cache::VariableCache;
use super::registry::{CommandHandler, CommandRegistry};
use crate::protocol::{
    ALL_INDICES_AT_ONCE_FIELD, FINISH_COMMAND, IDENTIFY_COMMAND, Job, JobOutput, acknowledge_finish,
    receive_job, send_output, signal_done, wait_for_ack,
};
use crate::transport::{Communicator, MASTER_RANK, Rank, TransportError};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WaitingForJob,
    Executing,
    SendingResult,
    Finished,
}

pub struct Worker {
    comm: Arc<Communicator>,
    registry: Arc<CommandRegistry>,
    cache: VariableCache,
    host: String,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(
        comm: Arc<Communicator>,
        registry: Arc<CommandRegistry>,
        host: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            comm,
            registry,
            cache: VariableCache::new(),
            host: host.into(),
            state: Mutex::new(WorkerState::WaitingForJob),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache(&self) -> &VariableCache {
        &self.cache
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    /// Serves jobs until the master sends the finish command.
    ///
    /// Returns an error when the link to the master breaks; a worker
    /// cannot do anything useful without one.
    pub async fn run(&self) -> Result<(), TransportError> {
        tracing::info!(
            "Compute node {} ({}) ready with {} commands",
            self.rank(),
            self.host,
            self.registry.command_count()
        );

        loop {
            self.set_state(WorkerState::WaitingForJob);
            let job = receive_job(&self.comm, MASTER_RANK).await?;

            match job.command.as_str() {
                FINISH_COMMAND => {
                    acknowledge_finish(&self.comm).await?;
                    self.set_state(WorkerState::Finished);
                    tracing::info!("Compute node {} finished", self.rank());
                    return Ok(());
                }
                IDENTIFY_COMMAND => {
                    self.comm.send_string(MASTER_RANK, &self.host).await?;
                    continue;
                }
                _ => {}
            }

            self.set_state(WorkerState::Executing);
            let output = self.execute(job).await;

            self.set_state(WorkerState::SendingResult);
            signal_done(&self.comm).await?;
            wait_for_ack(&self.comm).await?;
            send_output(&self.comm, MASTER_RANK, &output).await?;

            tracing::debug!(
                "Compute node {} returned {} indices for {}",
                self.rank(),
                output.indices.len(),
                output.command
            );
        }
    }

    async fn execute(&self, mut job: Job) -> JobOutput {
        let rank = self.rank();

        let Some(handler) = self.registry.get(&job.command) else {
            tracing::error!(
                "Node {}: unknown command {}, returning empty output",
                rank,
                job.command
            );
            return JobOutput::for_job(&job);
        };

        self.cache.apply(&mut job);
        let all_at_once = job.variables.remove(ALL_INDICES_AT_ONCE_FIELD).is_some();

        tracing::debug!(
            "Node {}: running {} on {} indices{}",
            rank,
            job.command,
            job.indices.len(),
            if all_at_once { " (all at once)" } else { "" }
        );

        let fallback = JobOutput::for_job(&job);
        let task = tokio::task::spawn_blocking(move || {
            run_handler(rank, handler.as_ref(), job, all_at_once)
        });
        match task.await {
            Ok(output) => output,
            Err(e) => {
                let command = &fallback.command;
                tracing::error!("Node {}: handler task for {} failed: {}", rank, command, e);
                fallback
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

fn run_handler(rank: Rank, handler: &dyn CommandHandler, job: Job, all_at_once: bool) -> JobOutput {
    let mut output = JobOutput::for_job(&job);

    if all_at_once {
        output.absorb(invoke(rank, handler, &job));
        return output;
    }

    let indices = job.indices.clone();
    let mut narrowed = job;
    for index in indices {
        narrowed.indices = vec![index];
        output.absorb(invoke(rank, handler, &narrowed));
    }
    output
}

fn invoke(rank: Rank, handler: &dyn CommandHandler, job: &Job) -> JobOutput {
    match catch_unwind(AssertUnwindSafe(|| handler.execute(job))) {
        Ok(output) => output,
        Err(_) => {
            tracing::error!(
                "Node {}: handler for {} panicked on indices {:?}",
                rank,
                job.command,
                job.indices
            );
            JobOutput::for_job(job)
        }
    }
}
