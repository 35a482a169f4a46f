//! Master Loop
//!
//! Drives one job across every live worker until all of its indices are
//! completed.
//!
//! ## Loop
//! 1. **Assign** (under the state lock): idle workers take striped batches.
//! 2. **Dispatch** (no lock): partitioned envelopes go out.
//! 3. **Poll** (no lock): every outstanding completion handle is polled
//!    once; ready workers are acknowledged and their output received.
//! 4. **Complete** (under the state lock): indices move to completed,
//!    outputs are merged, checkpoints are written.
//! 5. **Sleep** for the wait interval.
//!
//! A link failure classified as a dead peer sends the worker to the
//! permanent dead set. Any other transport failure leaves its stream in an
//! unknown position, so it is retired and never contacted again. Either way
//! its indices are requeued.

use super::handlers::progress_router;
use super::outputs::{CheckpointPolicy, OutputAccumulator};
use super::params::Parameters;
use super::partition::{Partitioner, open_feature_files};
use super::progress::ProgressBoard;
use super::state::ExecutionState;
use super::types::*;
use crate::checkpoint::CheckpointStore;
use crate::config::SchedulerConfig;
use crate::protocol::{
    Index, Job, JobOutput, VariableKind, collect_output, request_identity, send_finish, start_job,
};
use crate::transport::{Communicator, Rank, TransportError};
use crate::value::Value;

use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Shared {
    state: ExecutionState,
    outputs: OutputAccumulator,
}

pub struct Scheduler {
    comm: Arc<Communicator>,
    config: SchedulerConfig,
    /// Workers that failed in any earlier run. Never dispatched to again.
    dead: Mutex<BTreeSet<Rank>>,
    /// Workers whose message stream broke mid-exchange. Also never contacted again.
    retired: Mutex<BTreeSet<Rank>>,
    feature_files: HashMap<String, PathBuf>,
    feature_dimensions: Option<usize>,
    progress: Arc<ProgressBoard>,
}

impl Scheduler {
    pub fn new(comm: Arc<Communicator>, config: SchedulerConfig) -> Self {
        Self {
            comm,
            config,
            dead: Mutex::new(BTreeSet::new()),
            retired: Mutex::new(BTreeSet::new()),
            feature_files: HashMap::new(),
            feature_dimensions: None,
            progress: ProgressBoard::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn progress(&self) -> Arc<ProgressBoard> {
        self.progress.clone()
    }

    pub fn dead_workers(&self) -> BTreeSet<Rank> {
        self.dead.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn retired_workers(&self) -> BTreeSet<Rank> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Width of every vector in the feature side files.
    pub fn set_stripped_feature_dimensions(&mut self, dimensions: usize) {
        self.feature_dimensions = Some(dimensions);
    }

    pub fn attach_feature_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.feature_files.insert(name.into(), path.into());
    }

    /// Loads a saved value into `job` under `name` with the given kind.
    ///
    /// Feature-stripped variables also get their companion
    /// `<stem>.features.bin` attached.
    pub fn load_input_variable(
        &mut self,
        job: &mut Job,
        name: &str,
        path: &Path,
        kind: VariableKind,
    ) -> anyhow::Result<()> {
        tracing::info!("Loading input {} from {}", name, path.display());
        let value = Value::load_from_file(path)
            .with_context(|| format!("Could not load input {}", name))?;

        let (rows, cols) = value.dimensions();
        tracing::debug!("Input {} dimensions: {} x {}", name, rows, cols);

        if kind == VariableKind::FeatureStrippedRow {
            self.attach_feature_file(name, path.with_extension("features.bin"));
        }
        job.set_variable(name, value);
        job.declare(name, kind);
        Ok(())
    }

    /// Serves `GET /progress` on `addr` until the process exits.
    pub async fn serve_progress(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Progress endpoint listening on {}", listener.local_addr()?);

        let app = progress_router(self.progress.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Progress endpoint stopped: {}", e);
            }
        });
        Ok(())
    }

    fn live_workers(&self) -> Vec<Rank> {
        let dead = self.dead_workers();
        let retired = self.retired_workers();
        self.comm
            .worker_ranks()
            .into_iter()
            .filter(|rank| !dead.contains(rank) && !retired.contains(rank))
            .collect()
    }

    fn mark_permanently_dead(&self, worker: Rank) {
        self.dead.lock().unwrap_or_else(PoisonError::into_inner).insert(worker);
    }

    fn mark_retired(&self, worker: Rank) {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).insert(worker);
    }

    /// Asks every live worker for its host identifier.
    pub async fn identify_workers(&self) -> BTreeMap<Rank, String> {
        let mut hosts = BTreeMap::new();
        for worker in self.live_workers() {
            match request_identity(&self.comm, worker).await {
                Ok(host) => {
                    tracing::info!("Node {} is running on {}", worker, host);
                    hosts.insert(worker, host);
                }
                Err(e) if e.is_peer_dead() => {
                    tracing::warn!("Node {} did not answer identify: {}", worker, e);
                    self.mark_permanently_dead(worker);
                }
                Err(e) => {
                    tracing::warn!("Could not identify node {}; retiring it: {}", worker, e);
                    self.mark_retired(worker);
                }
            }
        }
        hosts
    }

    /// Sends the finish command to every live worker and waits for each
    /// acknowledgement. Returns the number of workers that acknowledged.
    pub async fn finish(&self) -> usize {
        let mut handles = Vec::new();
        for worker in self.live_workers() {
            match send_finish(&self.comm, worker).await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::warn!("Could not send finish to node {}: {}", worker, e),
            }
        }

        let mut acknowledged = 0;
        for handle in handles {
            let worker = handle.worker();
            match handle.wait().await {
                Ok(_) => {
                    tracing::info!("Node {} acknowledged finish", worker);
                    acknowledged += 1;
                }
                Err(e) => tracing::warn!("Node {} did not acknowledge finish: {}", worker, e),
            }
        }
        acknowledged
    }

    /// Tells every live worker to stop without waiting, and returns the
    /// error the caller should exit with.
    pub async fn abort(&self, reason: &str) -> SchedulerError {
        tracing::error!("Aborting: {}", reason);
        for worker in self.live_workers() {
            if let Err(e) = send_finish(&self.comm, worker).await {
                tracing::warn!("Could not send finish to node {}: {}", worker, e);
            }
        }
        SchedulerError::Aborted(reason.to_string())
    }

    /// Runs `job` over all of its indices and returns the merged output.
    pub async fn execute(&self, job: &Job) -> Result<JobOutput, SchedulerError> {
        if self.comm.size() <= 1 {
            tracing::error!("Cannot execute {}: the process group has no workers", job.command);
            return Err(SchedulerError::NoWorkers);
        }

        let workers = self.select_workers();
        let mut indices: BTreeSet<Index> = job.indices.iter().copied().collect();
        if let Some(single) = self.config.debug_single_index {
            tracing::warn!("Debug mode: only index {} will be processed", single);
            indices.retain(|&index| index == single);
        }
        if workers.is_empty() {
            tracing::error!("Cannot execute {}: no live workers", job.command);
            return Err(SchedulerError::NoLiveWorkers { remaining: indices.len() });
        }

        let mut restored = None;
        let mut restored_indices = BTreeSet::new();
        if !self.config.resume_from.is_empty() {
            let store = CheckpointStore::new(self.config.checkpoint_dir());
            let loaded = store.load(&self.config.resume_from);
            indices.retain(|index| !loaded.covered.contains(index));
            restored_indices = loaded.covered.clone();
            tracing::info!(
                "Resuming {}: {} indices restored from checkpoints, {} left",
                job.command,
                restored_indices.len(),
                indices.len()
            );
            restored = Some(loaded);
        }

        // Sized from what is left to do, not from the full request.
        let params = Parameters::resolve(&self.config, indices.len(), workers.len());
        let checkpoint = params.checkpoint_interval.map(|interval| CheckpointPolicy {
            store: CheckpointStore::new(self.config.checkpoint_dir()),
            interval,
        });
        let mut outputs = OutputAccumulator::new(job.kinds.clone(), &self.config, checkpoint);
        if let Some(restored) = restored {
            outputs.restore(restored);
        }

        tracing::info!(
            "Executing {} on {} indices with {} workers (batch size {}, checkpoint interval {:?})",
            job.command,
            indices.len(),
            workers.len(),
            params.batch_size,
            params.checkpoint_interval
        );

        let shared = Mutex::new(Shared {
            state: ExecutionState::new(indices, &workers, params.batch_size),
            outputs,
        });
        let feature_files = open_feature_files(&self.feature_files);
        let partitioner = Partitioner {
            template: job,
            feature_files: &feature_files,
            feature_dimensions: self.feature_dimensions,
            all_indices_at_once: self.config.all_indices_at_once,
        };

        let result = self.run_loop(&job.command, &shared, &partitioner, &workers).await;

        drop(feature_files);
        let Shared { state, outputs } =
            shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        for &worker in state.dead() {
            self.mark_permanently_dead(worker);
        }
        for &worker in state.retired() {
            self.mark_retired(worker);
        }
        let variables = outputs.finish();
        self.progress.publish(state.progress(&job.command));

        result?;

        let requested: BTreeSet<Index> = job.indices.iter().copied().collect();
        let indices = state
            .completed()
            .iter()
            .chain(restored_indices.iter().filter(|index| requested.contains(index)))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        tracing::info!("Finished {}", job.command);
        Ok(JobOutput {
            command: job.command.clone(),
            indices,
            variables,
        })
    }

    fn select_workers(&self) -> Vec<Rank> {
        let live = self.live_workers();
        match self.config.debug_node {
            Some(node) if live.contains(&node) => {
                tracing::warn!("Debug mode: only node {} will be used", node);
                vec![node]
            }
            Some(node) => {
                tracing::error!("Debug node {} is not a live worker", node);
                Vec::new()
            }
            None => live,
        }
    }

    async fn run_loop(
        &self,
        command: &str,
        shared: &Mutex<Shared>,
        partitioner: &Partitioner<'_>,
        workers: &[Rank],
    ) -> Result<(), SchedulerError> {
        let mut slots: BTreeMap<Rank, WorkerSlot> =
            workers.iter().map(|&worker| (worker, WorkerSlot::Idle)).collect();

        loop {
            let dispatches: Vec<(Rank, Job)> = {
                let mut guard = lock(shared);
                if guard.state.is_complete() {
                    return Ok(());
                }
                if guard.state.live_workers() == 0 {
                    let remaining = guard.state.remaining();
                    tracing::error!(
                        "No live workers left for {} with {} indices remaining",
                        command,
                        remaining
                    );
                    return Err(SchedulerError::NoLiveWorkers { remaining });
                }

                let state = &mut guard.state;
                state
                    .assign_round()
                    .into_iter()
                    .map(|(worker, indices)| {
                        let primed = state.is_primed(worker);
                        (worker, partitioner.build(&indices, primed))
                    })
                    .collect()
            };

            for (worker, dispatch) in dispatches {
                let indices = &dispatch.indices;
                tracing::info!("Starting job {} on node {}: {:?}", command, worker, indices);
                match start_job(&self.comm, worker, &dispatch).await {
                    Ok(handle) => {
                        slots.insert(worker, WorkerSlot::Outstanding(handle));
                    }
                    Err(e) => self.handle_failure(shared, &mut slots, worker, &e),
                }
            }

            let mut ready = Vec::new();
            let mut failed = Vec::new();
            for (&worker, slot) in slots.iter_mut() {
                let WorkerSlot::Outstanding(handle) = slot else {
                    continue;
                };
                match handle.poll() {
                    None => {}
                    Some(Ok(_)) => {
                        *slot = WorkerSlot::Idle;
                        ready.push(worker);
                    }
                    Some(Err(e)) => failed.push((worker, e)),
                }
            }
            for (worker, e) in failed {
                self.handle_failure(shared, &mut slots, worker, &e);
            }

            for worker in ready {
                match collect_output(&self.comm, worker).await {
                    Ok(output) => {
                        tracing::info!("Job completed on node {}: {:?}", worker, output.indices);
                        let mut guard = lock(shared);
                        guard.state.complete(worker, &output.indices);
                        guard.outputs.absorb(&output);
                    }
                    Err(e) => self.handle_failure(shared, &mut slots, worker, &e),
                }
            }

            let progress = lock(shared).state.progress(command);
            if self.progress.publish(progress.clone()) {
                tracing::info!("{}", progress);
            } else {
                tracing::debug!("{}", progress);
            }

            tokio::time::sleep(self.config.wait_interval()).await;
        }
    }

    fn handle_failure(
        &self,
        shared: &Mutex<Shared>,
        slots: &mut BTreeMap<Rank, WorkerSlot>,
        worker: Rank,
        error: &TransportError,
    ) {
        slots.remove(&worker);
        let mut guard = lock(shared);

        if error.is_peer_dead() {
            let requeued = guard.state.mark_dead(worker);
            tracing::warn!("Node {} is dead ({}); requeued indices {:?}", worker, error, requeued);
        } else {
            let requeued = guard.state.retire(worker);
            tracing::warn!(
                "Node {} failed ({}); retired for this run, requeued indices {:?}",
                worker,
                error,
                requeued
            );
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
