//! Authoritative work state for one `execute` call.
//!
//! Invariants held after every operation:
//! - `completed` and `pending` are disjoint subsets of the run's indices.
//! - Every pending index belongs to exactly one worker's assignment.
//! - A worker appears in `available` only when it has no assignment.

use super::types::Progress;
use crate::protocol::Index;
use crate::transport::Rank;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug)]
pub struct ExecutionState {
    all: BTreeSet<Index>,
    completed: BTreeSet<Index>,
    pending: BTreeSet<Index>,
    workers: Vec<Rank>,
    /// Idle workers. The back holds the most recently freed one.
    available: VecDeque<Rank>,
    assignments: HashMap<Rank, Vec<Index>>,
    dead: BTreeSet<Rank>,
    retired: BTreeSet<Rank>,
    primed: HashSet<Rank>,
    batch_size: usize,
}

impl ExecutionState {
    pub fn new<I>(indices: I, workers: &[Rank], batch_size: usize) -> Self
    where
        I: IntoIterator<Item = Index>,
    {
        Self {
            all: indices.into_iter().collect(),
            completed: BTreeSet::new(),
            pending: BTreeSet::new(),
            workers: workers.to_vec(),
            available: workers.iter().rev().copied().collect(),
            assignments: HashMap::new(),
            dead: BTreeSet::new(),
            retired: BTreeSet::new(),
            primed: HashSet::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn total(&self) -> usize {
        self.all.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.all.len()
    }

    pub fn remaining(&self) -> usize {
        self.all.len() - self.completed.len()
    }

    pub fn completed(&self) -> &BTreeSet<Index> {
        &self.completed
    }

    pub fn pending(&self) -> &BTreeSet<Index> {
        &self.pending
    }

    pub fn available(&self) -> impl Iterator<Item = Rank> + '_ {
        self.available.iter().copied()
    }

    pub fn assignment(&self, worker: Rank) -> Option<&[Index]> {
        self.assignments.get(&worker).map(Vec::as_slice)
    }

    /// Workers dead during this run.
    pub fn dead(&self) -> &BTreeSet<Rank> {
        &self.dead
    }

    /// Workers taken out of this run after a failed exchange.
    pub fn retired(&self) -> &BTreeSet<Rank> {
        &self.retired
    }

    pub fn is_primed(&self, worker: Rank) -> bool {
        self.primed.contains(&worker)
    }

    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !self.dead.contains(w) && !self.retired.contains(w))
            .count()
    }

    /// Indices neither completed nor pending, ascending.
    pub fn incomplete(&self) -> Vec<Index> {
        self.all
            .iter()
            .filter(|i| !self.completed.contains(i) && !self.pending.contains(i))
            .copied()
            .collect()
    }

    /// Hands out work to every idle worker that can get some.
    ///
    /// Idle workers are visited from the back of the queue. The one at
    /// position `p` of `k` takes the snapshot entries `j` with `j % k == p`,
    /// up to the batch size, so workers in the same round never overlap.
    /// A worker that gets nothing is moved to the front of the queue.
    pub fn assign_round(&mut self) -> Vec<(Rank, Vec<Index>)> {
        let snapshot = self.incomplete();
        let idle: Vec<Rank> = self.available.iter().rev().copied().collect();
        let stride = idle.len();
        let mut assigned = Vec::new();

        for (position, worker) in idle.into_iter().enumerate() {
            let selected: Vec<Index> = snapshot
                .iter()
                .enumerate()
                .filter(|(j, _)| j % stride == position)
                .map(|(_, &index)| index)
                .take(self.batch_size)
                .collect();

            self.available.retain(|&w| w != worker);
            if selected.is_empty() {
                self.available.push_front(worker);
                continue;
            }

            self.pending.extend(selected.iter().copied());
            self.assignments.insert(worker, selected.clone());
            assigned.push((worker, selected));
        }

        assigned
    }

    /// Records a finished batch and frees the worker.
    ///
    /// Indices the worker was given but did not report are requeued and
    /// returned. Reported indices outside this run are ignored.
    pub fn complete(&mut self, worker: Rank, reported: &[Index]) -> Vec<Index> {
        let assigned = self.assignments.remove(&worker).unwrap_or_default();

        for index in reported {
            if !self.all.contains(index) {
                tracing::warn!(
                    "Node {} reported index {} which is not part of this run",
                    worker,
                    index
                );
                continue;
            }
            self.pending.remove(index);
            self.completed.insert(*index);
        }

        let requeued: Vec<Index> = assigned
            .into_iter()
            .filter(|index| !self.completed.contains(index))
            .collect();
        for index in &requeued {
            self.pending.remove(index);
        }
        if !requeued.is_empty() {
            tracing::warn!("Node {} did not report indices {:?}; requeued", worker, requeued);
        }

        self.primed.insert(worker);
        let in_service = !self.dead.contains(&worker) && !self.retired.contains(&worker);
        if in_service && !self.available.contains(&worker) {
            self.available.push_back(worker);
        }
        requeued
    }

    /// Dead-worker recovery. Returns the requeued indices; a worker already
    /// marked dead is left alone.
    pub fn mark_dead(&mut self, worker: Rank) -> Vec<Index> {
        if !self.dead.insert(worker) {
            return Vec::new();
        }
        self.release(worker)
    }

    /// Takes a worker out of this run without declaring it dead.
    pub fn retire(&mut self, worker: Rank) -> Vec<Index> {
        if self.dead.contains(&worker) || !self.retired.insert(worker) {
            return Vec::new();
        }
        self.release(worker)
    }

    fn release(&mut self, worker: Rank) -> Vec<Index> {
        self.available.retain(|&w| w != worker);
        let requeued = self.assignments.remove(&worker).unwrap_or_default();
        for index in &requeued {
            self.pending.remove(index);
        }
        requeued
    }

    pub fn progress(&self, command: &str) -> Progress {
        Progress {
            command: command.to_string(),
            pending: self.pending.len(),
            completed: self.completed.len(),
            total: self.all.len(),
            available: self.available.len(),
            running: self.assignments.len(),
            dead: self.dead.len(),
            finished: self.is_complete(),
        }
    }
}
