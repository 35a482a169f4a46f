//! Completion-side handling of output variables.
//!
//! - Complete outputs are union-merged into the run's accumulator.
//! - Partial row/column outputs are merged too, but flushed to
//!   `<temp_dir>/<name>/<chunk>.bin` and reset every `partial_chunk_size`
//!   indices so the master never holds the whole variable.
//! - DSWork column outputs are never accumulated: each column is written to
//!   `<working_dir>/<name>/<index + 1>.bin` as a record of its populated rows.
//! - Accumulated outputs are checkpointed once enough indices have arrived.

use crate::checkpoint::{CheckpointStore, Restored};
use crate::config::SchedulerConfig;
use crate::protocol::{Index, JobOutput, VariableKind};
use crate::value::Value;

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Row markers of a DSWork column file.
pub const COLUMN_CONTENTS_FIELD: &str = "contents";

pub struct CheckpointPolicy {
    pub store: CheckpointStore,
    pub interval: usize,
}

pub struct OutputAccumulator {
    kinds: HashMap<String, VariableKind>,
    outputs: BTreeMap<String, Value>,
    temp_dir: PathBuf,
    working_dir: PathBuf,
    chunk_size: usize,
    partial_indices: HashMap<String, Vec<Index>>,
    chunks_written: usize,
    column_dirs: HashSet<String>,
    checkpoint: Option<CheckpointPolicy>,
    counts_since_checkpoint: HashMap<String, usize>,
    covered: HashMap<String, Vec<Index>>,
}

impl OutputAccumulator {
    pub fn new(
        kinds: HashMap<String, VariableKind>,
        config: &SchedulerConfig,
        checkpoint: Option<CheckpointPolicy>,
    ) -> Self {
        Self {
            kinds,
            outputs: BTreeMap::new(),
            temp_dir: config.temp_dir.clone(),
            working_dir: config.working_dir.clone(),
            chunk_size: config.partial_chunk_size.max(1),
            partial_indices: HashMap::new(),
            chunks_written: 0,
            column_dirs: HashSet::new(),
            checkpoint,
            counts_since_checkpoint: HashMap::new(),
            covered: HashMap::new(),
        }
    }

    /// Seeds the accumulator with checkpointed output, so later checkpoints
    /// keep covering the restored indices.
    pub fn restore(&mut self, restored: Restored) {
        let covered: Vec<Index> = restored.covered.into_iter().collect();
        for (name, value) in restored.values {
            self.covered.insert(name.clone(), covered.clone());
            self.outputs.entry(name).or_default().merge(&value);
        }
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    fn kind_of(&self, name: &str) -> VariableKind {
        self.kinds.get(name).copied().unwrap_or_default()
    }

    pub fn absorb(&mut self, output: &JobOutput) {
        for (name, value) in &output.variables {
            let (rows, cols) = value.dimensions();
            tracing::debug!("Found output: {} ({} x {})", name, rows, cols);

            match self.kind_of(name) {
                kind if kind.is_partial() => self.absorb_partial(name, value, &output.indices),
                VariableKind::DsWorkColumn => self.write_columns(name, value, &output.indices),
                _ => self.outputs.entry(name.clone()).or_default().merge(value),
            }
        }

        self.checkpoint_outputs(&output.indices);
    }

    fn absorb_partial(&mut self, name: &str, value: &Value, indices: &[Index]) {
        self.outputs.entry(name.to_string()).or_default().merge(value);
        let pending = self.partial_indices.entry(name.to_string()).or_default();
        pending.extend_from_slice(indices);

        if pending.len() >= self.chunk_size {
            tracing::info!("Saving chunk {} for partial variable {}", self.chunks_written, name);
            self.flush_chunk(name);
        }
    }

    fn flush_chunk(&mut self, name: &str) {
        let value = self.outputs.remove(name).unwrap_or_default();
        self.partial_indices.remove(name);

        let path = self.temp_dir.join(name).join(format!("{}.bin", self.chunks_written));
        self.chunks_written += 1;
        if let Err(e) = save_creating_parent(&value, &path) {
            tracing::error!("Could not save chunk of {}: {:#}", name, e);
        }
    }

    fn write_columns(&mut self, name: &str, value: &Value, indices: &[Index]) {
        let directory = self.working_dir.join(name);
        if self.column_dirs.insert(name.to_string()) {
            if directory.exists() {
                if let Err(e) = std::fs::remove_dir_all(&directory) {
                    tracing::warn!("Could not clear {}: {}", directory.display(), e);
                }
            }
            if let Err(e) = std::fs::create_dir_all(&directory) {
                tracing::error!("Could not create {}: {}", directory.display(), e);
            }
        }

        let Some(grid) = value.as_grid() else {
            tracing::warn!("DSWork output {} is not a grid; nothing written", name);
            return;
        };

        for &index in indices {
            if index >= grid.cols() {
                tracing::warn!("No output data was found in column {} of {}", index, name);
                continue;
            }

            let mut fields = BTreeMap::new();
            let mut rows = Vec::new();
            for row in 0..grid.rows() {
                let entry = grid.get(row, index);
                if entry.has_content() {
                    rows.push((row + 1) as f64);
                    fields.insert(format!("data{}", row + 1), entry.clone());
                }
            }
            if rows.is_empty() {
                tracing::warn!("Column {} of {} has no populated rows; skipped", index, name);
                continue;
            }
            fields.insert(COLUMN_CONTENTS_FIELD.to_string(), Value::column(rows));

            let path = directory.join(format!("{}.bin", index + 1));
            if let Err(e) = Value::Record(fields).save_to_file(&path) {
                tracing::error!("Could not save column {} of {}: {:#}", index, name, e);
            }
        }
    }

    fn checkpoint_outputs(&mut self, indices: &[Index]) {
        let Some(policy) = &self.checkpoint else {
            return;
        };

        for (name, value) in &self.outputs {
            let kind = self.kinds.get(name).copied().unwrap_or_default();
            if kind.is_partial() || kind == VariableKind::DsWorkColumn {
                continue;
            }

            let count = self.counts_since_checkpoint.entry(name.clone()).or_default();
            *count += indices.len();
            let covered = self.covered.entry(name.clone()).or_default();
            covered.extend_from_slice(indices);

            if *count >= policy.interval {
                if let Err(e) = policy.store.checkpoint(name, value, covered.as_slice()) {
                    tracing::warn!("Checkpoint of {} failed: {:#}", name, e);
                }
                *count = 0;
            }
        }
    }

    /// Returns the accumulated outputs, then writes out any partial chunks
    /// still held in memory.
    pub fn finish(mut self) -> BTreeMap<String, Value> {
        let outputs = self.outputs.clone();

        let mut names: Vec<String> = self.partial_indices.keys().cloned().collect();
        names.sort();
        for name in names {
            if self.partial_indices.get(&name).is_some_and(|indices| !indices.is_empty()) {
                tracing::info!("Saving final chunk for partial variable {}", name);
                self.flush_chunk(&name);
            }
        }

        outputs
    }
}

fn save_creating_parent(value: &Value, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    value.save_to_file(path)
}
