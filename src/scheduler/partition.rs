//! Variable Partitioning
//!
//! Builds the job actually sent to one worker from the caller's template:
//! whole values for complete variables, row/column slices for partial ones,
//! feature vectors resolved from a side file for feature-stripped ones, and
//! an empty placeholder for cached ones once the worker has seen them.

use crate::protocol::{
    ALL_INDICES_AT_ONCE_FIELD, CACHED_VARIABLES_FIELD, Index, Job, VariableKind, name_list,
};
use crate::value::{Grid, Value};

use anyhow::{Context, Result, anyhow};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Record field holding a feature offset (before resolution) or the
/// feature vector (after).
pub const FEATURES_FIELD: &str = "features";

/// A feature side file, opened once per run and rewound for every dispatch.
pub struct FeatureFile {
    path: PathBuf,
    reader: Mutex<BufReader<File>>,
}

impl FeatureFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Could not open feature file {}", path.display()))?;
        tracing::debug!("Opened feature file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            reader: Mutex::new(BufReader::new(file)),
        })
    }

    /// Reads the vectors at `offsets`, starting from the top of the file.
    pub fn read(
        &self,
        dimensions: usize,
        offsets: &BTreeSet<u64>,
    ) -> Result<BTreeMap<u64, Vec<f32>>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        reader
            .rewind()
            .with_context(|| format!("Could not rewind feature file {}", self.path.display()))?;
        read_features(&mut *reader, dimensions, offsets)
            .with_context(|| format!("Could not read features from {}", self.path.display()))
    }
}

/// Opens every attached feature file. A file that cannot be opened is
/// logged and left out, which skips its variable on every dispatch.
pub fn open_feature_files(paths: &HashMap<String, PathBuf>) -> HashMap<String, FeatureFile> {
    let mut files = HashMap::new();
    for (name, path) in paths {
        match FeatureFile::open(path) {
            Ok(file) => {
                files.insert(name.clone(), file);
            }
            Err(e) => tracing::error!("Feature file for {} is unavailable: {:#}", name, e),
        }
    }
    files
}

pub struct Partitioner<'a> {
    pub template: &'a Job,
    pub feature_files: &'a HashMap<String, FeatureFile>,
    pub feature_dimensions: Option<usize>,
    pub all_indices_at_once: bool,
}

impl Partitioner<'_> {
    /// The job for one dispatch of `indices`. `primed` tells whether the
    /// worker already holds the cached variables.
    pub fn build(&self, indices: &[Index], primed: bool) -> Job {
        let template = self.template;
        let mut rows = indices.to_vec();
        rows.sort_unstable();

        let mut job = Job::new(template.command.clone()).with_indices(indices.iter().copied());
        let mut cached = Vec::new();

        for (name, value) in &template.variables {
            let dispatched = match template.kind_of(name) {
                VariableKind::Complete | VariableKind::DsWorkColumn => value.clone(),
                VariableKind::PartialRows => {
                    if value.dimensions().0 <= 1 {
                        tracing::warn!("Variable {} is row-partial but has <= 1 rows", name);
                    }
                    value.slice_rows(&rows)
                }
                VariableKind::PartialCols => {
                    if value.dimensions().1 <= 1 {
                        tracing::warn!("Variable {} is column-partial but has <= 1 columns", name);
                    }
                    value.slice_cols(&rows)
                }
                VariableKind::FeatureStrippedRow => {
                    match self.resolve_features(name, value, &rows) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            tracing::error!("Skipping feature-stripped variable {}: {:#}", name, e);
                            continue;
                        }
                    }
                }
                VariableKind::Cached => {
                    cached.push(name.clone());
                    if primed { Value::Empty } else { value.clone() }
                }
            };
            job.set_variable(name.clone(), dispatched);
        }

        if !cached.is_empty() {
            job.set_variable(CACHED_VARIABLES_FIELD, name_list(cached));
        }
        if self.all_indices_at_once {
            job.set_variable(ALL_INDICES_AT_ONCE_FIELD, Value::Scalar(1.0));
        }
        job
    }

    fn resolve_features(&self, name: &str, value: &Value, rows: &[Index]) -> Result<Value> {
        let dimensions = self
            .feature_dimensions
            .ok_or_else(|| anyhow!("stripped feature dimensions were never set"))?;
        let features = self
            .feature_files
            .get(name)
            .ok_or_else(|| anyhow!("no feature file open"))?;

        let mut partial = value.slice_rows(rows);
        let Some(grid) = partial.as_grid_mut() else {
            return Ok(partial);
        };

        let mut offsets = BTreeSet::new();
        for &row in rows {
            for col in 0..grid.cols() {
                collect_offsets(grid.get(row, col), &mut offsets);
            }
        }

        let vectors = features.read(dimensions, &offsets)?;
        for &row in rows {
            for col in 0..grid.cols() {
                if let Some(cell) = grid.get_mut(row, col) {
                    substitute_features(cell, &vectors);
                }
            }
        }

        Ok(partial)
    }
}

fn collect_offsets(value: &Value, offsets: &mut BTreeSet<u64>) {
    match value {
        Value::Record(fields) => {
            if let Some(Value::Scalar(offset)) = fields.get(FEATURES_FIELD) {
                offsets.insert(*offset as u64);
            }
        }
        Value::Grid(grid) => for_each_cell(grid, |cell| collect_offsets(cell, offsets)),
        _ => {}
    }
}

fn substitute_features(value: &mut Value, vectors: &BTreeMap<u64, Vec<f32>>) {
    match value {
        Value::Record(fields) => {
            if let Some(slot) = fields.get_mut(FEATURES_FIELD) {
                if let Some(offset) = slot.scalar() {
                    if let Some(vector) = vectors.get(&(offset as u64)) {
                        *slot = Value::Vector(vector.clone());
                    }
                }
            }
        }
        Value::Grid(grid) => {
            for row in 0..grid.rows() {
                for col in 0..grid.cols() {
                    if let Some(cell) = grid.get_mut(row, col) {
                        substitute_features(cell, vectors);
                    }
                }
            }
        }
        _ => {}
    }
}

fn for_each_cell<F: FnMut(&Value)>(grid: &Grid, mut f: F) {
    for row in 0..grid.rows() {
        for col in 0..grid.cols() {
            f(grid.get(row, col));
        }
    }
}

/// Reads one `dimensions`-wide little-endian `f32` vector per offset from
/// a reader positioned at the start of the file.
///
/// Offsets are visited in ascending order, so the file is only ever read
/// forward.
pub fn read_features<R: Read + Seek>(
    reader: &mut BufReader<R>,
    dimensions: usize,
    offsets: &BTreeSet<u64>,
) -> Result<BTreeMap<u64, Vec<f32>>> {
    let record_bytes = (dimensions * std::mem::size_of::<f32>()) as u64;
    let mut buffer = vec![0u8; record_bytes as usize];
    let mut position = 0u64;
    let mut vectors = BTreeMap::new();

    for &offset in offsets {
        let start = offset * record_bytes;
        reader
            .seek_relative((start - position) as i64)
            .with_context(|| format!("Could not seek to feature {}", offset))?;
        reader
            .read_exact(&mut buffer)
            .with_context(|| format!("Could not read feature {}", offset))?;
        position = start + record_bytes;

        let vector = buffer
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();
        vectors.insert(offset, vector);
    }

    Ok(vectors)
}
