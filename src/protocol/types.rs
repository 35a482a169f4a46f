use crate::value::{Grid, Value};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One unit of the overall workload (e.g. a row of a dataset).
pub type Index = usize;

/// Shuts a worker down. Acknowledged before the worker exits its loop.
pub const FINISH_COMMAND: &str = "__FINISH_JOB__";
/// Asks a worker for its host identifier. Not a unit of work.
pub const IDENTIFY_COMMAND: &str = "__IDENTIFY_NODE__";
/// Reserved variable listing the names the worker may serve from its cache.
pub const CACHED_VARIABLES_FIELD: &str = "__CACHED_VARIABLES__";
/// Reserved variable asking the worker to run the handler once for the whole batch.
pub const ALL_INDICES_AT_ONCE_FIELD: &str = "__ALL_INDICES_AT_ONCE__";

static EMPTY: Value = Value::Empty;

pub fn is_reserved_command(command: &str) -> bool {
    command == FINISH_COMMAND || command == IDENTIFY_COMMAND
}

/// Encodes variable names as an `n x 1` grid of text cells.
pub fn name_list<I, S>(names: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut grid = Grid::new(0, 1);
    for (row, name) in names.into_iter().enumerate() {
        grid.set(row, 0, Value::text(name));
    }
    Value::Grid(grid)
}

/// Inverse of [`name_list`]. A bare text value is read as a single name.
pub fn names_in(value: &Value) -> Vec<String> {
    match value {
        Value::Text(name) => vec![name.clone()],
        Value::Grid(grid) => (0..grid.rows())
            .flat_map(|row| (0..grid.cols()).map(move |col| (row, col)))
            .filter_map(|(row, col)| grid.get(row, col).as_text().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// How a named variable is shipped to (or collected from) workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VariableKind {
    /// Sent whole on every dispatch.
    #[default]
    Complete,
    /// Only the rows matching the dispatched indices are sent.
    PartialRows,
    /// Only the columns matching the dispatched indices are sent.
    PartialCols,
    /// Rows hold offsets into a feature side file, resolved at dispatch time.
    FeatureStrippedRow,
    /// Sent once per worker, then replaced by an empty placeholder.
    Cached,
    /// Output only: every column is written to its own file instead of merged.
    DsWorkColumn,
}

impl VariableKind {
    pub fn is_partial(&self) -> bool {
        matches!(self, VariableKind::PartialRows | VariableKind::PartialCols)
    }
}

/// A unit of work: a command, the indices to run it on, and its inputs.
///
/// `kinds` declares the partitioning policy per variable name (inputs and
/// outputs alike). It never leaves the master.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Job {
    pub command: String,
    pub indices: Vec<Index>,
    pub variables: BTreeMap<String, Value>,
    pub kinds: HashMap<String, VariableKind>,
}

impl Job {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_indices<I: IntoIterator<Item = Index>>(mut self, indices: I) -> Self {
        self.indices = indices.into_iter().collect();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_kind(mut self, name: impl Into<String>, kind: VariableKind) -> Self {
        self.kinds.insert(name.into(), kind);
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn declare(&mut self, name: impl Into<String>, kind: VariableKind) {
        self.kinds.insert(name.into(), kind);
    }

    /// The named input, or the empty value when absent.
    pub fn input(&self, name: &str) -> &Value {
        self.variables.get(name).unwrap_or(&EMPTY)
    }

    pub fn kind_of(&self, name: &str) -> VariableKind {
        self.kinds.get(name).copied().unwrap_or_default()
    }

    pub fn is_all_indices_at_once(&self) -> bool {
        self.variables.contains_key(ALL_INDICES_AT_ONCE_FIELD)
    }
}

/// What a worker hands back: the indices it processed and their outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    pub command: String,
    pub indices: Vec<Index>,
    pub variables: BTreeMap<String, Value>,
}

impl JobOutput {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// An output for `job` that reports all of its indices and no variables.
    pub fn for_job(job: &Job) -> Self {
        Self {
            command: job.command.clone(),
            indices: job.indices.clone(),
            variables: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> &Value {
        self.variables.get(name).unwrap_or(&EMPTY)
    }

    /// Folds another partial output into this one.
    pub fn absorb(&mut self, other: JobOutput) {
        for index in other.indices {
            if !self.indices.contains(&index) {
                self.indices.push(index);
            }
        }
        for (name, value) in other.variables {
            self.variables.entry(name).or_default().merge(&value);
        }
    }
}
