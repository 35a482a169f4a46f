use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

static UNSET: Value = Value::Empty;

/// Upper bound on one encoded value, on the wire and on disk.
pub const MAX_ENCODED_BYTES: u64 = 1 << 30;

/// Fixed-width bincode, the same layout as `bincode::serialize`, with a size cap.
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_ENCODED_BYTES)
}

/// A named variable's payload.
///
/// `Empty` doubles as the "unset" marker inside grids and as the explicit
/// placeholder sent in place of a cached variable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Empty,
    Scalar(f64),
    Text(String),
    /// Dense feature vector, as read from a feature side file.
    Vector(Vec<f32>),
    Grid(Grid),
    Record(BTreeMap<String, Value>),
}

/// Row-major two-dimensional array of values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<Value>,
}

impl Grid {
    /// Creates a grid with every cell unset.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![Value::Empty; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Returns the cell at `(row, col)`, or the unset value when out of range.
    pub fn get(&self, row: usize, col: usize) -> &Value {
        if row >= self.rows || col >= self.cols {
            return &UNSET;
        }
        &self.cells[row * self.cols + col]
    }

    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut Value> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        Some(&mut self.cells[row * self.cols + col])
    }

    /// Sets a cell, growing the grid when the position lies outside it.
    pub fn set(&mut self, row: usize, col: usize, value: Value) {
        if row >= self.rows || col >= self.cols {
            self.resize(self.rows.max(row + 1), self.cols.max(col + 1));
        }
        let cols = self.cols;
        self.cells[row * cols + col] = value;
    }

    /// Number of cells holding something other than the unset value.
    pub fn populated(&self) -> usize {
        self.cells.iter().filter(|cell| cell.has_content()).count()
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        let mut cells = vec![Value::Empty; rows * cols];
        for row in 0..self.rows.min(rows) {
            for col in 0..self.cols.min(cols) {
                cells[row * cols + col] = std::mem::take(&mut self.cells[row * self.cols + col]);
            }
        }
        self.rows = rows;
        self.cols = cols;
        self.cells = cells;
    }

    fn merge(&mut self, other: &Grid) {
        if other.rows > self.rows || other.cols > self.cols {
            self.resize(self.rows.max(other.rows), self.cols.max(other.cols));
        }
        for row in 0..other.rows {
            for col in 0..other.cols {
                let incoming = other.get(row, col);
                if incoming.is_empty() {
                    continue;
                }
                if let Some(cell) = self.get_mut(row, col) {
                    if cell.is_empty() {
                        *cell = incoming.clone();
                    }
                }
            }
        }
    }
}

impl Value {
    /// Builds an `n x 1` grid of scalars.
    pub fn column<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let values: Vec<f64> = values.into_iter().collect();
        let mut grid = Grid::new(values.len(), 1);
        for (row, value) in values.into_iter().enumerate() {
            grid.set(row, 0, Value::Scalar(value));
        }
        Value::Grid(grid)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// True when the value carries data (an empty grid or record does not).
    pub fn has_content(&self) -> bool {
        match self {
            Value::Empty => false,
            Value::Scalar(_) => true,
            Value::Text(text) => !text.is_empty(),
            Value::Vector(vector) => !vector.is_empty(),
            Value::Grid(grid) => grid.populated() > 0,
            Value::Record(fields) => !fields.is_empty(),
        }
    }

    pub fn scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_grid(&self) -> Option<&Grid> {
        match self {
            Value::Grid(grid) => Some(grid),
            _ => None,
        }
    }

    pub fn as_grid_mut(&mut self) -> Option<&mut Grid> {
        match self {
            Value::Grid(grid) => Some(grid),
            _ => None,
        }
    }

    /// Field lookup on a record; unset for anything else.
    pub fn field(&self, name: &str) -> &Value {
        match self {
            Value::Record(fields) => fields.get(name).unwrap_or(&UNSET),
            _ => &UNSET,
        }
    }

    /// `(rows, cols)`; scalars and records count as `1 x 1`.
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            Value::Empty => (0, 0),
            Value::Grid(grid) => (grid.rows, grid.cols),
            Value::Vector(vector) => (1, vector.len()),
            _ => (1, 1),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Scalar(_) => "scalar",
            Value::Text(_) => "text",
            Value::Vector(_) => "vector",
            Value::Grid(_) => "grid",
            Value::Record(_) => "record",
        }
    }

    /// Union-merges `other` into `self`.
    ///
    /// Entries already set on `self` win. Only grids and records merge
    /// element-wise; two populated leaves keep the left-hand side.
    pub fn merge(&mut self, other: &Value) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }

        match (self, other) {
            (Value::Grid(this), Value::Grid(that)) => this.merge(that),
            (Value::Record(this), Value::Record(that)) => {
                for (name, incoming) in that {
                    match this.get_mut(name) {
                        Some(existing) if existing.is_empty() => *existing = incoming.clone(),
                        Some(_) => {}
                        None => {
                            this.insert(name.clone(), incoming.clone());
                        }
                    }
                }
            }
            (this, that) => {
                tracing::warn!(
                    "Cannot merge {} into {}; keeping existing value",
                    that.variant_name(),
                    this.variant_name()
                );
            }
        }
    }

    /// Same-shaped grid carrying only the given rows.
    ///
    /// Non-grid values are returned unchanged.
    pub fn slice_rows(&self, rows: &[usize]) -> Value {
        let Value::Grid(grid) = self else {
            return self.clone();
        };
        let mut partial = Grid::new(grid.rows, grid.cols);
        for &row in rows {
            if row >= grid.rows {
                continue;
            }
            for col in 0..grid.cols {
                partial.set(row, col, grid.get(row, col).clone());
            }
        }
        Value::Grid(partial)
    }

    /// Same-shaped grid carrying only the given columns.
    pub fn slice_cols(&self, cols: &[usize]) -> Value {
        let Value::Grid(grid) = self else {
            return self.clone();
        };
        let mut partial = Grid::new(grid.rows, grid.cols);
        for &col in cols {
            if col >= grid.cols {
                continue;
            }
            for row in 0..grid.rows {
                partial.set(row, col, grid.get(row, col).clone());
            }
        }
        Value::Grid(partial)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Decodes a value; a corrupt length prefix is rejected instead of
    /// being trusted for an allocation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
        Ok(codec().deserialize(bytes)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("Could not save value to {}", path.display()))
    }

    pub fn load_from_file(path: &Path) -> Result<Value> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Could not read value from {}", path.display()))?;
        Value::from_bytes(&bytes)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<Vec<f32>> for Value {
    fn from(vector: Vec<f32>) -> Self {
        Value::Vector(vector)
    }
}

impl From<Grid> for Value {
    fn from(grid: Grid) -> Self {
        Value::Grid(grid)
    }
}
