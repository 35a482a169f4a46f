use crate::protocol::Index;
use crate::value::Value;
use crate::value::types::codec;

use anyhow::{Context, Result, bail};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct ValueRecord {
    generation: Uuid,
    index_count: u64,
    value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndicesRecord {
    generation: Uuid,
    indices: Vec<Index>,
}

/// Output restored from disk at the start of a run.
#[derive(Debug, Default)]
pub struct Restored {
    pub values: BTreeMap<String, Value>,
    /// Indices covered by every restored variable.
    pub covered: BTreeSet<Index>,
}

/// File-per-variable checkpoint directory.
///
/// Each variable owns two files, `<name>_checkpoint.bin` (the merged value)
/// and `<name>_checkpoint_indices.bin` (the indices it covers). Both carry
/// the same generation token, and the value file records how many indices
/// it was written for, so a pair torn by a crash between the two writes is
/// rejected on load.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn value_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_checkpoint.bin", name))
    }

    pub fn indices_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_checkpoint_indices.bin", name))
    }

    pub fn save(
        &self,
        name: &str,
        value: &Value,
        generation: Uuid,
        index_count: usize,
    ) -> Result<()> {
        let record = ValueRecord {
            generation,
            index_count: index_count as u64,
            value: value.clone(),
        };
        write_atomic(&self.value_path(name), &bincode::serialize(&record)?)
    }

    pub fn save_indices(&self, name: &str, indices: &[Index], generation: Uuid) -> Result<()> {
        let record = IndicesRecord {
            generation,
            indices: indices.to_vec(),
        };
        write_atomic(&self.indices_path(name), &bincode::serialize(&record)?)
    }

    /// Persists `value` together with the indices it covers.
    pub fn checkpoint(&self, name: &str, value: &Value, indices: &[Index]) -> Result<()> {
        let generation = Uuid::new_v4();
        self.save(name, value, generation, indices.len())?;
        self.save_indices(name, indices, generation)?;

        tracing::info!(
            "Checkpointed {} ({} indices) to {}",
            name,
            indices.len(),
            self.dir.display()
        );
        Ok(())
    }

    /// Loads every named checkpoint that is present and consistent.
    ///
    /// Invalid or missing pairs are logged and skipped. `covered` is the
    /// intersection of the indices of all restored variables, since an
    /// index only counts as done when every output for it survived.
    pub fn load(&self, names: &[String]) -> Restored {
        let mut restored = Restored::default();
        let mut covered: Option<BTreeSet<Index>> = None;

        for name in names {
            match self.load_one(name) {
                Ok((value, indices)) => {
                    let count = indices.len();
                    tracing::info!("Restored checkpoint for {} covering {} indices", name, count);
                    let indices: BTreeSet<Index> = indices.into_iter().collect();
                    covered = Some(match covered {
                        Some(acc) => acc.intersection(&indices).copied().collect(),
                        None => indices,
                    });
                    restored.values.insert(name.clone(), value);
                }
                Err(e) => {
                    tracing::warn!("Ignoring checkpoint for {}: {:#}", name, e);
                }
            }
        }

        restored.covered = covered.unwrap_or_default();
        restored
    }

    fn load_one(&self, name: &str) -> Result<(Value, Vec<Index>)> {
        let value_path = self.value_path(name);
        let indices_path = self.indices_path(name);

        let value_bytes = std::fs::read(&value_path)
            .with_context(|| format!("Could not read {}", value_path.display()))?;
        let indices_bytes = std::fs::read(&indices_path)
            .with_context(|| format!("Could not read {}", indices_path.display()))?;

        let value: ValueRecord = codec()
            .deserialize(&value_bytes)
            .with_context(|| format!("Corrupt checkpoint {}", value_path.display()))?;
        let indices: IndicesRecord = codec()
            .deserialize(&indices_bytes)
            .with_context(|| format!("Corrupt checkpoint {}", indices_path.display()))?;

        if value.generation != indices.generation {
            bail!(
                "value and index files belong to different checkpoints ({} vs {})",
                value.generation,
                indices.generation
            );
        }
        if value.index_count as usize != indices.indices.len() {
            bail!(
                "value covers {} indices but the index file lists {}",
                value.index_count,
                indices.indices.len()
            );
        }

        Ok((value.value, indices.indices))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }

    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("Could not write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Could not move {} into place", tmp.display()))?;
    Ok(())
}
