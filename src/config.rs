//! Scheduler Configuration
//!
//! Defaults, then an optional JSON file, then `CLUSTER_*` environment
//! variables, then command-line flags (applied by the binary).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::Index;
use crate::transport::Rank;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Derive batch size and checkpoint interval from the workload size.
    pub intelligent_parameters: bool,
    /// Indices per dispatch when `intelligent_parameters` is off.
    pub batch_size: usize,
    /// Completed indices between checkpoints when `intelligent_parameters` is off.
    pub checkpoint_interval: usize,
    pub checkpoint_variables: bool,
    /// Indices per partial-variable chunk file.
    pub partial_chunk_size: usize,
    /// Sleep between master loop iterations.
    pub wait_interval_ms: u64,
    pub temp_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Output names to restore from checkpoints before dispatching.
    pub resume_from: Vec<String>,
    /// Run each batch through the handler in a single call.
    pub all_indices_at_once: bool,
    pub debug_node: Option<Rank>,
    pub debug_single_index: Option<Index>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            intelligent_parameters: true,
            batch_size: 5,
            checkpoint_interval: 50,
            checkpoint_variables: true,
            partial_chunk_size: 50,
            wait_interval_ms: 100,
            temp_dir: std::env::temp_dir().join("distributed_exec"),
            working_dir: PathBuf::from("."),
            resume_from: Vec::new(),
            all_indices_at_once: false,
            debug_node: None,
            debug_single_index: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// File (when given) plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `CLUSTER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CLUSTER_BATCH_SIZE") {
            self.batch_size = parse("CLUSTER_BATCH_SIZE", &value)?;
            self.intelligent_parameters = false;
        }
        if let Some(value) = lookup("CLUSTER_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse("CLUSTER_CHECKPOINT_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("CLUSTER_WAIT_INTERVAL_MS") {
            self.wait_interval_ms = parse("CLUSTER_WAIT_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("CLUSTER_CHUNK_SIZE") {
            self.partial_chunk_size = parse("CLUSTER_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("CLUSTER_TEMP_DIR") {
            self.temp_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CLUSTER_WORKING_DIR") {
            self.working_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CLUSTER_RESUME") {
            self.resume_from = value
                .split(';')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("CLUSTER_CHECKPOINT") {
            self.checkpoint_variables = parse_bool("CLUSTER_CHECKPOINT", &value)?;
        }
        if let Some(value) = lookup("CLUSTER_INTELLIGENT") {
            self.intelligent_parameters = parse_bool("CLUSTER_INTELLIGENT", &value)?;
        }
        if let Some(value) = lookup("CLUSTER_ALL_INDICES_AT_ONCE") {
            self.all_indices_at_once = parse_bool("CLUSTER_ALL_INDICES_AT_ONCE", &value)?;
        }
        Ok(())
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.working_dir.join("checkpoints")
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid value for {}: {:?}", key, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = SchedulerConfig::default();

        config
            .apply_overrides(lookup_from(&[
                ("CLUSTER_BATCH_SIZE", "8"),
                ("CLUSTER_RESUME", "Output; Labels;"),
                ("CLUSTER_CHECKPOINT", "off"),
                ("CLUSTER_WAIT_INTERVAL_MS", "0"),
            ]))
            .unwrap();

        assert_eq!(config.batch_size, 8);
        assert!(!config.intelligent_parameters, "explicit batch size disables the heuristics");
        assert_eq!(config.resume_from, vec!["Output".to_string(), "Labels".to_string()]);
        assert!(!config.checkpoint_variables);
        assert_eq!(config.wait_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = SchedulerConfig::default();

        assert!(config.apply_overrides(lookup_from(&[("CLUSTER_CHUNK_SIZE", "lots")])).is_err());
        assert!(config.apply_overrides(lookup_from(&[("CLUSTER_INTELLIGENT", "maybe")])).is_err());
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let name = format!("scheduler-config-{}.json", uuid::Uuid::new_v4());
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, r#"{ "batch_size": 12, "debug_node": 2 }"#).unwrap();

        let config = SchedulerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.batch_size, 12);
        assert_eq!(config.debug_node, Some(2));
        assert_eq!(config.partial_chunk_size, 50);
        assert!(config.intelligent_parameters);
    }
}
