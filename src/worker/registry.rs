//! Command Registry
//!
//! Maps command names (e.g. "extract_features") to the code that runs them.
//! Populated once at process startup on every node, read-only afterwards.

use crate::protocol::{Job, JobOutput, is_reserved_command};

use dashmap::DashMap;
use std::sync::Arc;

/// Something that can run one job and describe its result.
///
/// Plain functions and closures of shape `Fn(&Job) -> JobOutput` implement
/// this automatically.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, job: &Job) -> JobOutput;
}

impl<F> CommandHandler for F
where
    F: Fn(&Job) -> JobOutput + Send + Sync,
{
    fn execute(&self, job: &Job) -> JobOutput {
        self(job)
    }
}

/// Registry holding the mapping between command names and their implementation.
pub struct CommandRegistry {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` under `name`.
    ///
    /// The reserved shutdown and identify names are refused: the call logs
    /// an error and returns `false`. Re-registering a name replaces it.
    pub fn register<H>(&self, name: &str, handler: H) -> bool
    where
        H: CommandHandler + 'static,
    {
        if is_reserved_command(name) {
            tracing::error!("Cannot register a handler under reserved command name {}", name);
            return false;
        }

        if self.handlers.insert(name.to_string(), Arc::new(handler)).is_some() {
            tracing::warn!("Replaced existing handler for command {}", name);
        }

        tracing::info!("Registered command handler: {}", name);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    pub fn list_commands(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.handlers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn command_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
