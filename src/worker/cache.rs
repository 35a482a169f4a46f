use crate::protocol::{CACHED_VARIABLES_FIELD, Job, names_in};
use crate::value::Value;

use dashmap::DashMap;

/// Worker-local copies of variables the master only sends once.
#[derive(Default)]
pub struct VariableCache {
    entries: DashMap<String, Value>,
}

impl VariableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the cacheable variables listed on `job`.
    ///
    /// A received payload refreshes the cache; an empty placeholder is
    /// replaced by the cached copy. The listing itself is removed so
    /// handlers never see it.
    pub fn apply(&self, job: &mut Job) {
        let Some(listing) = job.variables.remove(CACHED_VARIABLES_FIELD) else {
            return;
        };

        for name in names_in(&listing) {
            match job.variables.get(&name) {
                Some(value) if !value.is_empty() => {
                    tracing::debug!("Caching variable {} for later jobs", name);
                    self.entries.insert(name, value.clone());
                }
                _ => match self.entries.get(&name) {
                    Some(cached) => {
                        tracing::trace!("Using cached copy of {}", name);
                        job.variables.insert(name.clone(), cached.value().clone());
                    }
                    None => {
                        tracing::warn!(
                            "Variable {} was withheld as cached but no local copy exists",
                            name
                        );
                    }
                },
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
