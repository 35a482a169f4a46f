use super::types::Progress;

use std::sync::{Arc, PoisonError, RwLock};

/// Latest progress snapshot, shared with the HTTP status endpoint.
#[derive(Default)]
pub struct ProgressBoard {
    current: RwLock<Progress>,
}

impl ProgressBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `progress`; returns `true` when it differs from the previous snapshot.
    pub fn publish(&self, progress: Progress) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current == progress {
            return false;
        }
        *current = progress;
        true
    }

    pub fn snapshot(&self) -> Progress {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
