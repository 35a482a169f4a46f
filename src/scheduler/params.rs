//! Batch size and checkpoint interval selection.

use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub batch_size: usize,
    /// `None` disables checkpointing for the run.
    pub checkpoint_interval: Option<usize>,
}

impl Parameters {
    pub fn resolve(config: &SchedulerConfig, total: usize, workers: usize) -> Self {
        let (batch_size, interval) = if config.intelligent_parameters {
            let batch_size = intelligent_batch_size(total, workers);
            (batch_size, intelligent_checkpoint_interval(batch_size, workers))
        } else {
            (config.batch_size.max(1), config.checkpoint_interval.max(1))
        };

        Self {
            batch_size,
            checkpoint_interval: config.checkpoint_variables.then_some(interval),
        }
    }
}

/// Batch size by workload size, capped so every worker gets a share.
pub fn intelligent_batch_size(total: usize, workers: usize) -> usize {
    let preferred = match total {
        0..15 => 3,
        15..30 => 7,
        30..100 => 10,
        _ => 25,
    };
    let share = total / workers.max(1);
    preferred.min(share).max(1)
}

pub fn intelligent_checkpoint_interval(batch_size: usize, workers: usize) -> usize {
    let multiplier = match workers {
        0..5 => 2,
        5..50 => 10,
        50..100 => 20,
        _ => 50,
    };
    batch_size * multiplier
}
