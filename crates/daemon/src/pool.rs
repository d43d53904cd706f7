//! Worker pool sizing
//!
//! Derives how many CRF searchers and encoders to run from the CPU core count
//! and configuration.

use crate::config::Config;

/// Worker counts derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of concurrent CRF searcher actors
    pub crf_searchers: u32,
    /// Number of concurrent encodes
    pub encoders: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - One searcher per 8 cores, between 1 and 4 (unless explicit)
    /// - 2 encoders for 24+ cores, 1 otherwise (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .workers
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let crf_searchers = if cfg.workers.crf_searchers > 0 {
            cfg.workers.crf_searchers
        } else {
            derive_searchers(total_cores)
        };

        let encoders = if cfg.workers.encoders > 0 {
            cfg.workers.encoders
        } else {
            derive_encoders(total_cores)
        };

        Self {
            total_cores,
            crf_searchers,
            encoders,
        }
    }
}

/// Each search runs sampled encodes plus VMAF scoring, roughly 8 cores' worth
fn derive_searchers(cores: u32) -> u32 {
    (cores / 8).clamp(1, 4)
}

fn derive_encoders(cores: u32) -> u32 {
    if cores >= 24 {
        2
    } else {
        1
    }
}
