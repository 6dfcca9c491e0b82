//! Sync counters, exposed as an injected sink so embedders and tests can
//! observe protocol activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
    description: &'static str,
}

impl Counter {
    pub fn new(description: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            description,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
}

/// Counters for the reconciliation protocol
#[derive(Debug)]
pub struct Counters {
    pub num_full_sync: Counter,
    pub num_full_sync_success: Counter,
    pub num_full_sync_failure: Counter,
    pub num_finalized_sync: Counter,
    pub num_finalized_sync_success: Counter,
    pub num_finalized_sync_failure: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            num_full_sync: Counter::new("Number of full-sync sessions started"),
            num_full_sync_success: Counter::new("Number of full-sync sessions completed"),
            num_full_sync_failure: Counter::new("Number of full-sync sessions failed"),
            num_finalized_sync: Counter::new("Number of finalize requests sent"),
            num_finalized_sync_success: Counter::new("Number of finalize requests delivered"),
            num_finalized_sync_failure: Counter::new("Number of finalize requests failed"),
        }
    }
}
