//! Memory budget - byte accounting of resident decode sessions against a device ceiling.
//!
//! The resident-count budget alone cannot tell a 4K session from a 360p one,
//! so every committed session also charges its estimated bytes here.
//! Exceeding the byte ceiling triggers the same eviction pass as exceeding
//! the count.

use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use sysinfo::System;

const MB: usize = 1024 * 1024;

/// Byte budget for resident decode sessions
#[derive(Debug)]
pub struct MemoryBudget {
    /// Bytes held by resident sessions
    usage: AtomicUsize,
    /// Highest usage observed
    peak: AtomicUsize,
    /// Ceiling (bytes)
    limit: usize,
}

impl MemoryBudget {
    /// Budget with an explicit ceiling in bytes
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            usage: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit: limit_bytes,
        }
    }

    /// Budget derived from currently available system memory
    ///
    /// * `mem_fraction` - fraction of usable memory (0.0-1.0)
    /// * `reserve_gb` - memory left untouched for the OS and the UI
    pub fn from_system(mem_fraction: f64, reserve_gb: f64) -> Self {
        let limit = Self::system_limit(mem_fraction, reserve_gb);
        info!(
            "MemoryBudget init: limit={} MB ({}% of available minus {:.1} GB reserve)",
            limit / MB,
            (mem_fraction * 100.0) as u32,
            reserve_gb
        );
        Self::with_limit(limit)
    }

    fn system_limit(mem_fraction: f64, reserve_gb: f64) -> usize {
        let mut sys = System::new();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * MB as f64) as usize;
        let usable = available.saturating_sub(reserve);
        (usable as f64 * mem_fraction.clamp(0.0, 1.0)) as usize
    }

    /// Charge a newly resident session
    pub fn add(&self, bytes: usize) {
        let new_usage = self.usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(new_usage, Ordering::Relaxed);
        let limit = self.limit();
        if new_usage > limit {
            debug!(
                "Decode memory over budget: {} MB / {} MB",
                new_usage / MB,
                limit / MB
            );
        }
    }

    /// Credit a released session (saturating)
    pub fn free(&self, bytes: usize) {
        let _ = self
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn over_limit(&self) -> bool {
        self.usage() > self.limit()
    }
}
