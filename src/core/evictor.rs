//! Memory evictor - decides which resident sessions to release and which
//! records to destroy when the feed outgrows its budgets.
//!
//! Selection is pure; the manager gathers candidates under its state lock,
//! asks the evictor which to drop, and performs the disposals itself.
//! `EvictorTimer` drives the periodic pass.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Sender};
use log::{debug, trace, warn};

use super::item::ItemId;

/// Resident record outside the retained window
#[derive(Debug, Clone)]
pub struct ReleaseCandidate {
    pub id: ItemId,
    pub last_transition_at: Instant,
    pub bytes: usize,
}

/// Record that may be destroyed when the feed exceeds `max_records`
#[derive(Debug, Clone)]
pub struct RemovalCandidate {
    pub id: ItemId,
    /// Distance from the focus index in display positions
    pub distance: usize,
    pub last_transition_at: Instant,
}

/// Budget state at the start of a pass
#[derive(Debug, Clone, Copy)]
pub struct ResidentUsage {
    pub count: usize,
    pub bytes: usize,
    pub byte_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryEvictor {
    max_resident: usize,
    /// Fraction of the budgets a pass shrinks down to
    hysteresis: f64,
}

impl MemoryEvictor {
    pub fn new(max_resident: usize, hysteresis: f64) -> Self {
        Self {
            max_resident: max_resident.max(1),
            hysteresis: hysteresis.clamp(0.0, 1.0),
        }
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    /// Resident count a pass shrinks to
    pub fn target_count(&self) -> usize {
        (self.max_resident as f64 * self.hysteresis).floor() as usize
    }

    /// Byte usage a pass shrinks to
    pub fn target_bytes(&self, byte_limit: usize) -> usize {
        (byte_limit as f64 * self.hysteresis).floor() as usize
    }

    /// Whether a budget is exceeded and an on-demand pass must run
    pub fn over_budget(&self, usage: ResidentUsage) -> bool {
        usage.count > self.max_resident || usage.bytes > usage.byte_limit
    }

    /// Pick sessions to release, oldest transition first, until both the
    /// count and the byte targets are met or candidates run out.
    pub fn select_releases(
        &self,
        mut candidates: Vec<ReleaseCandidate>,
        usage: ResidentUsage,
    ) -> Vec<ItemId> {
        candidates.sort_by_key(|c| c.last_transition_at);

        let target_count = self.target_count();
        let target_bytes = self.target_bytes(usage.byte_limit);
        let mut count = usage.count;
        let mut bytes = usage.bytes;

        let mut selected = Vec::new();
        for candidate in candidates {
            if count <= target_count && bytes <= target_bytes {
                break;
            }
            count = count.saturating_sub(1);
            bytes = bytes.saturating_sub(candidate.bytes);
            selected.push(candidate.id);
        }

        trace!(
            "MemoryEvictor: {} -> {} resident (target {}), {} releases",
            usage.count,
            count,
            target_count,
            selected.len()
        );
        selected
    }

    /// Pick `excess` records to destroy: farthest from focus first, then oldest.
    pub fn select_removals(&self, mut candidates: Vec<RemovalCandidate>, excess: usize) -> Vec<ItemId> {
        candidates.sort_by(|a, b| {
            b.distance
                .cmp(&a.distance)
                .then(a.last_transition_at.cmp(&b.last_transition_at))
        });
        candidates.into_iter().take(excess).map(|c| c.id).collect()
    }
}

/// Background thread running the periodic eviction pass.
///
/// Stops when dropped, or when the pass callback returns `false`
/// (the manager it serves is gone).
pub struct EvictorTimer {
    shutdown: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EvictorTimer {
    pub fn spawn<F>(interval: Duration, mut pass: F) -> Option<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let spawned = thread::Builder::new()
            .name("feedreel-evictor".into())
            .spawn(move || {
                trace!("Evictor timer started ({:?})", interval);
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if !pass() {
                                break;
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                trace!("Evictor timer stopped");
            });

        match spawned {
            Ok(handle) => {
                debug!("Periodic eviction every {:?}", interval);
                Some(Self {
                    shutdown: Some(shutdown_tx),
                    handle: Some(handle),
                })
            }
            Err(e) => {
                warn!("Failed to spawn evictor timer, periodic eviction disabled: {}", e);
                None
            }
        }
    }
}

impl Drop for EvictorTimer {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the select
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
