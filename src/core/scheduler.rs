//! Preload scheduler - decides which feed positions should be in flight or resident.
//!
//! Planning is a pure function of (focus index, feed length, network class),
//! so it is cheap enough to run synchronously on every focus change.
//! The manager issues the actual fire-and-forget preloads from the plan.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Coarse network-cost class supplied by the connectivity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Wi-Fi / ethernet: generous prefetch
    #[default]
    Unmetered,
    /// Cellular: minimal prefetch
    Metered,
    /// No connectivity: no preloads at all
    Offline,
}

/// Prefetch window around the focus index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadPolicy {
    /// Items preloaded after the focus
    pub ahead: usize,
    /// Items preloaded before the focus
    pub behind: usize,
    /// Extra slack on both sides kept resident but not eagerly preloaded
    pub buffer: usize,
}

impl PreloadPolicy {
    pub const fn new(ahead: usize, behind: usize, buffer: usize) -> Self {
        Self { ahead, behind, buffer }
    }

    pub fn unmetered() -> Self {
        Self::new(5, 2, 2)
    }

    pub fn metered() -> Self {
        Self::new(2, 1, 1)
    }

    /// Upper bound on eagerly preloaded items
    pub fn eager_count(&self) -> usize {
        self.ahead + self.behind + 1
    }
}

/// Candidate priority. Derived `Ord` gives the issue order:
/// `Immediate < Next(1) < Next(2) < ... < Nearby(1) < Nearby(2) < ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// The focused item
    Immediate,
    /// n items after the focus
    Next(usize),
    /// n items before the focus
    Nearby(usize),
}

/// Ordered preload candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadPlan {
    /// Display indices in issue order
    pub candidates: Vec<(usize, Priority)>,
}

/// Network-class aware window planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadScheduler {
    unmetered: PreloadPolicy,
    metered: PreloadPolicy,
}

impl Default for PreloadScheduler {
    fn default() -> Self {
        Self::new(PreloadPolicy::unmetered(), PreloadPolicy::metered())
    }
}

impl PreloadScheduler {
    pub fn new(unmetered: PreloadPolicy, metered: PreloadPolicy) -> Self {
        Self { unmetered, metered }
    }

    /// Preload policy for a class. `None` when preloading is suppressed.
    pub fn policy(&self, class: NetworkClass) -> Option<PreloadPolicy> {
        match class {
            NetworkClass::Unmetered => Some(self.unmetered),
            NetworkClass::Metered => Some(self.metered),
            NetworkClass::Offline => None,
        }
    }

    /// Window kept resident for a class. Offline keeps the metered window so
    /// losing connectivity does not throw away what is already decoded.
    pub fn retain_policy(&self, class: NetworkClass) -> PreloadPolicy {
        self.policy(class).unwrap_or(self.metered)
    }

    /// Window that stays resident around `focus`. Resident records outside
    /// it are eviction candidates.
    pub fn retain_window(&self, focus: usize, len: usize, class: NetworkClass) -> RangeInclusive<usize> {
        if len == 0 {
            return 1..=0;
        }
        let focus = focus.min(len - 1);
        let p = self.retain_policy(class);
        let lo = focus.saturating_sub(p.behind + p.buffer);
        let hi = (focus + p.ahead + p.buffer).min(len - 1);
        lo..=hi
    }

    /// Compute the ordered candidate set for `focus` in a feed of `len` items.
    pub fn plan(&self, focus: usize, len: usize, class: NetworkClass) -> PreloadPlan {
        if len == 0 {
            return PreloadPlan::default();
        }
        let focus = focus.min(len - 1);

        let Some(policy) = self.policy(class) else {
            log::trace!("PreloadScheduler: offline, no candidates (focus={})", focus);
            return PreloadPlan::default();
        };

        let mut candidates = Vec::with_capacity(policy.eager_count());
        candidates.push((focus, Priority::Immediate));
        for n in 1..=policy.ahead {
            let idx = focus + n;
            if idx >= len {
                break;
            }
            candidates.push((idx, Priority::Next(n)));
        }
        for n in 1..=policy.behind {
            let Some(idx) = focus.checked_sub(n) else {
                break;
            };
            candidates.push((idx, Priority::Nearby(n)));
        }

        // Construction is already ordered; equal priorities fall back to
        // distance from focus.
        candidates.sort_by_key(|&(idx, prio)| (prio, idx.abs_diff(focus)));

        log::trace!(
            "PreloadScheduler: focus={} len={} class={:?} -> {:?}",
            focus,
            len,
            class,
            candidates
        );

        PreloadPlan { candidates }
    }
}
