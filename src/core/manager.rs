//! Lifecycle manager - the only mutation API of the feed.
//!
//! Owns the identifier -> `ItemRecord` map and the `OrderingIndex` behind one
//! mutex (single logical writer). Decode-session setup runs on the bounded
//! `Workers` pool; each job re-enters the lock to commit its result.
//! Disposal always happens synchronously under the lock, so no transition
//! for an item can race a half-finished release.
//!
//! No error ever leaves this API: decode failures become `Failed` /
//! `PermanentlyFailed` state, contract violations are debug assertions.

use std::collections::HashMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError};
use log::{debug, info, trace, warn};
use serde::Serialize;

use super::decode::{DecodeError, DecodeFactory, DecodeSession};
use super::events::{FeedEvent, FeedEvents};
use super::evictor::{EvictorTimer, MemoryEvictor, ReleaseCandidate, RemovalCandidate, ResidentUsage};
use super::item::{ItemId, ItemRecord, ItemSource, LifecycleState};
use super::memory::MemoryBudget;
use super::ordering::OrderingIndex;
use super::scheduler::{NetworkClass, PreloadScheduler};
use super::workers::Workers;
use crate::config::FeedSettings;

/// Running counters reported by `debug_snapshot`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    /// Preloads refused because the budget was still exhausted after eviction
    pub refused_preloads: u64,
    /// Sessions released by eviction passes (not explicit `release`)
    pub evictions: u64,
    /// Records destroyed because the feed outgrew `max_records`
    pub removals: u64,
    pub decode_failures: u64,
    pub decode_timeouts: u64,
    pub memory_pressure_events: u64,
}

/// Record count per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub not_requested: usize,
    pub requested: usize,
    pub ready: usize,
    pub failed: usize,
    pub permanently_failed: usize,
    pub released: usize,
}

impl StateCounts {
    fn add(&mut self, state: LifecycleState) {
        match state {
            LifecycleState::NotRequested => self.not_requested += 1,
            LifecycleState::Requested => self.requested += 1,
            LifecycleState::Ready => self.ready += 1,
            LifecycleState::Failed => self.failed += 1,
            LifecycleState::PermanentlyFailed => self.permanently_failed += 1,
            LifecycleState::Released => self.released += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.not_requested
            + self.requested
            + self.ready
            + self.failed
            + self.permanently_failed
            + self.released
    }
}

/// Read-only view of the manager for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub total_items: usize,
    pub focus_index: Option<usize>,
    pub network: NetworkClass,
    pub counts: StateCounts,
    /// Decode sessions currently allocated (Ready)
    pub resident: usize,
    pub max_resident: usize,
    /// Preloads queued or initializing
    pub in_flight: usize,
    pub queued_jobs: usize,
    pub estimated_bytes: usize,
    pub memory_limit_bytes: usize,
    pub peak_bytes: usize,
    /// A budget is exceeded right now
    pub over_budget: bool,
    /// Init threads still running after their deadline
    pub stalled_inits: u64,
    pub stats: FeedStats,
}

/// Why a preload was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Issued by the scheduler from a plan; the item may vanish in between
    Scheduled,
    /// Re-plan after a feed arrival. Never retries failed items, so the
    /// breaker only advances when the scheduler revisits an item.
    Arrival,
    /// Direct `preload()` call
    Explicit,
    /// User-triggered retry, resets the breaker
    ManualRetry,
}

#[derive(Default)]
struct FeedState {
    records: HashMap<ItemId, ItemRecord>,
    order: OrderingIndex,
    /// Focus is tracked by identity so prepended items don't shift it
    focus: Option<ItemId>,
    network: NetworkClass,
    stats: FeedStats,
}

impl FeedState {
    fn focus_index(&self) -> Option<usize> {
        self.focus.as_ref().and_then(|id| self.order.position(id))
    }

    fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in self.records.values() {
            counts.add(record.state());
        }
        counts
    }
}

thread_local! {
    /// Set while this thread runs a `with_decode_handle` closure
    static IN_RENDER_BORROW: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a render borrow until dropped
struct RenderBorrow;

impl RenderBorrow {
    fn enter() -> Self {
        IN_RENDER_BORROW.with(|flag| flag.set(true));
        RenderBorrow
    }
}

impl Drop for RenderBorrow {
    fn drop(&mut self) {
        IN_RENDER_BORROW.with(|flag| flag.set(false));
    }
}

/// State shared with worker jobs and the evictor timer
struct Shared {
    state: Mutex<FeedState>,
    events: FeedEvents,
    factory: Arc<dyn DecodeFactory>,
    scheduler: PreloadScheduler,
    evictor: MemoryEvictor,
    budget: MemoryBudget,
    failure_threshold: u32,
    init_timeout: Duration,
    max_records: usize,
    protect_focus_neighbor: bool,
    allow_manual_retry: bool,
    /// Init waits that hit the deadline
    timed_out_inits: AtomicU64,
    /// Timed-out init threads that have since finished
    late_inits: Arc<AtomicU64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        // The state lock is not reentrant: calling back from a render borrow
        // would deadlock
        debug_assert!(
            !IN_RENDER_BORROW.with(Cell::get),
            "LifecycleManager re-entered from a with_decode_handle closure"
        );
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn usage(&self, st: &FeedState) -> ResidentUsage {
        let count = st
            .records
            .values()
            .filter(|r| r.state() == LifecycleState::Ready)
            .count();
        ResidentUsage {
            count,
            bytes: self.budget.usage(),
            byte_limit: self.budget.limit(),
        }
    }

    fn publish_state(&self, id: &ItemId, state: LifecycleState) {
        self.events.publish(FeedEvent::StateChanged { id: id.clone(), state });
    }

    /// Release one record under the lock. Disposal completes before return.
    fn release_locked(&self, st: &mut FeedState, id: &ItemId) -> bool {
        let Some(record) = st.records.get_mut(id) else {
            return false;
        };
        match record.release() {
            Some(bytes) => {
                self.budget.free(bytes);
                self.publish_state(id, LifecycleState::Released);
                debug!("Released {} ({} bytes)", id, bytes);
                true
            }
            None => false,
        }
    }

    /// Eviction pass. `force` runs the full pass even when within budget
    /// (periodic trigger); otherwise it only runs when a budget is exceeded.
    /// Never touches the focused record or the retained window.
    fn evict_locked(&self, st: &mut FeedState, force: bool) -> usize {
        let usage = self.usage(st);
        if !force && !self.evictor.over_budget(usage) {
            return 0;
        }

        let len = st.order.len();
        let focus = st.focus_index();
        let retain = focus.map(|f| self.scheduler.retain_window(f, len, st.network));

        let candidates: Vec<ReleaseCandidate> = st
            .order
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != focus)
            .filter(|(idx, _)| retain.as_ref().is_none_or(|w| !w.contains(idx)))
            .filter_map(|(_, id)| {
                let record = st.records.get(id)?;
                (record.state() == LifecycleState::Ready).then(|| ReleaseCandidate {
                    id: id.clone(),
                    last_transition_at: record.last_transition_at(),
                    bytes: record.resident_bytes(),
                })
            })
            .collect();

        let selected = self.evictor.select_releases(candidates, usage);
        let mut released = 0;
        for id in &selected {
            if self.release_locked(st, id) {
                released += 1;
            }
        }
        st.stats.evictions += released as u64;

        if released > 0 {
            debug!(
                "Eviction pass: released {} ({} -> {} resident)",
                released,
                usage.count,
                usage.count - released
            );
        }
        if self.evictor.over_budget(self.usage(st)) {
            warn!(
                "Still over budget after eviction pass: {} resident / {} max, {} / {} bytes",
                usage.count - released,
                self.evictor.max_resident(),
                self.budget.usage(),
                self.budget.limit()
            );
        }
        released
    }

    /// Destroy the lowest-priority records once the feed outgrows `max_records`
    fn trim_records_locked(&self, st: &mut FeedState) {
        let len = st.order.len();
        if len <= self.max_records {
            return;
        }
        let excess = len - self.max_records;
        let focus = st.focus_index();
        let retain = focus.map(|f| self.scheduler.retain_window(f, len, st.network));
        let anchor = focus.unwrap_or(0);

        // In-flight records stay: removing them would let a re-add start a
        // second preload for the same id
        let candidates: Vec<RemovalCandidate> = st
            .order
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != focus)
            .filter(|(idx, _)| retain.as_ref().is_none_or(|w| !w.contains(idx)))
            .filter_map(|(idx, id)| {
                let record = st.records.get(id)?;
                (record.state() != LifecycleState::Requested).then(|| RemovalCandidate {
                    id: id.clone(),
                    distance: idx.abs_diff(anchor),
                    last_transition_at: record.last_transition_at(),
                })
            })
            .collect();

        for id in self.evictor.select_removals(candidates, excess) {
            st.order.remove(&id);
            if let Some(mut record) = st.records.remove(&id) {
                let bytes = record.dispose_for_removal();
                self.budget.free(bytes);
            }
            st.stats.removals += 1;
            self.events.publish(FeedEvent::ItemRemoved { id: id.clone() });
            debug!("Removed record {}", id);
        }
    }

    /// Ids the scheduler wants preloaded for the current focus
    fn plan_locked(&self, st: &FeedState) -> Vec<ItemId> {
        let Some(focus) = st.focus_index() else {
            return Vec::new();
        };
        self.scheduler
            .plan(focus, st.order.len(), st.network)
            .candidates
            .into_iter()
            .filter_map(|(idx, _)| st.order.get(idx).cloned())
            .collect()
    }

    /// Claim a record for preload under the lock. Returns the URL to decode
    /// if this call won the claim.
    fn claim(&self, id: &ItemId, origin: Origin) -> Option<String> {
        let mut guard = self.lock();
        let st = &mut *guard;

        if st.network == NetworkClass::Offline {
            trace!("Offline, preload of {} suppressed", id);
            return None;
        }

        let Some(record) = st.records.get(id) else {
            debug_assert!(
                matches!(origin, Origin::Scheduled | Origin::Arrival),
                "preload of unknown item {}",
                id
            );
            return None;
        };
        if !record.source().needs_decode() {
            return None;
        }
        let claimable = match origin {
            Origin::ManualRetry => {
                self.allow_manual_retry
                    && matches!(
                        record.state(),
                        LifecycleState::Failed | LifecycleState::PermanentlyFailed
                    )
            }
            Origin::Arrival => matches!(
                record.state(),
                LifecycleState::NotRequested | LifecycleState::Released
            ),
            Origin::Scheduled | Origin::Explicit => record.state().is_preloadable(),
        };
        if !claimable {
            return None;
        }

        // Capacity counts in-flight sessions too: they become resident soon
        let in_flight = st
            .records
            .values()
            .filter(|r| r.state() == LifecycleState::Requested)
            .count();
        let at_capacity = |this: &Self, st: &FeedState| {
            this.usage(st).count + in_flight >= this.evictor.max_resident() || this.budget.over_limit()
        };
        if at_capacity(self, st) {
            self.evict_locked(st, true);
            if at_capacity(self, st) {
                st.stats.refused_preloads += 1;
                warn!("Decode budget exhausted, preload of {} refused", id);
                return None;
            }
        }

        let record = st.records.get_mut(id)?;
        let claimed = match origin {
            Origin::ManualRetry => record.claim_for_manual_retry(),
            Origin::Scheduled | Origin::Arrival | Origin::Explicit => record.try_claim_for_preload(),
        };
        if !claimed {
            return None;
        }
        let url = record.source().url.clone();
        self.publish_state(id, LifecycleState::Requested);
        trace!("Preload claimed: {} ({:?})", id, origin);
        Some(url)
    }

    /// Worker-side: create + initialize (bounded by the timeout), then commit
    fn run_preload(&self, id: ItemId, url: String) {
        let started = Instant::now();
        let result = self.create_and_initialize(&url);
        trace!("Decode setup for {} took {:?}", id, started.elapsed());
        self.commit(&id, result);
    }

    fn create_and_initialize(&self, url: &str) -> Result<Box<dyn DecodeSession>, DecodeError> {
        let factory = Arc::clone(&self.factory);
        let url = url.to_string();
        let late_inits = Arc::clone(&self.late_inits);

        // Rendezvous channel: a send only succeeds while we are still waiting,
        // so a session finishing after the deadline comes back to its thread
        // and gets disposed there. The session is created on that thread too,
        // so nothing is left undisposed if the thread cannot be spawned.
        let (tx, rx) = crossbeam_channel::bounded::<Result<Box<dyn DecodeSession>, DecodeError>>(0);
        let spawned = thread::Builder::new()
            .name("feedreel-init".into())
            .spawn(move || {
                let outcome = factory.create(&url).and_then(|mut session| match session.initialize() {
                    Ok(()) => {
                        // Feed videos loop
                        session.set_looping(true);
                        Ok(session)
                    }
                    Err(e) => {
                        session.dispose();
                        Err(e)
                    }
                });
                if let Err(SendError(outcome)) = tx.send(outcome) {
                    late_inits.fetch_add(1, Ordering::SeqCst);
                    if let Ok(mut late) = outcome {
                        late.dispose();
                        debug!("Late decode session for {} disposed after timeout", url);
                    }
                }
            });
        if let Err(e) = spawned {
            return Err(DecodeError::Initialize(format!("failed to spawn init thread: {}", e)));
        }

        match rx.recv_timeout(self.init_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.timed_out_inits.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "{} decode init thread(s) still running past the deadline",
                    self.stalled_inits()
                );
                Err(DecodeError::Timeout(self.init_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DecodeError::Disconnected),
        }
    }

    /// Init threads that timed out and have not finished yet
    fn stalled_inits(&self) -> u64 {
        let timed_out = self.timed_out_inits.load(Ordering::SeqCst);
        timed_out.saturating_sub(self.late_inits.load(Ordering::SeqCst))
    }

    /// Commit a preload result under the lock
    fn commit(&self, id: &ItemId, result: Result<Box<dyn DecodeSession>, DecodeError>) {
        let mut guard = self.lock();
        let st = &mut *guard;

        let Some(record) = st.records.get_mut(id) else {
            // Destroyed while in flight
            if let Ok(mut session) = result {
                session.dispose();
            }
            return;
        };

        match result {
            Ok(session) => {
                let bytes = session.estimated_bytes();
                match record.commit_ready(session) {
                    Ok(()) => {
                        self.budget.add(bytes);
                        self.publish_state(id, LifecycleState::Ready);
                        debug!("Ready: {} ({} bytes)", id, bytes);
                    }
                    Err(mut stale) => {
                        stale.dispose();
                        debug!("Discarded stale session for {} ({})", id, record.state());
                    }
                }
            }
            Err(e) => {
                if record.state() != LifecycleState::Requested {
                    return;
                }
                let state = record.commit_failure(self.failure_threshold);
                let failures = record.failure_count();
                st.stats.decode_failures += 1;
                if matches!(e, DecodeError::Timeout(_)) {
                    st.stats.decode_timeouts += 1;
                    warn!("Decode init for {} timed out after {:?}", id, self.init_timeout);
                }
                self.publish_state(id, state);
                debug!(
                    "{}: {} ({}/{} failures): {}",
                    id, state, failures, self.failure_threshold, e
                );
            }
        }

        // An out-of-window completion may push us over budget
        self.evict_locked(st, false);
    }

    fn periodic_pass(&self) {
        let mut guard = self.lock();
        let released = self.evict_locked(&mut guard, true);
        if released > 0 {
            debug!("Periodic eviction released {}", released);
        }
    }
}

/// Orchestrates preload, residency and release of decode sessions for a feed.
pub struct LifecycleManager {
    _evictor_timer: Option<EvictorTimer>,
    workers: Workers,
    shared: Arc<Shared>,
}

impl LifecycleManager {
    pub fn new(settings: &FeedSettings, factory: Arc<dyn DecodeFactory>) -> Self {
        let mut settings = settings.clone();
        settings.validate();

        let shared = Arc::new(Shared {
            state: Mutex::new(FeedState::default()),
            events: FeedEvents::new(),
            factory,
            scheduler: settings.scheduler(),
            evictor: settings.evictor(),
            budget: settings.memory_budget(),
            failure_threshold: settings.failure_threshold,
            init_timeout: settings.init_timeout(),
            max_records: settings.max_records,
            protect_focus_neighbor: settings.protect_focus_neighbor,
            allow_manual_retry: settings.allow_manual_retry,
            timed_out_inits: AtomicU64::new(0),
            late_inits: Arc::new(AtomicU64::new(0)),
        });

        let workers = Workers::new(settings.worker_threads());

        let evictor_timer = settings.evict_interval().and_then(|interval| {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            EvictorTimer::spawn(interval, move || match weak.upgrade() {
                Some(shared) => {
                    shared.periodic_pass();
                    true
                }
                None => false,
            })
        });

        info!(
            "LifecycleManager: max_resident={}, max_records={}, workers={}, breaker={} failures, init timeout {:?}",
            settings.max_resident,
            settings.max_records,
            workers.num_threads(),
            settings.failure_threshold,
            settings.init_timeout()
        );

        Self {
            _evictor_timer: evictor_timer,
            workers,
            shared,
        }
    }

    // ========== Mutation API ==========

    /// Insert a new item at the front of the feed. No-op for a known id.
    ///
    /// Never blocks on decode work: at most it queues preloads for the
    /// current focus window.
    pub fn add_item(&self, source: ItemSource) -> ItemId {
        let id = source.id();
        let to_preload = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;

            if st.records.contains_key(&id) {
                trace!("add_item: {} already known", id);
                return id;
            }
            st.order.push_front(id.clone());
            st.records.insert(id.clone(), ItemRecord::new(source));
            self.shared.events.publish(FeedEvent::ItemAdded { id: id.clone() });
            debug!("Added {} ({} items)", id, st.order.len());

            self.shared.trim_records_locked(st);
            self.shared.evict_locked(st, false);
            self.shared.plan_locked(st)
        };

        self.issue(to_preload, Origin::Arrival);
        id
    }

    /// Record the scroll position and preload around it.
    pub fn set_focus(&self, index: usize) {
        let to_preload = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;

            let len = st.order.len();
            if len == 0 {
                st.focus = None;
                return;
            }
            let index = index.min(len - 1);
            st.focus = st.order.get(index).cloned();
            self.shared.events.publish(FeedEvent::FocusChanged { index });

            self.shared.evict_locked(st, false);
            self.shared.plan_locked(st)
        };

        self.issue(to_preload, Origin::Scheduled);
    }

    /// Start a preload for `id` unless one is in flight, it is resident,
    /// or its breaker tripped.
    pub fn preload(&self, id: &ItemId) {
        self.start(id, Origin::Explicit);
    }

    /// User-triggered retry of a failed item: resets `failure_count` and preloads.
    /// No-op unless manual retry is enabled and the item is Failed/PermanentlyFailed.
    pub fn retry(&self, id: &ItemId) {
        self.start(id, Origin::ManualRetry);
    }

    /// Dispose the session of a Ready item and mark it Released.
    pub fn release(&self, id: &ItemId) {
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        debug_assert!(st.records.contains_key(id), "release of unknown item {}", id);
        self.shared.release_locked(st, id);
    }

    /// Release every resident session except the focused one (and its
    /// next neighbor when configured).
    pub fn handle_memory_pressure(&self) {
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        st.stats.memory_pressure_events += 1;

        let focus = st.focus_index();
        let keep = |idx: usize| match focus {
            Some(f) => idx == f || (self.shared.protect_focus_neighbor && idx == f + 1),
            None => false,
        };
        let victims: Vec<ItemId> = st
            .order
            .iter()
            .enumerate()
            .filter(|&(idx, _)| !keep(idx))
            .map(|(_, id)| id.clone())
            .collect();

        let mut released = 0;
        for id in &victims {
            if self.shared.release_locked(st, id) {
                released += 1;
            }
        }
        st.stats.evictions += released as u64;
        info!(
            "Memory pressure: released {} sessions, {} bytes still resident",
            released,
            self.shared.budget.usage()
        );
    }

    /// Run an eviction pass now (what the periodic timer does).
    /// Returns how many sessions were released.
    pub fn run_eviction_pass(&self) -> usize {
        let mut guard = self.shared.lock();
        self.shared.evict_locked(&mut guard, true)
    }

    /// Network class from the connectivity collaborator. Going back online
    /// re-plans around the current focus.
    pub fn set_network_class(&self, class: NetworkClass) {
        let to_preload = {
            let mut guard = self.shared.lock();
            if guard.network == class {
                return;
            }
            info!("Network class {:?} -> {:?}", guard.network, class);
            guard.network = class;
            self.shared.plan_locked(&guard)
        };
        self.issue(to_preload, Origin::Scheduled);
    }

    fn issue(&self, ids: Vec<ItemId>, origin: Origin) {
        for id in &ids {
            self.start(id, origin);
        }
    }

    fn start(&self, id: &ItemId, origin: Origin) {
        let Some(url) = self.shared.claim(id, origin) else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let id = id.clone();
        self.workers.execute(move || shared.run_preload(id, url));
    }

    // ========== Queries ==========

    /// Newest-first item list (the only sequence exposed to the UI)
    pub fn items(&self) -> Vec<ItemId> {
        self.shared.lock().order.to_vec()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_at(&self, index: usize) -> Option<ItemId> {
        self.shared.lock().order.get(index).cloned()
    }

    pub fn item_state(&self, id: &ItemId) -> Option<LifecycleState> {
        self.shared.lock().records.get(id).map(ItemRecord::state)
    }

    pub fn failure_count(&self, id: &ItemId) -> Option<u32> {
        self.shared.lock().records.get(id).map(ItemRecord::failure_count)
    }

    pub fn source(&self, id: &ItemId) -> Option<Arc<ItemSource>> {
        self.shared
            .lock()
            .records
            .get(id)
            .map(|r| Arc::clone(r.source()))
    }

    pub fn focus_index(&self) -> Option<usize> {
        self.shared.lock().focus_index()
    }

    pub fn network_class(&self) -> NetworkClass {
        self.shared.lock().network
    }

    pub fn has_decode_handle(&self, id: &ItemId) -> bool {
        self.shared
            .lock()
            .records
            .get(id)
            .is_some_and(ItemRecord::has_handle)
    }

    /// Borrow the decode handle for one render pass.
    ///
    /// Returns `None` when the item is not resident. The borrow holds the
    /// state lock, so a concurrent `release` waits for the pass to finish;
    /// callers must not keep anything derived from the handle afterwards.
    ///
    /// The closure must not call back into the manager: read whatever state
    /// the render needs before borrowing. Re-entry panics in debug builds and
    /// deadlocks in release builds.
    pub fn with_decode_handle<R>(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut dyn DecodeSession) -> R,
    ) -> Option<R> {
        let mut guard = self.shared.lock();
        let handle = guard.records.get_mut(id)?.handle_mut()?;
        let _borrow = RenderBorrow::enter();
        Some(f(handle))
    }

    /// Observe state changes (level-triggered)
    pub fn subscribe(&self) -> Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    /// Counts per state, residency and memory. No side effects.
    pub fn debug_snapshot(&self) -> FeedSnapshot {
        let st = self.shared.lock();
        let counts = st.counts();
        let usage = self.shared.usage(&st);
        FeedSnapshot {
            total_items: st.order.len(),
            focus_index: st.focus_index(),
            network: st.network,
            counts,
            resident: counts.ready,
            max_resident: self.shared.evictor.max_resident(),
            in_flight: counts.requested,
            queued_jobs: self.workers.pending(),
            estimated_bytes: self.shared.budget.usage(),
            memory_limit_bytes: self.shared.budget.limit(),
            peak_bytes: self.shared.budget.peak(),
            over_budget: self.shared.evictor.over_budget(usage),
            stalled_inits: self.shared.stalled_inits(),
            stats: st.stats,
        }
    }

    /// Block until no preload is queued or in flight, or `timeout` passes.
    /// Returns true if idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self
                .shared
                .lock()
                .records
                .values()
                .any(|r| r.state() == LifecycleState::Requested);
            if !in_flight && self.workers.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FailureRule, SimulatedFactory};

    const IDLE: Duration = Duration::from_secs(5);

    fn settings() -> FeedSettings {
        FeedSettings {
            max_resident: 100,
            max_records: 1000,
            workers: 4,
            evict_interval_ms: 0,
            memory_limit_mb: Some(1 << 20),
            ..Default::default()
        }
    }

    fn manager_with(settings: &FeedSettings, factory: SimulatedFactory) -> (LifecycleManager, Arc<SimulatedFactory>) {
        let factory = Arc::new(factory);
        let dyn_factory: Arc<dyn DecodeFactory> = factory.clone();
        (LifecycleManager::new(settings, dyn_factory), factory)
    }

    fn fast_factory() -> SimulatedFactory {
        SimulatedFactory::new(Duration::ZERO, 1024)
    }

    /// Adds `n` items with urls u0..u{n-1}; display index k holds u{n-1-k}
    fn add_items(manager: &LifecycleManager, n: usize) -> Vec<ItemId> {
        (0..n)
            .map(|i| manager.add_item(ItemSource::video(format!("u{}", i))))
            .collect()
    }

    /// Asserts handle <=> Ready for every record
    fn assert_consistent(manager: &LifecycleManager) {
        for id in manager.items() {
            let ready = manager.item_state(&id) == Some(LifecycleState::Ready);
            assert_eq!(manager.has_decode_handle(&id), ready, "{}", id);
        }
    }

    fn states_for(rx: &Receiver<FeedEvent>, id: &ItemId) -> Vec<LifecycleState> {
        rx.try_iter()
            .filter_map(|e| match e {
                FeedEvent::StateChanged { id: ref eid, state } if eid == id => Some(state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_ordering_newest_first() {
        let (manager, _) = manager_with(&settings(), fast_factory());
        let ids = add_items(&manager, 20);

        let items = manager.items();
        assert_eq!(items.len(), 20);
        let expected: Vec<_> = ids.iter().rev().cloned().collect();
        assert_eq!(items, expected);
        assert_eq!(manager.item_at(0), Some(ids[19].clone()));
    }

    #[test]
    fn test_idempotent_insertion() {
        let (manager, _) = manager_with(&settings(), fast_factory());
        let rx = manager.subscribe();
        let a = manager.add_item(ItemSource::video("a"));
        manager.add_item(ItemSource::video("b"));
        let again = manager.add_item(ItemSource::video("a").with_title("dup"));

        assert_eq!(a, again);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.debug_snapshot().counts.total(), 2);
        let added = rx
            .try_iter()
            .filter(|e| matches!(e, FeedEvent::ItemAdded { .. }))
            .count();
        assert_eq!(added, 2);
        // Duplicate did not replace the source
        assert_eq!(manager.source(&a).map(|s| s.title.clone()), Some(String::new()));
    }

    #[test]
    fn test_at_most_one_in_flight() {
        let factory = SimulatedFactory::new(Duration::from_millis(20), 1024);
        let (manager, factory) = manager_with(&settings(), factory);
        let manager = Arc::new(manager);
        let id = manager.add_item(ItemSource::video("x"));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        manager.preload(&id);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(factory.counters().created(), 1);
        assert_eq!(manager.item_state(&id), Some(LifecycleState::Ready));
        assert_consistent(&manager);
    }

    #[test]
    fn test_breaker_sequence() {
        let factory = fast_factory().with_failures(FailureRule::Always);
        let (manager, factory) = manager_with(&settings(), factory);
        let rx = manager.subscribe();
        let x = manager.add_item(ItemSource::video("x"));
        assert_eq!(manager.item_state(&x), Some(LifecycleState::NotRequested));

        for _ in 0..3 {
            manager.preload(&x);
            assert!(manager.wait_for_idle(IDLE));
        }
        assert_eq!(
            states_for(&rx, &x),
            [
                LifecycleState::Requested,
                LifecycleState::Failed,
                LifecycleState::Requested,
                LifecycleState::Failed,
                LifecycleState::Requested,
                LifecycleState::PermanentlyFailed,
            ]
        );
        assert_eq!(manager.failure_count(&x), Some(3));

        // No fourth attempt, neither explicit nor scheduled
        manager.preload(&x);
        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(factory.counters().created(), 3);
        assert_eq!(manager.item_state(&x), Some(LifecycleState::PermanentlyFailed));
        assert_eq!(factory.counters().leaked(), 0);
    }

    #[test]
    fn test_manual_retry_resets_breaker() {
        let mut s = settings();
        s.failure_threshold = 1;
        let factory = fast_factory().with_failures(FailureRule::Always);
        let (manager, factory) = manager_with(&s, factory);
        let x = manager.add_item(ItemSource::video("x"));

        manager.preload(&x);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&x), Some(LifecycleState::PermanentlyFailed));

        manager.retry(&x);
        assert!(manager.wait_for_idle(IDLE));
        // Reset to 0, then failed once more
        assert_eq!(manager.failure_count(&x), Some(1));
        assert_eq!(factory.counters().created(), 2);

        // Disabled retry does nothing
        s.allow_manual_retry = false;
        let (manager, factory) = manager_with(&s, fast_factory().with_failures(FailureRule::Always));
        let y = manager.add_item(ItemSource::video("y"));
        manager.preload(&y);
        assert!(manager.wait_for_idle(IDLE));
        manager.retry(&y);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(factory.counters().created(), 1);
    }

    #[test]
    fn test_focus_ten_preloads_window_in_order() {
        let mut s = settings();
        s.workers = 1; // FIFO: creation order == issue order
        s.unmetered = crate::core::scheduler::PreloadPolicy::new(3, 1, 1);
        let (manager, factory) = manager_with(&s, fast_factory());
        let ids = add_items(&manager, 30);

        manager.set_focus(10);
        assert!(manager.wait_for_idle(IDLE));

        // display index k -> u{29-k}
        assert_eq!(factory.created_urls(), ["u19", "u18", "u17", "u16", "u20"]);
        for (i, id) in ids.iter().enumerate() {
            let display = 29 - i;
            let expected = if (9..=13).contains(&display) {
                LifecycleState::Ready
            } else {
                LifecycleState::NotRequested
            };
            assert_eq!(manager.item_state(id), Some(expected), "display index {}", display);
        }
        assert_eq!(manager.focus_index(), Some(10));
        assert_consistent(&manager);
    }

    #[test]
    fn test_focus_follows_item_when_new_items_arrive() {
        let (manager, _) = manager_with(&settings(), fast_factory());
        let ids = add_items(&manager, 5);
        manager.set_focus(2);
        let watched = ids[2].clone();
        assert_eq!(manager.item_at(2), Some(watched.clone()));

        manager.add_item(ItemSource::video("newer"));
        assert_eq!(manager.focus_index(), Some(3));
        assert_eq!(manager.item_at(3), Some(watched));
        assert!(manager.wait_for_idle(IDLE));
    }

    #[test]
    fn test_release_during_render_borrow() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        let y = manager.add_item(ItemSource::video("y"));
        manager.preload(&y);
        assert!(manager.wait_for_idle(IDLE));

        // A render pass borrows the handle transiently
        let bytes = manager.with_decode_handle(&y, |h| {
            h.play();
            h.estimated_bytes()
        });
        assert_eq!(bytes, Some(1024));

        manager.release(&y);
        assert_eq!(manager.item_state(&y), Some(LifecycleState::Released));
        assert!(!manager.has_decode_handle(&y));
        // Next paint re-checks and finds nothing
        assert_eq!(manager.with_decode_handle(&y, |h| h.estimated_bytes()), None);
        assert_eq!(factory.counters().disposed(), 1);
        assert_eq!(manager.debug_snapshot().estimated_bytes, 0);

        // Released -> Requested when scrolled back
        manager.preload(&y);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&y), Some(LifecycleState::Ready));
    }

    #[test]
    fn test_release_of_non_ready_is_noop() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        let y = manager.add_item(ItemSource::video("y"));
        manager.release(&y);
        assert_eq!(manager.item_state(&y), Some(LifecycleState::NotRequested));
        assert_eq!(factory.counters().disposed(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "release of unknown item")]
    fn test_release_of_unknown_asserts_in_debug() {
        let (manager, _) = manager_with(&settings(), fast_factory());
        manager.release(&ItemId::new("ghost"));
    }

    #[test]
    fn test_memory_bound_150_items() {
        let mut s = settings();
        s.max_resident = 100;
        let (manager, factory) = manager_with(&s, fast_factory());

        manager.add_item(ItemSource::video("seed"));
        manager.set_focus(0);
        let ids = add_items(&manager, 150);
        // Push residency as hard as possible
        for id in &ids {
            manager.preload(id);
            assert!(manager.debug_snapshot().resident <= 100);
        }
        assert!(manager.wait_for_idle(IDLE));

        let snap = manager.debug_snapshot();
        assert!(snap.resident <= 100, "resident {}", snap.resident);
        assert_eq!(snap.total_items, 151);
        assert_eq!(manager.items().len(), 151);
        assert_eq!(factory.counters().live(), snap.resident);
        assert_consistent(&manager);
    }

    #[test]
    fn test_eviction_pass_respects_window_and_hysteresis() {
        let mut s = settings();
        s.max_resident = 10;
        s.unmetered = crate::core::scheduler::PreloadPolicy::new(1, 0, 0);
        let (manager, _) = manager_with(&s, fast_factory());
        let ids = add_items(&manager, 30);

        // Fill to the budget far away from the focus
        for id in ids.iter().take(10) {
            manager.preload(id);
        }
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.debug_snapshot().resident, 10);

        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));
        let focus = manager.item_at(0).unwrap();
        assert_eq!(manager.item_state(&focus), Some(LifecycleState::Ready));

        manager.run_eviction_pass();
        let snap = manager.debug_snapshot();
        // Window (focus + 1 ahead) is kept, the rest shrinks to 0.7 x 10
        assert!(snap.resident <= 7, "resident {}", snap.resident);
        assert_eq!(manager.item_state(&focus), Some(LifecycleState::Ready));
        assert!(snap.stats.evictions > 0);
        assert_consistent(&manager);
    }

    #[test]
    fn test_memory_pressure_protects_focus() {
        for protect_neighbor in [true, false] {
            let mut s = settings();
            s.protect_focus_neighbor = protect_neighbor;
            let (manager, factory) = manager_with(&s, fast_factory());
            add_items(&manager, 20);
            manager.set_focus(5);
            assert!(manager.wait_for_idle(IDLE));
            assert!(manager.debug_snapshot().resident > 2);

            manager.handle_memory_pressure();

            let focus = manager.item_at(5).unwrap();
            let neighbor = manager.item_at(6).unwrap();
            assert_eq!(manager.item_state(&focus), Some(LifecycleState::Ready));
            let expected_resident = if protect_neighbor { 2 } else { 1 };
            assert_eq!(manager.debug_snapshot().resident, expected_resident);
            assert_eq!(manager.has_decode_handle(&neighbor), protect_neighbor);
            assert_eq!(factory.counters().live(), expected_resident);
            assert_consistent(&manager);
        }
    }

    #[test]
    fn test_init_timeout_counts_as_failure() {
        let mut s = settings();
        s.init_timeout_ms = 10;
        let factory = SimulatedFactory::new(Duration::from_millis(500), 1024);
        let (manager, factory) = manager_with(&s, factory);
        let x = manager.add_item(ItemSource::video("x"));

        manager.preload(&x);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&x), Some(LifecycleState::Failed));
        assert_eq!(manager.failure_count(&x), Some(1));
        let snap = manager.debug_snapshot();
        assert_eq!(snap.stats.decode_timeouts, 1);
        // Its init thread is still sleeping
        assert_eq!(snap.stalled_inits, 1);

        // The late session is disposed by its init thread
        let counters = factory.counters();
        let deadline = Instant::now() + IDLE;
        while counters.disposed() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counters.disposed(), 1);
        assert_eq!(counters.leaked(), 0);
        assert_eq!(manager.debug_snapshot().stalled_inits, 0);
    }

    #[test]
    fn test_open_failure_is_a_failed_attempt() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        // SimulatedFactory refuses empty URLs at create time
        let x = manager.add_item(ItemSource::video(""));

        manager.preload(&x);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&x), Some(LifecycleState::Failed));
        assert_eq!(manager.failure_count(&x), Some(1));
        assert_eq!(factory.counters().created(), 0);
        assert_eq!(factory.counters().leaked(), 0);
    }

    #[test]
    fn test_offline_suppresses_then_resumes() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        add_items(&manager, 10);
        manager.set_network_class(NetworkClass::Offline);
        manager.set_focus(3);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(factory.counters().created(), 0);
        assert_eq!(manager.debug_snapshot().counts.not_requested, 10);

        manager.set_network_class(NetworkClass::Metered);
        assert!(manager.wait_for_idle(IDLE));
        // Metered default window: focus + 2 ahead + 1 behind
        assert_eq!(factory.counters().created(), 4);
    }

    #[test]
    fn test_looping_images_need_no_session() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        let img = manager.add_item(ItemSource::looping_image("gif"));
        manager.preload(&img);
        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&img), Some(LifecycleState::NotRequested));
        assert_eq!(factory.counters().created(), 0);
    }

    #[test]
    fn test_records_trimmed_beyond_max_records() {
        let mut s = settings();
        s.max_resident = 5;
        s.max_records = 10;
        let (manager, _) = manager_with(&s, fast_factory());
        let rx = manager.subscribe();
        let ids = add_items(&manager, 15);

        assert_eq!(manager.len(), 10);
        // Oldest (farthest from the front) went first
        for id in &ids[..5] {
            assert_eq!(manager.item_state(id), None);
        }
        for id in &ids[5..] {
            assert!(manager.item_state(id).is_some());
        }
        let removed = rx
            .try_iter()
            .filter(|e| matches!(e, FeedEvent::ItemRemoved { .. }))
            .count();
        assert_eq!(removed, 5);
        assert_eq!(manager.debug_snapshot().stats.removals, 5);
    }

    #[test]
    fn test_snapshot_counts() {
        let factory = fast_factory().with_failures(FailureRule::Matching(vec!["bad".into()]));
        let (manager, _) = manager_with(&settings(), factory);
        let good = manager.add_item(ItemSource::video("good"));
        let bad = manager.add_item(ItemSource::video("bad"));
        manager.add_item(ItemSource::video("idle"));
        manager.preload(&good);
        manager.preload(&bad);
        assert!(manager.wait_for_idle(IDLE));

        let snap = manager.debug_snapshot();
        assert_eq!(snap.total_items, 3);
        assert_eq!(snap.counts.ready, 1);
        assert_eq!(snap.counts.failed, 1);
        assert_eq!(snap.counts.not_requested, 1);
        assert_eq!(snap.resident, 1);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.estimated_bytes, 1024);
        assert_eq!(snap.stats.decode_failures, 1);
        assert!(!snap.over_budget);
        // Snapshot is side-effect free
        assert_eq!(manager.debug_snapshot(), snap);
    }

    #[test]
    fn test_arrivals_do_not_retry_failed_focus() {
        let factory = fast_factory().with_failures(FailureRule::Matching(vec!["u-x".into()]));
        let (manager, factory) = manager_with(&settings(), factory);
        let x = manager.add_item(ItemSource::video("u-x"));
        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.item_state(&x), Some(LifecycleState::Failed));
        assert_eq!(manager.failure_count(&x), Some(1));

        // New items keep arriving while the user stays put
        for url in ["a", "b"] {
            manager.add_item(ItemSource::video(url));
            assert!(manager.wait_for_idle(IDLE));
        }
        assert_eq!(manager.item_state(&x), Some(LifecycleState::Failed));
        assert_eq!(manager.failure_count(&x), Some(1));
        // Arrivals inside the window are still preloaded
        let newest = manager.item_at(0).unwrap();
        assert_eq!(manager.item_state(&newest), Some(LifecycleState::Ready));

        // Scrolling back onto the item is a revisit and retries it
        manager.set_focus(manager.focus_index().unwrap());
        assert!(manager.wait_for_idle(IDLE));
        assert_eq!(manager.failure_count(&x), Some(2));
        let attempts = factory.created_urls().iter().filter(|u| *u == "u-x").count();
        assert_eq!(attempts, 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_reentrant_render_borrow_is_caught() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let (manager, _) = manager_with(&settings(), fast_factory());
        let y = manager.add_item(ItemSource::video("y"));
        manager.preload(&y);
        assert!(manager.wait_for_idle(IDLE));

        // Calling back into the manager from the render closure
        let result = catch_unwind(AssertUnwindSafe(|| {
            manager.with_decode_handle(&y, |_h| manager.item_state(&y))
        }));
        assert!(result.is_err());

        // The borrow flag is cleared and the lock is still usable
        assert_eq!(manager.item_state(&y), Some(LifecycleState::Ready));
        assert_eq!(manager.with_decode_handle(&y, |h| h.estimated_bytes()), Some(1024));
    }

    #[test]
    fn test_periodic_eviction_runs_without_explicit_pass() {
        let mut s = settings();
        s.max_resident = 10;
        s.evict_interval_ms = 20;
        let (manager, factory) = manager_with(&s, fast_factory());
        let ids = add_items(&manager, 30);
        for id in ids.iter().take(10) {
            manager.preload(id);
        }
        assert!(manager.wait_for_idle(IDLE));

        let deadline = Instant::now() + IDLE;
        while manager.debug_snapshot().resident > 7 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let snap = manager.debug_snapshot();
        assert!(snap.resident <= 7, "resident {}", snap.resident);
        assert!(snap.stats.evictions >= 3);
        assert_eq!(factory.counters().live(), snap.resident);
        assert_consistent(&manager);
    }

    #[test]
    fn test_byte_ceiling_triggers_eviction() {
        let mut s = settings();
        s.memory_limit_mb = Some(10);
        let factory = SimulatedFactory::new(Duration::ZERO, 4 * 1024 * 1024);
        let (manager, factory) = manager_with(&s, factory);
        let ids = add_items(&manager, 6);

        for id in &ids {
            manager.preload(id);
            assert!(manager.wait_for_idle(IDLE));
            let snap = manager.debug_snapshot();
            assert!(
                snap.estimated_bytes <= snap.memory_limit_bytes,
                "{} bytes over a {} byte ceiling",
                snap.estimated_bytes,
                snap.memory_limit_bytes
            );
        }

        let snap = manager.debug_snapshot();
        // Well under the count budget, so bytes alone drove the releases
        assert!(snap.resident < snap.max_resident);
        assert!(snap.stats.evictions > 0);
        assert!(snap.peak_bytes > snap.memory_limit_bytes);
        assert!(!snap.over_budget);
        assert_eq!(factory.counters().live(), snap.resident);
        assert_consistent(&manager);
    }

    #[test]
    fn test_ready_sessions_loop() {
        let factory = fast_factory().with_failures(FailureRule::Matching(vec!["u1".into()]));
        let (manager, factory) = manager_with(&settings(), factory);
        add_items(&manager, 3);
        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));

        let snap = manager.debug_snapshot();
        assert_eq!(snap.resident, 2);
        assert_eq!(snap.counts.failed, 1);
        // Only initialized sessions are switched to looping
        assert_eq!(factory.counters().looping(), 2);
    }

    #[test]
    fn test_drop_disposes_resident_sessions() {
        let (manager, factory) = manager_with(&settings(), fast_factory());
        add_items(&manager, 6);
        manager.set_focus(0);
        assert!(manager.wait_for_idle(IDLE));
        let counters = factory.counters();
        assert!(counters.live() > 0);

        drop(manager);
        assert_eq!(counters.live(), 0);
        assert_eq!(counters.leaked(), 0);
    }
}
