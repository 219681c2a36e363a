//! Simulated decode primitive.
//!
//! Stands in for a real media library in the `feedreel` binary and in tests:
//! configurable initialize latency, per-session memory cost and a failure
//! rule, plus counters that make leaks and double-disposals visible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::decode::{DecodeError, DecodeFactory, DecodeSession};

/// Which URLs fail to initialize
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailureRule {
    #[default]
    Never,
    Always,
    /// URLs containing any of these substrings fail
    Matching(Vec<String>),
}

impl FailureRule {
    fn fails(&self, url: &str) -> bool {
        match self {
            FailureRule::Never => false,
            FailureRule::Always => true,
            FailureRule::Matching(patterns) => patterns.iter().any(|p| url.contains(p.as_str())),
        }
    }
}

/// Session lifecycle counters shared by a factory and its sessions
#[derive(Debug, Default)]
pub struct SimCounters {
    pub created: AtomicUsize,
    pub initialized: AtomicUsize,
    pub disposed: AtomicUsize,
    /// Sessions switched to looping playback
    pub looping: AtomicUsize,
    /// Sessions dropped without `dispose()`
    pub leaked: AtomicUsize,
}

impl SimCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn looping(&self) -> usize {
        self.looping.load(Ordering::SeqCst)
    }

    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Created and not yet disposed
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.disposed())
    }
}

/// Factory producing `SimulatedSession`s
#[derive(Debug)]
pub struct SimulatedFactory {
    latency: Duration,
    bytes_per_session: usize,
    failures: FailureRule,
    counters: Arc<SimCounters>,
    created_urls: Mutex<Vec<String>>,
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new(Duration::ZERO, 8 * 1024 * 1024)
    }
}

impl SimulatedFactory {
    pub fn new(latency: Duration, bytes_per_session: usize) -> Self {
        Self {
            latency,
            bytes_per_session,
            failures: FailureRule::Never,
            counters: Arc::new(SimCounters::default()),
            created_urls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failures(mut self, failures: FailureRule) -> Self {
        self.failures = failures;
        self
    }

    pub fn counters(&self) -> Arc<SimCounters> {
        Arc::clone(&self.counters)
    }

    /// URLs in the order sessions were created
    pub fn created_urls(&self) -> Vec<String> {
        self.created_urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl DecodeFactory for SimulatedFactory {
    fn create(&self, url: &str) -> Result<Box<dyn DecodeSession>, DecodeError> {
        if url.is_empty() {
            return Err(DecodeError::Open {
                url: url.to_string(),
                reason: "empty url".into(),
            });
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.created_urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());

        Ok(Box::new(SimulatedSession {
            url: url.to_string(),
            latency: self.latency,
            fail: self.failures.fails(url),
            bytes: self.bytes_per_session,
            counters: Arc::clone(&self.counters),
            disposed: false,
            playing: false,
            looping: false,
        }))
    }
}

/// In-memory stand-in for a decoder session
#[derive(Debug)]
pub struct SimulatedSession {
    url: String,
    latency: Duration,
    fail: bool,
    bytes: usize,
    counters: Arc<SimCounters>,
    disposed: bool,
    playing: bool,
    looping: bool,
}

impl DecodeSession for SimulatedSession {
    fn initialize(&mut self) -> Result<(), DecodeError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.fail {
            return Err(DecodeError::Initialize(format!("simulated failure for {}", self.url)));
        }
        self.counters.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn set_looping(&mut self, looping: bool) {
        if looping && !self.looping {
            self.counters.looping.fetch_add(1, Ordering::SeqCst);
        }
        self.looping = looping;
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.playing {
            log::trace!("Disposing {} while playing", self.url);
            self.playing = false;
        }
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn estimated_bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        if !self.disposed {
            log::warn!("Simulated session for {} dropped without dispose", self.url);
            self.counters.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}
