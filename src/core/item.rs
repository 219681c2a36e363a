//! Item record - per-video state holder with its lifecycle state machine.
//!
//! One `ItemRecord` exists per `ItemId`. Records are mutated only by the
//! `LifecycleManager`, always under its state lock.
//!
//! Lifecycle:
//! ```text
//! NotRequested -> Requested -> Ready -> Released -> Requested ...
//!                     |  ^
//!                     v  |
//!                    Failed (failure_count < threshold)
//!                     |
//!                     v
//!              PermanentlyFailed (terminal, except manual retry)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decode::DecodeSession;

/// Opaque, content-derived item identifier. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Arc<str>);

impl ItemId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// What kind of media an item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// True video: needs a decode session to play
    #[default]
    Video,
    /// Animated image that loops on its own, rendered without a decode session
    LoopingImage,
}

/// Immutable descriptive payload of a feed item (as delivered by the event source)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemSource {
    /// Upstream event id, if the source protocol provides one
    pub event_id: Option<String>,
    /// Remote playable-media URL
    pub url: String,
    pub title: String,
    pub author: String,
    pub thumbnail_url: Option<String>,
    pub kind: MediaKind,
}

impl ItemSource {
    /// Video item with just a URL (metadata empty)
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Looping-image item with just a URL
    pub fn looping_image(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::LoopingImage,
            ..Default::default()
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Content-derived identifier.
    ///
    /// Upstream event id when present, otherwise a UUIDv5 of the media URL,
    /// so the same content always maps to the same identifier.
    pub fn id(&self) -> ItemId {
        match self.event_id.as_deref() {
            Some(event_id) if !event_id.is_empty() => ItemId::new(event_id),
            _ => ItemId::from(Uuid::new_v5(&Uuid::NAMESPACE_URL, self.url.as_bytes()).to_string()),
        }
    }

    pub fn needs_decode(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

/// Item lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Known, nothing allocated
    NotRequested,
    /// Decode session being created/initialized
    Requested,
    /// Decode session initialized and usable
    Ready,
    /// Transient failure, eligible for retry
    Failed,
    /// Retry budget exhausted
    PermanentlyFailed,
    /// Decode session disposed, record retained for display
    Released,
}

impl LifecycleState {
    /// Whether an automatic preload may start from this state
    pub fn is_preloadable(self) -> bool {
        matches!(
            self,
            LifecycleState::NotRequested | LifecycleState::Failed | LifecycleState::Released
        )
    }

    /// Legal edges of the state machine. `PermanentlyFailed -> Requested` is only
    /// taken by a manual retry.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotRequested, Requested)
                | (Failed, Requested)
                | (Released, Requested)
                | (PermanentlyFailed, Requested)
                | (Requested, Ready)
                | (Requested, Failed)
                | (Requested, PermanentlyFailed)
                | (Ready, Released)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-item state. Owns the decode handle exclusively.
pub struct ItemRecord {
    source: Arc<ItemSource>,
    state: LifecycleState,
    handle: Option<Box<dyn DecodeSession>>,
    failure_count: u32,
    last_transition_at: Instant,
}

impl fmt::Debug for ItemRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemRecord")
            .field("url", &self.source.url)
            .field("state", &self.state)
            .field("has_handle", &self.handle.is_some())
            .field("failure_count", &self.failure_count)
            .finish()
    }
}

impl ItemRecord {
    pub fn new(source: ItemSource) -> Self {
        Self {
            source: Arc::new(source),
            state: LifecycleState::NotRequested,
            handle: None,
            failure_count: 0,
            last_transition_at: Instant::now(),
        }
    }

    pub fn source(&self) -> &Arc<ItemSource> {
        &self.source
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_transition_at(&self) -> Instant {
        self.last_transition_at
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Estimated bytes held by the decode session (0 when not resident)
    pub fn resident_bytes(&self) -> usize {
        self.handle.as_ref().map(|h| h.estimated_bytes()).unwrap_or(0)
    }

    /// Transient mutable borrow of the decode handle (render pass only)
    pub fn handle_mut(&mut self) -> Option<&mut (dyn DecodeSession + 'static)> {
        self.handle.as_deref_mut()
    }

    fn transition(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.last_transition_at = Instant::now();
        debug_assert_eq!(
            self.handle.is_some(),
            self.state == LifecycleState::Ready,
            "decode handle must be present exactly in Ready"
        );
    }

    /// Atomically claim the record for preloading (-> Requested).
    ///
    /// Returns `false` if a preload is in flight, the record is resident, or
    /// the circuit breaker tripped. Only one caller can win the claim since
    /// the manager calls this under its state lock.
    pub fn try_claim_for_preload(&mut self) -> bool {
        if !self.state.is_preloadable() {
            return false;
        }
        self.transition(LifecycleState::Requested);
        true
    }

    /// Manual retry: reset the breaker and claim (-> Requested).
    pub fn claim_for_manual_retry(&mut self) -> bool {
        match self.state {
            LifecycleState::PermanentlyFailed | LifecycleState::Failed => {
                self.failure_count = 0;
                self.transition(LifecycleState::Requested);
                true
            }
            _ => false,
        }
    }

    /// Commit a successful preload (Requested -> Ready), attaching the handle.
    ///
    /// If the record is no longer waiting for this result the session is
    /// handed back so the caller can dispose it.
    pub fn commit_ready(
        &mut self,
        session: Box<dyn DecodeSession>,
    ) -> Result<(), Box<dyn DecodeSession>> {
        if self.state != LifecycleState::Requested {
            return Err(session);
        }
        self.handle = Some(session);
        self.transition(LifecycleState::Ready);
        Ok(())
    }

    /// Commit a failed preload. Trips the breaker once `failure_count`
    /// reaches `threshold`. Returns the new state.
    pub fn commit_failure(&mut self, threshold: u32) -> LifecycleState {
        if self.state != LifecycleState::Requested {
            return self.state;
        }
        self.failure_count += 1;
        if self.failure_count >= threshold {
            self.transition(LifecycleState::PermanentlyFailed);
        } else {
            self.transition(LifecycleState::Failed);
        }
        self.state
    }

    /// Dispose the decode session and mark Released (Ready -> Released).
    ///
    /// Disposal completes before the handle is dropped. Returns the bytes
    /// that were held, or `None` if the record was not resident.
    pub fn release(&mut self) -> Option<usize> {
        if self.state != LifecycleState::Ready {
            return None;
        }
        let mut handle = self.handle.take()?;
        let bytes = handle.estimated_bytes();
        handle.dispose();
        drop(handle);
        self.transition(LifecycleState::Released);
        Some(bytes)
    }

    /// Dispose whatever the record still holds before it is destroyed.
    /// Returns the bytes that were held.
    pub(crate) fn dispose_for_removal(&mut self) -> usize {
        match self.handle.take() {
            Some(mut handle) => {
                let bytes = handle.estimated_bytes();
                handle.dispose();
                bytes
            }
            None => 0,
        }
    }
}

impl Drop for ItemRecord {
    fn drop(&mut self) {
        // Records dropped with the manager still own their sessions
        self.dispose_for_removal();
    }
}
