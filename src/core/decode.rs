//! Decode primitive boundary.
//!
//! The engine never decodes media itself. It orchestrates sessions produced
//! by an injected `DecodeFactory`; any media library satisfying these traits
//! can be plugged in.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the decode primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("failed to open {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("initialization failed: {0}")]
    Initialize(String),

    #[error("initialization timed out after {0:?}")]
    Timeout(Duration),

    #[error("decode task disconnected before reporting a result")]
    Disconnected,
}

/// Initialized, playable media handle.
///
/// Exclusively owned by one `ItemRecord`. `dispose` is called exactly once,
/// synchronously, before the session is dropped.
pub trait DecodeSession: Send {
    /// Prepare the session for playback (network + decoder setup)
    fn initialize(&mut self) -> Result<(), DecodeError>;

    fn play(&mut self);

    fn pause(&mut self);

    fn set_looping(&mut self, looping: bool);

    /// Tear down decoder resources. Bounded, local work (no network I/O).
    fn dispose(&mut self);

    /// Approximate memory held while resident
    fn estimated_bytes(&self) -> usize;
}

/// Creates decode sessions for media URLs
pub trait DecodeFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Box<dyn DecodeSession>, DecodeError>;
}

impl<T: DecodeFactory + ?Sized> DecodeFactory for Arc<T> {
    fn create(&self, url: &str) -> Result<Box<dyn DecodeSession>, DecodeError> {
        (**self).create(url)
    }
}
