//! FEEDREEL - video lifecycle manager for short-video feeds
//!
//! Re-exports all modules for use by the simulator binary.

// Core engine (records, scheduler, evictor, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod sim;

// Re-export commonly used types from core
pub use core::decode::{DecodeError, DecodeFactory, DecodeSession};
pub use core::events::FeedEvent;
pub use core::item::{ItemId, ItemSource, LifecycleState, MediaKind};
pub use core::manager::{FeedSnapshot, LifecycleManager};
pub use core::scheduler::NetworkClass;

pub use config::{FeedSettings, PathConfig};
