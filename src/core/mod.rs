//! Core engine modules - records, scheduling, eviction, workers, events
//!
//! These modules form the video lifecycle engine, independent of UI.

pub mod decode;
pub mod events;
pub mod evictor;
pub mod item;
pub mod manager;
pub mod memory;
pub mod ordering;
pub mod scheduler;
pub mod workers;

// Re-exports for convenience
pub use decode::{DecodeError, DecodeFactory, DecodeSession};
pub use events::{FeedEvent, FeedEvents};
pub use evictor::MemoryEvictor;
pub use item::{ItemId, ItemSource, LifecycleState, MediaKind};
pub use manager::{FeedSnapshot, FeedStats, LifecycleManager, StateCounts};
pub use memory::MemoryBudget;
pub use ordering::OrderingIndex;
pub use scheduler::{NetworkClass, PreloadPlan, PreloadPolicy, PreloadScheduler, Priority};
pub use workers::Workers;
