//! Conversion services
//!
//! Matcher, task lifecycle, event sequencing and the engine that drives them.

pub mod conversion_engine;
pub mod event_emitter;
pub mod matcher;
pub mod task_tracker;

pub use conversion_engine::ConversionEngine;
pub use event_emitter::{EventEmitter, TaskEmitter};
pub use matcher::Matcher;
pub use task_tracker::{Restart, RunClaim, TaskTracker};
