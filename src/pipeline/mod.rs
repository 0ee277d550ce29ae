//! Media pipeline boundary
//!
//! This module provides:
//! - The opaque pipeline contract (`Pipeline`, `PipelineBackend`)
//! - `PipelineHandle`, the destroy-once owning wrapper
//! - `EventWatcher`, the blocking event loop task
//! - `LaunchBackend`, a gst-launch process backend

pub mod handle;
pub mod launch;
pub mod watcher;

pub use handle::{Pipeline, PipelineBackend, PipelineEvent, PipelineHandle};
pub use launch::LaunchBackend;
pub use watcher::{EventWatcher, Termination};
