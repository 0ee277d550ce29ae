//! Streaming lifecycle
//!
//! `StreamController` owns the streaming state and the live pipeline;
//! `StreamingState` and the start/stop outcomes are its public vocabulary.

pub mod controller;
pub mod state;

pub use controller::{ControllerStatus, StreamController};
pub use state::{StartOutcome, StopOutcome, StreamingState};
