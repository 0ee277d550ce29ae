//! kvs-agent - Device-side media streaming agent
//!
//! Runs a media capture/encode pipeline and exposes remote start/stop
//! control over MQTT. The stream controller owns the pipeline lifecycle;
//! the agent wires the command channel to it.

pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod stream;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{AgentError, Result};
