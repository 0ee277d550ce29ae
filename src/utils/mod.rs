//! Utility modules shared across the agent

pub mod throttle;

pub use throttle::LogThrottler;
