//! Pipeline event watcher
//!
//! Runs the pipeline's blocking event loop on a dedicated blocking task and
//! reports how the pipeline ended through a single callback.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::handle::{Pipeline, PipelineEvent};

/// How a watched pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Fatal runtime error
    Error(String),
    /// Clean end-of-stream
    EndOfStream,
    /// Cooperative stop (or the pipeline was released)
    Stopped,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Error(reason) => write!(f, "error: {}", reason),
            Termination::EndOfStream => write!(f, "end-of-stream"),
            Termination::Stopped => write!(f, "stopped"),
        }
    }
}

/// Joinable watcher task bound to one pipeline generation
pub struct EventWatcher {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl EventWatcher {
    /// Spawn the watcher loop
    ///
    /// `on_terminated` runs exactly once on the watcher's thread, right
    /// before the task ends. It must not block on the stream controller.
    pub fn spawn<F>(generation: u64, pipeline: Weak<dyn Pipeline>, on_terminated: F) -> Self
    where
        F: FnOnce(u64, Termination) + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(move || {
            debug!(generation, "Pipeline watcher started");
            let termination = Self::run(generation, &pipeline);
            drop(pipeline);
            debug!(generation, "Pipeline watcher finished: {}", termination);
            on_terminated(generation, termination);
        });

        Self {
            generation,
            task: Some(task),
        }
    }

    fn run(generation: u64, pipeline: &Weak<dyn Pipeline>) -> Termination {
        loop {
            let Some(pipeline) = pipeline.upgrade() else {
                debug!(generation, "Pipeline released, watcher exiting");
                return Termination::Stopped;
            };
            let event = pipeline.wait_next_event();
            drop(pipeline);

            match event {
                PipelineEvent::StateChanged(state) => {
                    debug!(generation, "Pipeline state changed to {}", state);
                }
                PipelineEvent::Error(reason) => {
                    error!(generation, "Pipeline error: {}", reason);
                    return Termination::Error(reason);
                }
                PipelineEvent::EndOfStream => {
                    info!(generation, "Pipeline reached end-of-stream");
                    return Termination::EndOfStream;
                }
                PipelineEvent::Stopped => {
                    debug!(generation, "Pipeline stopped");
                    return Termination::Stopped;
                }
            }
        }
    }

    /// Wait for the watcher task to end, at most `timeout`
    ///
    /// Returns `false` if the deadline passed; the watcher stays joinable.
    pub async fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(result) => {
                self.task = None;
                Self::log_join(self.generation, result);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for the watcher task to end
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            Self::log_join(self.generation, task.await);
        }
    }

    fn log_join(generation: u64, result: Result<(), JoinError>) {
        if let Err(e) = result {
            error!(generation, "Pipeline watcher task failed: {}", e);
        }
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!(
                generation = self.generation,
                "Pipeline watcher dropped before it was joined"
            );
        }
    }
}
