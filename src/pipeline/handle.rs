//! Opaque pipeline contract and the owning handle
//!
//! A [`PipelineBackend`] creates [`Pipeline`] instances; the stream
//! controller wraps each one in a [`PipelineHandle`], which is the only
//! owner allowed to destroy it.

use std::sync::{Arc, Weak};
use tracing::{debug, error};

use crate::config::PipelineConfig;
use crate::error::{AgentError, Result};

/// Low-level event reported by a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Pipeline moved to a new state (e.g. "PAUSED", "PLAYING")
    StateChanged(String),
    /// Fatal runtime error
    Error(String),
    /// All data has been flushed downstream
    EndOfStream,
    /// Pipeline ended after a cooperative stop request
    Stopped,
}

impl PipelineEvent {
    /// Whether this event ends the pipeline's event stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineEvent::StateChanged(_))
    }
}

/// One opaque media pipeline instance
///
/// All methods take `&self`: `wait_next_event` blocks on the watcher's
/// thread while the controller may concurrently call `signal_stop` or
/// `force_stop`.
pub trait Pipeline: Send + Sync {
    /// Start producing media
    fn start(&self) -> Result<()>;

    /// Ask the pipeline to finish gracefully (end-of-stream). Must not block.
    fn signal_stop(&self);

    /// Terminate the pipeline immediately
    fn force_stop(&self);

    /// Block until the next pipeline event
    ///
    /// After a terminal event has been returned, further calls return
    /// [`PipelineEvent::Stopped`] without blocking.
    fn wait_next_event(&self) -> PipelineEvent;

    /// Release all underlying resources, blocking until done
    fn destroy(&self) -> Result<()>;
}

/// Factory for pipelines
pub trait PipelineBackend: Send + Sync {
    fn create(&self, config: &PipelineConfig) -> Result<Box<dyn Pipeline>>;
}

/// Owning wrapper around one live pipeline
///
/// Enforces the destroy-once rule: a second [`destroy`](Self::destroy) is
/// reported as [`AgentError::PipelineAlreadyDestroyed`] and never reaches
/// the backend.
pub struct PipelineHandle {
    generation: u64,
    pipeline: Arc<dyn Pipeline>,
    destroyed: bool,
}

impl PipelineHandle {
    /// Create a pipeline through the backend
    pub fn create(
        backend: &dyn PipelineBackend,
        config: &PipelineConfig,
        generation: u64,
    ) -> Result<Self> {
        let pipeline = backend.create(config)?;
        debug!(generation, "Pipeline created");
        Ok(Self {
            generation,
            pipeline: Arc::from(pipeline),
            destroyed: false,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        self.pipeline.start()
    }

    pub fn signal_stop(&self) {
        if !self.destroyed {
            self.pipeline.signal_stop();
        }
    }

    pub fn force_stop(&self) {
        if !self.destroyed {
            self.pipeline.force_stop();
        }
    }

    /// Non-owning reference for the event watcher
    pub fn downgrade(&self) -> Weak<dyn Pipeline> {
        Arc::downgrade(&self.pipeline)
    }

    /// Destroy the pipeline (blocking). Must be called exactly once.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            let err = AgentError::PipelineAlreadyDestroyed {
                generation: self.generation,
            };
            error!("{}", err);
            return Err(err);
        }
        self.destroyed = true;
        let result = self.pipeline.destroy();
        debug!(generation = self.generation, "Pipeline destroyed");
        result
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(AgentError::PipelineAlreadyDestroyed {
                generation: self.generation,
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            error!(
                generation = self.generation,
                "Pipeline handle dropped without destroy, releasing now"
            );
            self.destroyed = true;
            if let Err(e) = self.pipeline.destroy() {
                error!("Failed to destroy dropped pipeline: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("generation", &self.generation)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
