//! Stream lifecycle controller
//!
//! Owns the single authoritative [`StreamingState`] and the lifetime of the
//! live pipeline. Every transition happens under one async mutex:
//!
//! - `request_start` decides under the lock, releases it while the blocking
//!   create/start run, then re-acquires it to commit. A generation counter
//!   ties watchers and completions to the pipeline they belong to.
//! - `request_stop` and `on_pipeline_terminated` hold the lock for the whole
//!   teardown, so concurrent stops serialize and the loser observes Idle.
//! - The watcher is always joined before its pipeline is destroyed.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{StartOutcome, StopOutcome, StreamingState};
use crate::config::{ControllerConfig, PipelineConfig};
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::pipeline::{EventWatcher, PipelineBackend, PipelineHandle, Termination};

/// Snapshot of the controller for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: StreamingState,
    /// Generation of the current (or last) pipeline
    pub generation: u64,
    /// Reason of the last pipeline failure
    pub last_error: Option<String>,
    /// Number of successful starts
    pub starts: u64,
    /// Automatic restarts since the last explicit start
    pub restart_attempts: u32,
}

/// Who asked for a start
enum StartOrigin {
    Command,
    Restart(CancellationToken),
}

struct Inner {
    state: StreamingState,
    generation: u64,
    pipeline: Option<PipelineHandle>,
    watcher: Option<EventWatcher>,
    /// A stop arrived while starting
    pending_stop: bool,
    last_error: Option<String>,
    starts: u64,
    restart_attempts: u32,
    /// Pending automatic restart
    recovery: Option<CancellationToken>,
}

impl Inner {
    fn cancel_recovery(&mut self) {
        if let Some(token) = self.recovery.take() {
            debug!("Cancelling pending stream restart");
            token.cancel();
        }
    }
}

/// Pipeline lifecycle controller
pub struct StreamController {
    backend: Arc<dyn PipelineBackend>,
    pipeline_config: PipelineConfig,
    config: ControllerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<StreamingState>,
    events: RwLock<Option<Arc<EventBus>>>,
}

impl StreamController {
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        pipeline_config: PipelineConfig,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StreamingState::Idle);
        Arc::new(Self {
            backend,
            pipeline_config,
            config,
            inner: Mutex::new(Inner {
                state: StreamingState::Idle,
                generation: 0,
                pipeline: None,
                watcher: None,
                pending_stop: false,
                last_error: None,
                starts: 0,
                restart_attempts: 0,
                recovery: None,
            }),
            state_tx,
            events: RwLock::new(None),
        })
    }

    /// Set event bus for state notifications
    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.events.write() = Some(events);
    }

    /// Current state (last committed transition)
    pub fn state(&self) -> StreamingState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<StreamingState> {
        self.state_tx.subscribe()
    }

    pub async fn status(&self) -> ControllerStatus {
        let inner = self.inner.lock().await;
        ControllerStatus {
            state: inner.state,
            generation: inner.generation,
            last_error: inner.last_error.clone(),
            starts: inner.starts,
            restart_attempts: inner.restart_attempts,
        }
    }

    /// Start streaming
    ///
    /// Only acts from Idle or Faulted; any other state yields
    /// [`StartOutcome::AlreadyActive`].
    pub async fn request_start(self: &Arc<Self>) -> StartOutcome {
        self.start_with(StartOrigin::Command)
            .await
            .unwrap_or(StartOutcome::AlreadyActive)
    }

    /// Returns `None` if a scheduled restart no longer applies
    async fn start_with(self: &Arc<Self>, origin: StartOrigin) -> Option<StartOutcome> {
        let generation = {
            let mut inner = self.inner.lock().await;
            match origin {
                StartOrigin::Restart(ref token) => {
                    if token.is_cancelled() || inner.state != StreamingState::Faulted {
                        debug!(state = %inner.state, "Scheduled restart no longer applies");
                        return None;
                    }
                    inner.recovery = None;
                    inner.restart_attempts += 1;
                    info!(attempt = inner.restart_attempts, "Restarting stream");
                }
                StartOrigin::Command => {
                    inner.cancel_recovery();
                    if !inner.state.is_active() {
                        inner.restart_attempts = 0;
                    }
                }
            }

            if inner.state.is_active() {
                info!(state = %inner.state, "Stream already active");
                return Some(StartOutcome::AlreadyActive);
            }

            inner.generation += 1;
            inner.pending_stop = false;
            self.set_state(&mut inner, StreamingState::Starting);
            inner.generation
        };

        info!(generation, "Starting stream");
        let backend = self.backend.clone();
        let pipeline_config = self.pipeline_config.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<PipelineHandle> {
            let mut handle = PipelineHandle::create(backend.as_ref(), &pipeline_config, generation)?;
            if let Err(e) = handle.start() {
                if let Err(destroy_err) = handle.destroy() {
                    warn!(generation, "Failed to release pipeline after start error: {}", destroy_err);
                }
                return Err(e);
            }
            Ok(handle)
        })
        .await
        .unwrap_or_else(|e| Err(AgentError::Internal(format!("pipeline start task failed: {}", e))));

        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != StreamingState::Starting {
            warn!(
                generation,
                current = inner.generation,
                "Discarding stale pipeline start"
            );
            if let Ok(handle) = result {
                Self::destroy_handle(handle).await;
            }
            return Some(StartOutcome::Failed(format!(
                "start of generation {} superseded",
                generation
            )));
        }

        match result {
            Ok(handle) => {
                let watcher = self.spawn_watcher(&handle);
                inner.pipeline = Some(handle);
                inner.watcher = Some(watcher);
                inner.starts += 1;
                inner.last_error = None;
                self.set_state(&mut inner, StreamingState::Running);
                info!(generation, "Stream started");

                if std::mem::take(&mut inner.pending_stop) {
                    info!(generation, "Applying deferred stop request");
                    self.stop_locked(&mut inner).await;
                }
                Some(StartOutcome::Started)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(generation, "Failed to start stream: {}", reason);
                inner.last_error = Some(reason.clone());
                inner.pending_stop = false;
                self.set_state(&mut inner, StreamingState::Faulted);
                if matches!(origin, StartOrigin::Restart(_)) {
                    self.schedule_restart(&mut inner);
                }
                Some(StartOutcome::Failed(reason))
            }
        }
    }

    /// Stop streaming
    ///
    /// Returns once the watcher has ended and the pipeline is destroyed. A
    /// stop during Starting is deferred until the start completes.
    pub async fn request_stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        inner.cancel_recovery();

        match inner.state {
            StreamingState::Running => {
                self.stop_locked(&mut inner).await;
                StopOutcome::Stopped
            }
            StreamingState::Starting => {
                if inner.pending_stop {
                    debug!("Stop already pending");
                } else {
                    info!(generation = inner.generation, "Stream is starting, deferring stop");
                    inner.pending_stop = true;
                }
                StopOutcome::Deferred
            }
            state => {
                debug!(%state, "Stream not running, stop ignored");
                StopOutcome::NotRunning
            }
        }
    }

    /// Cooperative stop with deadline; caller holds the lock
    async fn stop_locked(&self, inner: &mut Inner) {
        let Some(handle) = inner.pipeline.take() else {
            self.set_state(inner, StreamingState::Idle);
            return;
        };
        let generation = handle.generation();
        self.set_state(inner, StreamingState::Stopping);
        info!(generation, "Stopping stream");

        handle.signal_stop();
        if let Some(mut watcher) = inner.watcher.take() {
            let timeout = Duration::from_millis(self.config.stop_timeout_ms);
            if !watcher.join_timeout(timeout).await {
                warn!(
                    generation,
                    "Pipeline did not stop within {}ms, killing it", self.config.stop_timeout_ms
                );
                handle.force_stop();
                watcher.join().await;
            }
        }

        Self::destroy_handle(handle).await;
        self.set_state(inner, StreamingState::Idle);
        info!(generation, "Stream stopped");
    }

    /// Handle the end of a watched pipeline
    ///
    /// Ignored when `generation` is not the current pipeline or the stream
    /// is not Running (a stop already owns the teardown).
    pub async fn on_pipeline_terminated(self: &Arc<Self>, generation: u64, termination: Termination) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != StreamingState::Running {
            debug!(
                generation,
                current = inner.generation,
                state = %inner.state,
                "Ignoring pipeline termination ({})",
                termination
            );
            return;
        }

        if let Some(watcher) = inner.watcher.take() {
            watcher.join().await;
        }
        if let Some(handle) = inner.pipeline.take() {
            Self::destroy_handle(handle).await;
        }

        match termination {
            Termination::Error(reason) => {
                error!(generation, "Stream failed: {}", reason);
                inner.last_error = Some(reason);
                self.set_state(&mut inner, StreamingState::Faulted);
                self.schedule_restart(&mut inner);
            }
            Termination::EndOfStream | Termination::Stopped => {
                info!(generation, "Stream ended ({})", termination);
                self.set_state(&mut inner, StreamingState::Idle);
            }
        }
    }

    /// Stop streaming for process shutdown, waiting out an in-flight start
    pub async fn shutdown(&self) {
        loop {
            match self.request_stop().await {
                StopOutcome::Deferred => {
                    let mut rx = self.subscribe_state();
                    let _ = rx.wait_for(|s| *s != StreamingState::Starting).await;
                }
                StopOutcome::Stopped | StopOutcome::NotRunning => break,
            }
        }
        self.inner.lock().await.cancel_recovery();
        debug!("Stream controller shut down");
    }

    fn spawn_watcher(self: &Arc<Self>, handle: &PipelineHandle) -> EventWatcher {
        let controller = Arc::downgrade(self);
        let runtime = Handle::current();
        EventWatcher::spawn(
            handle.generation(),
            handle.downgrade(),
            move |generation, termination| {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                runtime.spawn(async move {
                    controller
                        .on_pipeline_terminated(generation, termination)
                        .await;
                });
            },
        )
    }

    /// Schedule a delayed restart after a runtime failure, if the policy allows
    fn schedule_restart(self: &Arc<Self>, inner: &mut Inner) {
        let policy = &self.config.restart;
        if !policy.enabled {
            return;
        }
        if policy.max_attempts > 0 && inner.restart_attempts >= policy.max_attempts {
            warn!(
                attempts = inner.restart_attempts,
                "Stream restart attempts exhausted, waiting for an explicit start"
            );
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = inner.recovery.replace(token.clone()) {
            previous.cancel();
        }

        let delay = Duration::from_millis(policy.delay_ms);
        info!(
            "Scheduling stream restart in {}ms (attempt {})",
            policy.delay_ms,
            inner.restart_attempts + 1
        );

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(StartOutcome::Failed(reason)) =
                        controller.start_with(StartOrigin::Restart(token.clone())).await
                    {
                        warn!("Stream restart failed: {}", reason);
                    }
                }
            }
        });
    }

    async fn destroy_handle(mut handle: PipelineHandle) {
        let generation = handle.generation();
        match tokio::task::spawn_blocking(move || handle.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(generation, "Failed to destroy pipeline: {}", e),
            Err(e) => error!(generation, "Pipeline destroy task failed: {}", e),
        }
    }

    fn set_state(&self, inner: &mut Inner, state: StreamingState) {
        if inner.state == state {
            return;
        }
        debug!(from = %inner.state, to = %state, "Stream state transition");
        inner.state = state;
        self.state_tx.send_replace(state);

        if let Some(events) = self.events.read().as_ref() {
            events.publish(AgentEvent::StreamStateChanged {
                state,
                generation: inner.generation,
                error: if state == StreamingState::Faulted {
                    inner.last_error.clone()
                } else {
                    None
                },
            });
        }
    }
}
