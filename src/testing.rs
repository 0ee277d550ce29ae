//! Test doubles shared by the unit tests
//!
//! `MockBackend` hands out scripted pipelines and records every call made
//! on them, so tests can assert ordering (e.g. destroy only after the
//! watcher has returned). `MockChannel` is an in-memory command channel.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc as tokio_mpsc;

use crate::channel::{ChannelEvent, CommandChannel, ConnectionState, QoS};
use crate::config::PipelineConfig;
use crate::error::{AgentError, Result};
use crate::pipeline::{Pipeline, PipelineBackend, PipelineEvent};

/// Recorded pipeline interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { id: usize },
    Start { id: usize },
    SignalStop { id: usize },
    ForceStop { id: usize },
    /// `wait_next_event` returned this event
    WaitReturned { id: usize, event: PipelineEvent },
    /// `destroy` was called; `waiting` is true if a watcher was still inside `wait_next_event`
    Destroy { id: usize, waiting: bool },
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    controls: Mutex<Vec<Arc<MockControl>>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    ignore_stop: AtomicBool,
    start_delay_ms: AtomicU64,
}

impl Shared {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

/// Scripted pipeline backend
#[derive(Clone, Default)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.shared.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make `signal_stop` a no-op so only `force_stop` ends the pipeline
    pub fn ignore_stop(&self, ignore: bool) {
        self.shared.ignore_stop.store(ignore, Ordering::SeqCst);
    }

    pub fn start_delay(&self, delay: Duration) {
        self.shared
            .start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Control of the `index`-th created pipeline
    pub fn pipeline(&self, index: usize) -> Arc<MockControl> {
        self.shared.controls.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.shared.controls.lock().len()
    }

    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.shared.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Position of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.shared.calls.lock().iter().position(|c| pred(c))
    }
}

impl PipelineBackend for MockBackend {
    fn create(&self, _config: &PipelineConfig) -> Result<Box<dyn Pipeline>> {
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(AgentError::Pipeline("mock: device unavailable".to_string()));
        }

        let (tx, rx) = mpsc::channel();
        let id = {
            let mut controls = self.shared.controls.lock();
            let id = controls.len();
            controls.push(Arc::new(MockControl {
                tx: Mutex::new(tx),
                waiting: AtomicBool::new(false),
            }));
            id
        };
        let control = self.pipeline(id);

        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        self.shared.record(Call::Create { id });

        Ok(Box::new(MockPipeline {
            id,
            shared: self.shared.clone(),
            control,
            rx: Mutex::new(rx),
            finished: AtomicBool::new(false),
        }))
    }
}

/// Test-side control of one mock pipeline
pub struct MockControl {
    tx: Mutex<mpsc::Sender<PipelineEvent>>,
    waiting: AtomicBool,
}

impl MockControl {
    /// Deliver an event to the pipeline's watcher
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.lock().send(event);
    }
}

struct MockPipeline {
    id: usize,
    shared: Arc<Shared>,
    control: Arc<MockControl>,
    rx: Mutex<mpsc::Receiver<PipelineEvent>>,
    finished: AtomicBool,
}

impl Pipeline for MockPipeline {
    fn start(&self) -> Result<()> {
        self.shared.record(Call::Start { id: self.id });
        let delay = self.shared.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(AgentError::Pipeline("mock: encoder failure".to_string()));
        }
        Ok(())
    }

    fn signal_stop(&self) {
        self.shared.record(Call::SignalStop { id: self.id });
        if !self.shared.ignore_stop.load(Ordering::SeqCst) {
            self.control.emit(PipelineEvent::Stopped);
        }
    }

    fn force_stop(&self) {
        self.shared.record(Call::ForceStop { id: self.id });
        self.control.emit(PipelineEvent::Stopped);
    }

    fn wait_next_event(&self) -> PipelineEvent {
        if self.finished.load(Ordering::SeqCst) {
            return PipelineEvent::Stopped;
        }

        self.control.waiting.store(true, Ordering::SeqCst);
        let event = self.rx.lock().recv().unwrap_or(PipelineEvent::Stopped);
        self.control.waiting.store(false, Ordering::SeqCst);

        if event.is_terminal() {
            self.finished.store(true, Ordering::SeqCst);
        }
        self.shared.record(Call::WaitReturned {
            id: self.id,
            event: event.clone(),
        });
        event
    }

    fn destroy(&self) -> Result<()> {
        self.shared.record(Call::Destroy {
            id: self.id,
            waiting: self.control.waiting.load(Ordering::SeqCst),
        });
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory command channel
pub struct MockChannel {
    events_tx: tokio_mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<tokio_mpsc::UnboundedReceiver<ChannelEvent>>>,
    state: Mutex<ConnectionState>,
    fail_connect: AtomicBool,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<(String, Bytes, bool)>>,
    disconnects: AtomicUsize,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = tokio_mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnectionState::Disconnected),
            fail_connect: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Simulate an incoming notification
    pub fn inject(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn message(&self, topic: &str, payload: &str) {
        self.inject(ChannelEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes, bool)> {
        self.published.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::ConnectionFailed("mock: broker unreachable".to_string()));
        }
        *self.state.lock() = ConnectionState::Connected;
        let _ = self.events_tx.send(ChannelEvent::Connected);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.subscriptions.lock().push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, retain: bool) -> Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload, retain));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    fn take_events(&self) -> Option<tokio_mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }
}
