//! Process-backed pipeline
//!
//! Runs the media pipeline as a `gst-launch-1.0 -e <description>` child.
//! With `-e`, SIGINT makes gst-launch push end-of-stream through the
//! pipeline and exit once it is flushed, which is the cooperative stop the
//! controller needs. Progress and errors are read from the child's output.
//!
//! The child is owned by a supervisor task on the runtime. Signals are
//! routed through it, so nothing can reach the process once it is reaped.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::handle::{Pipeline, PipelineBackend, PipelineEvent};
use crate::config::PipelineConfig;
use crate::error::{AgentError, Result};

const STATE_PREFIX: &str = "Setting pipeline to ";
const ERROR_PREFIX: &str = "ERROR:";
const EOS_MARKER: &str = "Got EOS from element";
/// Time a finished pipeline gets to exit on its own before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(5);
/// Time the output readers get to drain after the child exited
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Backend that launches pipelines as child processes
#[derive(Debug, Default, Clone)]
pub struct LaunchBackend;

impl LaunchBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PipelineBackend for LaunchBackend {
    fn create(&self, config: &PipelineConfig) -> Result<Box<dyn Pipeline>> {
        Ok(Box::new(LaunchPipeline::new(config)?))
    }
}

/// Find the launcher either as a path or on `PATH`
fn resolve_launcher(launcher: &str) -> Option<PathBuf> {
    let path = Path::new(launcher);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(launcher))
            .find(|candidate| candidate.is_file())
    })
}

/// Output of a running child, in arrival order
enum Output {
    Line(String),
    /// Sent once, after both output streams are drained
    Exited(std::io::Result<ExitStatus>),
}

struct LaunchPipeline {
    launcher: PathBuf,
    args: Vec<String>,
    description: String,
    runtime: Handle,
    /// Signal requests for the supervisor; `None` until started
    signals: Mutex<Option<mpsc::UnboundedSender<Signal>>>,
    output: Mutex<Option<mpsc::UnboundedReceiver<Output>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
    killed: AtomicBool,
    finished: AtomicBool,
}

impl LaunchPipeline {
    fn new(config: &PipelineConfig) -> Result<Self> {
        let launcher = resolve_launcher(&config.launcher).ok_or_else(|| {
            AgentError::Pipeline(format!("Pipeline launcher not found: {}", config.launcher))
        })?;
        let description = config.render_description();
        if description.trim().is_empty() {
            return Err(AgentError::Pipeline("Empty pipeline description".to_string()));
        }
        let runtime = Handle::try_current().map_err(|e| {
            AgentError::Pipeline(format!("Pipeline launcher needs a tokio runtime: {}", e))
        })?;

        debug!("Pipeline launcher: {}", launcher.display());
        Ok(Self {
            launcher,
            args: config.args.clone(),
            description,
            runtime,
            signals: Mutex::new(None),
            output: Mutex::new(None),
            supervisor: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// Classify one line of launcher output
    fn parse_line(&self, line: &str) -> Option<PipelineEvent> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            return Some(PipelineEvent::Error(rest.trim().to_string()));
        }
        if line.starts_with(EOS_MARKER) {
            return Some(self.end_event());
        }
        if let Some(rest) = line.strip_prefix(STATE_PREFIX) {
            let state = rest.trim_end_matches('.').trim();
            return Some(PipelineEvent::StateChanged(state.to_string()));
        }
        None
    }

    fn end_event(&self) -> PipelineEvent {
        if self.stop_requested.load(Ordering::SeqCst) {
            PipelineEvent::Stopped
        } else {
            PipelineEvent::EndOfStream
        }
    }

    /// Map the exit status of the reaped child
    fn exit_event(&self, status: std::io::Result<ExitStatus>) -> PipelineEvent {
        match status {
            Ok(status) if status.success() => self.end_event(),
            Ok(_) if self.killed.load(Ordering::SeqCst) => PipelineEvent::Stopped,
            Ok(status) => PipelineEvent::Error(describe_exit(&self.launcher, status)),
            Err(e) => PipelineEvent::Error(format!("Failed to reap pipeline process: {}", e)),
        }
    }

    /// Hand a signal to the supervisor
    ///
    /// Returns `false` once the child has been reaped.
    fn send_signal(&self, signal: Signal) -> bool {
        self.signals
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    fn kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
        if self.send_signal(Signal::SIGKILL) {
            warn!("Killing pipeline process");
        }
    }
}

fn spawn_reader<R>(runtime: &Handle, reader: R, tx: mpsc::UnboundedSender<Output>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    runtime.spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(Output::Line(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    trace!("Pipeline output read error: {}", e);
                    break;
                }
            }
        }
    })
}

/// Own the child until it exits, delivering signals while it is alive
async fn supervise(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    readers: Vec<JoinHandle<()>>,
    output: mpsc::UnboundedSender<Output>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => deliver(&mut child, signal),
        }
    };
    // Closed before the exit is reported: later signal requests fail
    drop(signals);

    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut reader).await.is_err() {
            debug!("Pipeline output still open after exit, abandoning it");
            reader.abort();
        }
    }
    let _ = output.send(Output::Exited(status));
}

fn deliver(child: &mut Child, signal: Signal) {
    if signal == Signal::SIGKILL {
        if let Err(e) = child.start_kill() {
            debug!("Failed to kill pipeline process: {}", e);
        }
        return;
    }
    let Some(pid) = child.id() else {
        return;
    };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!("Sent {:?} to pipeline process {}", signal, pid),
        Err(e) => debug!("Failed to send {:?} to pipeline process {}: {}", signal, pid, e),
    }
}

fn describe_exit(launcher: &Path, status: ExitStatus) -> String {
    let name = launcher
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| launcher.display().to_string());
    match status.code() {
        Some(code) => format!("{} exited with code {}", name, code),
        None => format!("{} terminated by signal", name),
    }
}

impl Pipeline for LaunchPipeline {
    fn start(&self) -> Result<()> {
        let mut signals = self.signals.lock();
        if signals.is_some() {
            return Err(AgentError::Pipeline("Pipeline already started".to_string()));
        }

        info!(
            "Launching pipeline: {} {} {}",
            self.launcher.display(),
            self.args.join(" "),
            self.description
        );

        let _guard = self.runtime.enter();
        let mut child = Command::new(&self.launcher)
            .args(&self.args)
            .arg(&self.description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Pipeline(format!("Failed to launch pipeline: {}", e)))?;
        info!("Pipeline started with PID {:?}", child.id());

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let readers: Vec<_> = [
            child
                .stdout
                .take()
                .map(|out| spawn_reader(&self.runtime, out, output_tx.clone())),
            child
                .stderr
                .take()
                .map(|err| spawn_reader(&self.runtime, err, output_tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let supervisor = self
            .runtime
            .spawn(supervise(child, signal_rx, readers, output_tx));

        *signals = Some(signal_tx);
        *self.output.lock() = Some(output_rx);
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    fn signal_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.send_signal(Signal::SIGINT) {
            debug!("Requested end-of-stream from pipeline");
        }
    }

    fn force_stop(&self) {
        self.kill();
    }

    fn wait_next_event(&self) -> PipelineEvent {
        if self.finished.load(Ordering::SeqCst) {
            return PipelineEvent::Stopped;
        }

        let mut output = self.output.lock();
        let Some(rx) = output.as_mut() else {
            return PipelineEvent::Stopped;
        };

        let event = loop {
            match rx.blocking_recv() {
                Some(Output::Line(line)) => {
                    trace!("[pipeline] {}", line);
                    if let Some(event) = self.parse_line(&line) {
                        break event;
                    }
                }
                Some(Output::Exited(status)) => break self.exit_event(status),
                None => break PipelineEvent::Stopped,
            }
        };

        if event.is_terminal() {
            self.finished.store(true, Ordering::SeqCst);
        }
        event
    }

    fn destroy(&self) -> Result<()> {
        let Some(mut supervisor) = self.supervisor.lock().take() else {
            return Ok(());
        };
        let graceful = self.finished.load(Ordering::SeqCst) && !self.killed.load(Ordering::SeqCst);

        let joined = self.runtime.block_on(async {
            if graceful {
                if let Ok(result) = tokio::time::timeout(EXIT_GRACE, &mut supervisor).await {
                    return result;
                }
                debug!("Pipeline process still running after {:?}", EXIT_GRACE);
            }
            self.kill();
            supervisor.await
        });
        self.output.lock().take();

        joined.map_err(|e| AgentError::Pipeline(format!("Pipeline supervisor failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn shell(script: &str) -> PipelineConfig {
        PipelineConfig {
            launcher: "sh".to_string(),
            args: vec!["-c".to_string()],
            description: script.to_string(),
            stream_name: "test".to_string(),
        }
    }

    fn next_terminal(pipeline: &dyn Pipeline) -> PipelineEvent {
        loop {
            let event = pipeline.wait_next_event();
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[test]
    fn test_missing_launcher() {
        let rt = runtime();
        let _guard = rt.enter();
        let config = PipelineConfig {
            launcher: "definitely-not-a-real-launcher".to_string(),
            ..Default::default()
        };
        assert!(LaunchBackend::new().create(&config).is_err());
    }

    #[test]
    fn test_requires_runtime() {
        let err = LaunchPipeline::new(&shell("true")).err().unwrap();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[test]
    fn test_state_and_eos_parsing() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new()
            .create(&shell(
                "echo 'Setting pipeline to PLAYING ...'; echo 'Got EOS from element \"pipeline0\".'",
            ))
            .unwrap();
        pipeline.start().unwrap();

        assert_eq!(
            pipeline.wait_next_event(),
            PipelineEvent::StateChanged("PLAYING".to_string())
        );
        assert_eq!(pipeline.wait_next_event(), PipelineEvent::EndOfStream);
        assert_eq!(pipeline.wait_next_event(), PipelineEvent::Stopped);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_error_line() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new()
            .create(&shell(
                "echo \"ERROR: from element /GstPipeline:pipeline0/GstV4l2Src:v4l2src0: Cannot identify device\" >&2; exit 1",
            ))
            .unwrap();
        pipeline.start().unwrap();

        match next_terminal(pipeline.as_ref()) {
            PipelineEvent::Error(reason) => assert!(reason.contains("Cannot identify device")),
            other => panic!("unexpected event {:?}", other),
        }
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new().create(&shell("exit 3")).unwrap();
        pipeline.start().unwrap();
        assert_eq!(
            pipeline.wait_next_event(),
            PipelineEvent::Error("sh exited with code 3".to_string())
        );
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_clean_exit_is_end_of_stream() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new().create(&shell("true")).unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.wait_next_event(), PipelineEvent::EndOfStream);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_no_signal_after_exit() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchPipeline::new(&shell("true")).unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.wait_next_event(), PipelineEvent::EndOfStream);

        // The child is reaped: its pid may belong to another process now
        assert!(!pipeline.send_signal(Signal::SIGINT));
        assert!(!pipeline.send_signal(Signal::SIGKILL));
        pipeline.signal_stop();
        pipeline.force_stop();
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_signal_stop_is_cooperative() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new()
            .create(&shell(
                "trap 'echo \"Got EOS from element pipeline0\"; exit 0' INT; \
                 echo 'Setting pipeline to PLAYING ...'; \
                 while true; do sleep 0.05; done",
            ))
            .unwrap();
        pipeline.start().unwrap();

        assert!(matches!(
            pipeline.wait_next_event(),
            PipelineEvent::StateChanged(_)
        ));
        pipeline.signal_stop();
        assert_eq!(next_terminal(pipeline.as_ref()), PipelineEvent::Stopped);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_force_stop() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new()
            .create(&shell("echo 'Setting pipeline to PLAYING ...'; exec sleep 30"))
            .unwrap();
        pipeline.start().unwrap();
        assert!(!pipeline.wait_next_event().is_terminal());

        pipeline.force_stop();
        assert_eq!(next_terminal(pipeline.as_ref()), PipelineEvent::Stopped);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_destroy_kills_running_child() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchPipeline::new(&shell("exec sleep 30")).unwrap();
        pipeline.start().unwrap();

        pipeline.destroy().unwrap();
        assert!(pipeline.killed.load(Ordering::SeqCst));
        assert!(!pipeline.send_signal(Signal::SIGINT));
    }

    #[test]
    fn test_start_twice_fails() {
        let rt = runtime();
        let _guard = rt.enter();
        let pipeline = LaunchBackend::new().create(&shell("exec sleep 5")).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.start().is_err());
        pipeline.destroy().unwrap();
    }
}
