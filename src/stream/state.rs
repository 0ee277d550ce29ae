use serde::Serialize;

/// Streaming lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingState {
    /// No pipeline exists
    #[default]
    Idle,
    /// Pipeline is being created and started
    Starting,
    /// Pipeline is live and watched
    Running,
    /// Stop in progress
    Stopping,
    /// Last pipeline failed; a new start is allowed
    Faulted,
}

impl StreamingState {
    /// Whether a pipeline may exist in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamingState::Starting | StreamingState::Running | StreamingState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingState::Idle => "idle",
            StreamingState::Starting => "starting",
            StreamingState::Running => "running",
            StreamingState::Stopping => "stopping",
            StreamingState::Faulted => "faulted",
        }
    }
}

impl std::fmt::Display for StreamingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new pipeline is running
    Started,
    /// A pipeline already exists; nothing was done
    AlreadyActive,
    /// Creation or start failed; the controller is now faulted
    Failed(String),
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The pipeline was stopped and destroyed
    Stopped,
    /// No pipeline was running
    NotRunning,
    /// A start is in flight; the pipeline stops as soon as it is up
    Deferred,
}
