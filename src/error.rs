use thiserror::Error;

/// Agent-wide error type
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Pipeline #{generation} was already destroyed")]
    PipelineAlreadyDestroyed { generation: u64 },

    #[error("Command channel error: {0}")]
    Channel(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short machine-friendly code, attached to structured log records
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Config(_) | AgentError::ConfigParse(_) => "config",
            AgentError::Io(_) => "io",
            AgentError::Serialization(_) => "serialization",
            AgentError::Pipeline(_) => "pipeline",
            AgentError::PipelineAlreadyDestroyed { .. } => "pipeline_destroyed",
            AgentError::Channel(_) => "channel",
            AgentError::ConnectionFailed(_) => "connection_failed",
            AgentError::Internal(_) => "internal",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AgentError::Pipeline("x".into()).code(), "pipeline");
        assert_eq!(
            AgentError::PipelineAlreadyDestroyed { generation: 3 }.code(),
            "pipeline_destroyed"
        );
        assert_eq!(AgentError::Config("x".into()).code(), "config");
    }

    #[test]
    fn test_display() {
        let err = AgentError::PipelineAlreadyDestroyed { generation: 7 };
        assert_eq!(err.to_string(), "Pipeline #7 was already destroyed");
    }
}
