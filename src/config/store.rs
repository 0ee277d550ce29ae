use std::path::Path;

use super::AgentConfig;
use crate::error::Result;

/// Load the agent configuration from a TOML file
///
/// A missing file is not an error: the defaults are returned so that a
/// device can run from CLI flags alone. The result is not validated here,
/// callers apply their overrides first and then call [`AgentConfig::validate`].
pub async fn load_config(path: &Path) -> Result<AgentConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_config(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse configuration from TOML text
pub fn parse_config(contents: &str) -> Result<AgentConfig> {
    Ok(toml::from_str(contents)?)
}
