//! Agent and sandbox configuration.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default environment variable holding the agent API key.
pub const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Default sandbox snapshot image.
pub const DEFAULT_SNAPSHOT: &str = "daytonaio/sandbox:latest";

/// Default agent binary name inside the sandbox.
pub const DEFAULT_BINARY: &str = "claude";

/// Default command installing the agent runtime in a fresh sandbox.
pub const DEFAULT_INSTALL_COMMAND: &str = "npm install -g @anthropic-ai/claude-code";

/// Configuration for creating a sandbox session that runs an agent.
///
/// Every field has a default, so partial TOML/JSON documents deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit API key. Falls back to `api_key_env` when unset.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is unset. Also the
    /// variable exported to the agent process.
    pub api_key_env: String,

    /// Sandbox snapshot image.
    pub snapshot: String,

    /// Optional human-readable sandbox name.
    pub name: Option<String>,

    /// Agent binary invoked inside the sandbox.
    pub binary: String,

    /// Command run once after creation. `None` skips the install step.
    pub install_command: Option<String>,

    /// Remote directory receiving per-turn output, stderr and marker files.
    pub output_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            snapshot: DEFAULT_SNAPSHOT.to_string(),
            name: None,
            binary: DEFAULT_BINARY.to_string(),
            install_command: Some(DEFAULT_INSTALL_COMMAND.to_string()),
            output_dir: "/tmp".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration with an explicit API key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Resolve the API key from the explicit value or the environment.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingCredential` when neither is set.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    /// Resolve the API key using a custom environment lookup.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingCredential` when neither is set.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<String, ConfigError>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| lookup(&self.api_key_env).filter(|key| !key.trim().is_empty()))
            .ok_or_else(|| ConfigError::MissingCredential {
                name: "An agent API key",
                env_var: self.api_key_env.clone(),
            })
    }

    /// Check fields that would otherwise produce a malformed command line.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidParameter` for blank required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.trim().is_empty() {
            return Err(ConfigError::InvalidParameter("binary must not be empty".into()));
        }
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::InvalidParameter(
                "output_dir must not be empty".into(),
            ));
        }
        if self.api_key_env.trim().is_empty()
            || !self
                .api_key_env
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::InvalidParameter(format!(
                "api_key_env is not a valid variable name: {:?}",
                self.api_key_env
            )));
        }
        Ok(())
    }
}
