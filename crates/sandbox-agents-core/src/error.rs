//! Errors shared across the workspace.

use thiserror::Error;

/// Configuration error, raised before any sandbox call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required. Pass it explicitly or set {env_var}.")]
    MissingCredential { name: &'static str, env_var: String },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Failure talking to the sandbox filesystem or process surface.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Remote path not found: {0}")]
    NotFound(String),
    #[error("Sandbox unreachable: {0}")]
    Unreachable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The sandbox was deleted or never existed. Not a missing path, so
    /// pollers stop instead of waiting for it to appear.
    #[must_use]
    pub fn sandbox_gone(sandbox: impl std::fmt::Display) -> Self {
        Self::Unreachable(format!("sandbox {sandbox} no longer exists"))
    }

    /// Whether this error only means the path does not exist (yet).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
