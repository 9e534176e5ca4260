//! Collaborator traits: the sandbox provider and the poll source.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Opaque handle to one provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Provider-assigned sandbox identifier.
    pub id: String,
    /// Human-readable name, if one was requested.
    pub name: Option<String>,
}

impl SandboxHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({name})", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Identifier of a persistent execution context inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Snapshot image to boot from.
    pub snapshot: String,
    /// Optional human-readable name.
    pub name: Option<String>,
}

/// A command submitted inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Shell command line.
    pub command: String,
    /// Return as soon as the command is submitted instead of when it exits.
    pub run_async: bool,
}

impl ExecuteRequest {
    /// A command whose result is awaited.
    #[must_use]
    pub fn blocking(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            run_async: false,
        }
    }

    /// A command that keeps running after submission.
    #[must_use]
    pub fn background(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            run_async: true,
        }
    }
}

/// Result of submitting a session command.
///
/// For background submissions only `command_id` is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub command_id: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl SubmissionResult {
    /// Whether a blocking command exited with status zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Output of a one-off command run outside any session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Trait for sandbox provisioning backends.
///
/// Credentials are the implementation's business; every method reports
/// failures as `TransportError`. Calls naming a deleted sandbox fail with
/// [`TransportError::sandbox_gone`], never `NotFound`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new sandbox.
    async fn create(&self, req: &CreateSandboxRequest) -> Result<SandboxHandle, TransportError>;

    /// Delete a sandbox and everything running in it.
    async fn delete(&self, handle: &SandboxHandle) -> Result<(), TransportError>;

    /// Return the sandbox's persistent session, creating it if needed.
    async fn get_or_create_session(&self, handle: &SandboxHandle)
    -> Result<SessionId, TransportError>;

    /// Submit a command inside a session.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        session: &SessionId,
        req: &ExecuteRequest,
    ) -> Result<SubmissionResult, TransportError>;

    /// Run a one-off command to completion, outside any session.
    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, TransportError>;

    /// Check whether a remote path exists.
    async fn file_exists(&self, handle: &SandboxHandle, path: &str) -> Result<bool, TransportError>;

    /// Read a remote file. Missing files are `TransportError::NotFound`.
    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, TransportError>;
}

/// Read-only view of a filesystem another process is appending to.
///
/// This is the capability the output poller needs; anything that can read a
/// file and test for a marker can back it.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Read a whole file. `Ok(None)` when it does not exist yet.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// Check whether a path exists.
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;
}
