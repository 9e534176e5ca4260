//! Session manager owning the one persistent execution context of a sandbox.

use std::sync::Arc;

use sandbox_agents_core::{
    SandboxHandle, SandboxProvider, SessionId, TransportError,
    traits::{ExecuteRequest, SubmissionResult},
};
use sandbox_agents_executor::{ClaudeCode, CommandBuildError};
use tokio::sync::Mutex;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("{binary} binary not found in sandbox: {detail}")]
    BinaryNotFound { binary: String, detail: String },
    #[error("Session is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct State {
    session: Option<SessionId>,
    binary_verified: bool,
    closed: bool,
}

/// Lazily creates and reuses exactly one session per sandbox.
///
/// The binary check is cached here, per sandbox, so two sandboxes in one
/// process never share it.
pub struct SessionManager {
    provider: Arc<dyn SandboxProvider>,
    handle: SandboxHandle,
    claude: ClaudeCode,
    state: Mutex<State>,
}

impl SessionManager {
    /// Create a manager for an already provisioned sandbox.
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>, handle: SandboxHandle, claude: ClaudeCode) -> Self {
        Self {
            provider,
            handle,
            claude,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    #[must_use]
    pub const fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Return the sandbox session, creating it on first use.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` after `close()`, or the provider's error.
    pub async fn ensure_session(&self) -> Result<SessionId, SessionError> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state).await
    }

    /// Check once per sandbox that the agent binary is installed.
    ///
    /// Only success is cached; a failed check runs again next time.
    ///
    /// # Errors
    /// Returns `SessionError::BinaryNotFound` when the check exits non-zero.
    pub async fn verify_binary_present(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.verify_locked(&mut state).await
    }

    /// Ensure a session exists and the binary has been verified.
    ///
    /// # Errors
    /// Returns the first failure of either step.
    pub async fn prepare(&self) -> Result<SessionId, SessionError> {
        let mut state = self.state.lock().await;
        let session = self.ensure_locked(&mut state).await?;
        self.verify_locked(&mut state).await?;
        Ok(session)
    }

    /// Submit a command in the session.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` after `close()`, or the provider's error.
    pub async fn submit(
        &self,
        session: &SessionId,
        req: &ExecuteRequest,
    ) -> Result<SubmissionResult, SessionError> {
        if self.state.lock().await.closed {
            return Err(SessionError::Closed);
        }
        Ok(self.provider.execute(&self.handle, session, req).await?)
    }

    /// Read a file from the sandbox.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` after `close()`, or the provider's error.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        if self.state.lock().await.closed {
            return Err(SessionError::Closed);
        }
        Ok(self.provider.read_file(&self.handle, path).await?)
    }

    /// Whether `close()` has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Delete the sandbox, releasing the session with it.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns the provider's error if deletion fails. The manager is closed
    /// either way.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let session = state.session.take();
        drop(state);

        tracing::info!(sandbox = %self.handle, ?session, "deleting sandbox");
        self.provider.delete(&self.handle).await?;
        Ok(())
    }

    async fn ensure_locked(&self, state: &mut State) -> Result<SessionId, SessionError> {
        if state.closed {
            return Err(SessionError::Closed);
        }
        if let Some(session) = &state.session {
            return Ok(session.clone());
        }

        let session = self.provider.get_or_create_session(&self.handle).await?;
        tracing::debug!(sandbox = %self.handle, %session, "session created");
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn verify_locked(&self, state: &mut State) -> Result<(), SessionError> {
        if state.binary_verified {
            return Ok(());
        }
        let session = self.ensure_locked(state).await?;

        let req = ExecuteRequest::blocking(self.claude.verify_line()?);
        let result = self.provider.execute(&self.handle, &session, &req).await?;
        if !result.succeeded() {
            let detail = result
                .stderr
                .filter(|s| !s.trim().is_empty())
                .or(result.stdout)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("exit code {:?}", result.exit_code));
            return Err(SessionError::BinaryNotFound {
                binary: self.claude.binary().to_string(),
                detail,
            });
        }

        tracing::info!(
            sandbox = %self.handle,
            binary = self.claude.binary(),
            found = result.stdout.as_deref().map(str::trim),
            "agent binary verified"
        );
        state.binary_verified = true;
        Ok(())
    }
}
