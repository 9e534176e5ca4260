//! Public entry point: a provisioned sandbox ready to stream agent turns.

use std::sync::Arc;

use sandbox_agents_core::{
    AgentConfig, ConfigError, SandboxHandle, SandboxProvider, TransportError,
    traits::CreateSandboxRequest,
};
use sandbox_agents_executor::ClaudeCode;

use crate::{
    manager::{SessionError, SessionManager},
    runner::{AgentRunner, EventStream, StreamError, StreamOptions},
};

/// Errors creating a sandbox session.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to install agent runtime ({command} exited with {exit_code}): {output}")]
    Provisioning {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A sandbox with the agent installed, streaming turns in one session.
pub struct Session {
    manager: Arc<SessionManager>,
    runner: AgentRunner,
}

impl Session {
    /// Wrap an already provisioned sandbox. No remote calls are made.
    #[must_use]
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        handle: SandboxHandle,
        config: &AgentConfig,
        api_key: impl Into<String>,
    ) -> Self {
        let claude = ClaudeCode::new(config.binary.clone());
        let manager = Arc::new(SessionManager::new(provider, handle, claude.clone()));
        let runner = AgentRunner::new(
            Arc::clone(&manager),
            claude,
            config.api_key_env.clone(),
            api_key,
            config.output_dir.clone(),
        );
        Self { manager, runner }
    }

    #[must_use]
    pub fn handle(&self) -> &SandboxHandle {
        self.manager.handle()
    }

    /// Run one turn and return its events as they arrive.
    ///
    /// # Errors
    /// See [`AgentRunner::stream`].
    pub async fn stream(&self, prompt: &str, options: StreamOptions) -> Result<EventStream, StreamError> {
        self.runner.stream(prompt, options).await
    }

    /// Read a text file from the sandbox.
    ///
    /// # Errors
    /// Returns error if the session is closed or the read fails.
    pub async fn read_file(&self, path: &str) -> Result<String, SessionError> {
        let bytes = self.manager.read_file(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Delete the sandbox. Later calls fail with [`SessionError::Closed`].
    ///
    /// # Errors
    /// Returns error if the provider fails to delete the sandbox.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.manager.close().await
    }
}

/// Provision a sandbox, install the agent runtime and return a session.
///
/// Credentials are resolved before the provider is contacted. If the install
/// step fails the sandbox is deleted before returning.
///
/// # Errors
/// Returns `CreateError::Config` for missing credentials or bad settings,
/// `CreateError::Provisioning` if the install command fails, or the
/// provider's error.
pub async fn create_session_for_agent(
    provider: Arc<dyn SandboxProvider>,
    config: AgentConfig,
) -> Result<Session, CreateError> {
    config.validate()?;
    let api_key = config.resolve_api_key()?;

    let req = CreateSandboxRequest {
        snapshot: config.snapshot.clone(),
        name: config.name.clone(),
    };
    let handle = provider.create(&req).await?;
    tracing::info!(sandbox = %handle, snapshot = %config.snapshot, "sandbox created");

    if let Some(command) = &config.install_command {
        let failure = match provider.exec(&handle, command).await {
            Ok(out) if out.exit_code == 0 => None,
            Ok(out) => Some(CreateError::Provisioning {
                command: command.clone(),
                exit_code: out.exit_code,
                output: out.output,
            }),
            Err(e) => Some(CreateError::Transport(e)),
        };

        if let Some(err) = failure {
            tracing::error!(sandbox = %handle, error = %err, "agent install failed; deleting sandbox");
            if let Err(e) = provider.delete(&handle).await {
                tracing::warn!(sandbox = %handle, error = %e, "failed to delete sandbox after install failure");
            }
            return Err(err);
        }
        tracing::info!(sandbox = %handle, "agent runtime installed");
    }

    Ok(Session::new(provider, handle, &config, api_key))
}
