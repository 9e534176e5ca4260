//! Sandbox provider backed by local scratch directories.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use sandbox_agents_core::{
    SandboxHandle, SandboxProvider, SessionId, TransportError,
    traits::{CreateSandboxRequest, ExecOutput, ExecuteRequest, SubmissionResult},
};
use tokio::{process::Command, sync::Mutex};
use uuid::Uuid;

use crate::shell::get_shell_command;

/// Directory name under the user cache dir holding sandboxes.
const DEFAULT_ROOT_DIR: &str = "sandbox-agents";

struct LocalSandbox {
    dir: PathBuf,
    session: Option<SessionId>,
    /// Background commands still owned by this sandbox.
    children: Vec<AsyncGroupChild>,
}

/// A [`SandboxProvider`] running commands on this machine.
///
/// Each sandbox is a fresh directory under `root`; commands run through
/// `sh -c` in their own process group with the sandbox directory as working
/// directory. Relative file paths resolve against that directory, absolute
/// paths are used as-is. Deleting a sandbox kills its background commands
/// and removes the directory.
///
/// There is no isolation: this is for development and tests.
pub struct LocalProvider {
    root: PathBuf,
    sandboxes: Mutex<HashMap<String, LocalSandbox>>,
}

impl LocalProvider {
    /// Create a provider storing sandboxes under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a provider under the user cache directory, or the system temp
    /// directory when there is none.
    #[must_use]
    pub fn with_default_root() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(DEFAULT_ROOT_DIR))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of a live sandbox.
    ///
    /// # Errors
    /// Returns [`TransportError::sandbox_gone`] for unknown or deleted sandboxes.
    pub async fn sandbox_dir(&self, handle: &SandboxHandle) -> Result<PathBuf, TransportError> {
        self.sandboxes
            .lock()
            .await
            .get(&handle.id)
            .map(|sandbox| sandbox.dir.clone())
            .ok_or_else(|| TransportError::sandbox_gone(handle))
    }

    async fn resolve(&self, handle: &SandboxHandle, path: &str) -> Result<PathBuf, TransportError> {
        let dir = self.sandbox_dir(handle).await?;
        let path = Path::new(path);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        })
    }
}

async fn shell(dir: &Path, line: &str) -> Command {
    let (program, arg) = get_shell_command().await;
    let mut cmd = Command::new(program);
    cmd.arg(arg).arg(line).current_dir(dir).stdin(Stdio::null());
    cmd
}

async fn run_to_completion(dir: &Path, line: &str) -> Result<std::process::Output, TransportError> {
    let mut cmd = shell(dir, line).await;
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd.group_spawn()?;
    Ok(child.wait_with_output().await?)
}

fn not_found_as(path: &Path, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound(path.display().to_string())
    } else {
        TransportError::Io(err)
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn create(&self, req: &CreateSandboxRequest) -> Result<SandboxHandle, TransportError> {
        let id = format!("local-{}", Uuid::new_v4());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let handle = SandboxHandle {
            id,
            name: req.name.clone(),
        };
        if !req.snapshot.is_empty() {
            tracing::debug!(sandbox = %handle, snapshot = %req.snapshot, "snapshots are ignored by the local provider");
        }
        tracing::info!(sandbox = %handle, dir = %dir.display(), "local sandbox created");

        self.sandboxes.lock().await.insert(
            handle.id.clone(),
            LocalSandbox {
                dir,
                session: None,
                children: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn delete(&self, handle: &SandboxHandle) -> Result<(), TransportError> {
        let sandbox = self
            .sandboxes
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| TransportError::sandbox_gone(handle))?;

        for mut child in sandbox.children {
            if let Err(e) = child.start_kill() {
                tracing::debug!(sandbox = %handle, error = %e, "background command already gone");
            }
            if let Err(e) = child.wait().await {
                tracing::debug!(sandbox = %handle, error = %e, "failed to reap background command");
            }
        }

        match tokio::fs::remove_dir_all(&sandbox.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(sandbox = %handle, "local sandbox deleted");
        Ok(())
    }

    async fn get_or_create_session(&self, handle: &SandboxHandle) -> Result<SessionId, TransportError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| TransportError::sandbox_gone(handle))?;
        Ok(sandbox
            .session
            .get_or_insert_with(|| SessionId(format!("{}-session", handle.id)))
            .clone())
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        session: &SessionId,
        req: &ExecuteRequest,
    ) -> Result<SubmissionResult, TransportError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| TransportError::sandbox_gone(handle))?;
        if sandbox.session.as_ref() != Some(session) {
            return Err(TransportError::NotFound(format!("session {session}")));
        }
        let dir = sandbox.dir.clone();
        let command_id = format!("cmd-{}", Uuid::new_v4());

        if req.run_async {
            sandbox
                .children
                .retain_mut(|child| matches!(child.try_wait(), Ok(None)));

            let mut cmd = shell(&dir, &req.command).await;
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            let child = cmd.group_spawn()?;
            tracing::debug!(sandbox = %handle, %command_id, pid = ?child.id(), "background command started");
            sandbox.children.push(child);
            return Ok(SubmissionResult {
                command_id,
                ..SubmissionResult::default()
            });
        }
        drop(sandboxes);

        let output = run_to_completion(&dir, &req.command).await?;
        Ok(SubmissionResult {
            command_id,
            exit_code: output.status.code(),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, TransportError> {
        let dir = self.sandbox_dir(handle).await?;
        let output = run_to_completion(&dir, command).await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        // Killed by a signal.
        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ExecOutput {
            exit_code,
            output: combined,
        })
    }

    async fn file_exists(&self, handle: &SandboxHandle, path: &str) -> Result<bool, TransportError> {
        let path = self.resolve(handle, path).await?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.resolve(handle, path).await?;
        tokio::fs::read(&path).await.map_err(|e| not_found_as(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn provider() -> (tempfile::TempDir, LocalProvider, SandboxHandle) {
        let root = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let handle = provider.create(&CreateSandboxRequest::default()).await.unwrap();
        (root, provider, handle)
    }

    async fn wait_for(provider: &LocalProvider, handle: &SandboxHandle, path: &str) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !provider.file_exists(handle, path).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_exec_runs_in_sandbox_dir() {
        let (_root, provider, handle) = provider().await;

        let out = provider.exec(&handle, "printf hi > a.txt").await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(provider.read_file(&handle, "a.txt").await.unwrap(), b"hi");

        let absolute = provider.sandbox_dir(&handle).await.unwrap().join("a.txt");
        assert!(
            provider
                .file_exists(&handle, &absolute.to_string_lossy())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_exec_reports_failure_output() {
        let (_root, provider, handle) = provider().await;
        let out = provider.exec(&handle, "echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_blocking_execute_returns_streams() {
        let (_root, provider, handle) = provider().await;
        let session = provider.get_or_create_session(&handle).await.unwrap();
        assert_eq!(provider.get_or_create_session(&handle).await.unwrap(), session);

        let result = provider
            .execute(&handle, &session, &ExecuteRequest::blocking("echo out; echo err >&2"))
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.stdout.as_deref(), Some("out\n"));
        assert_eq!(result.stderr.as_deref(), Some("err\n"));

        let stranger = SessionId("other".into());
        assert!(
            provider
                .execute(&handle, &stranger, &ExecuteRequest::blocking("true"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_background_command_writes_redirect_targets() {
        let (_root, provider, handle) = provider().await;
        let session = provider.get_or_create_session(&handle).await.unwrap();

        let submitted = provider
            .execute(
                &handle,
                &session,
                &ExecuteRequest::background("echo line > out.jsonl 2> out.err ; echo $? > out.done"),
            )
            .await
            .unwrap();
        assert!(submitted.exit_code.is_none());

        wait_for(&provider, &handle, "out.done").await;
        assert_eq!(provider.read_file(&handle, "out.jsonl").await.unwrap(), b"line\n");
        assert_eq!(provider.read_file(&handle, "out.done").await.unwrap(), b"0\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_root, provider, handle) = provider().await;
        assert!(!provider.file_exists(&handle, "nope").await.unwrap());
        assert!(provider.read_file(&handle, "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_kills_background_and_removes_dir() {
        let (_root, provider, handle) = provider().await;
        let session = provider.get_or_create_session(&handle).await.unwrap();
        let dir = provider.sandbox_dir(&handle).await.unwrap();

        provider
            .execute(&handle, &session, &ExecuteRequest::background("sleep 30"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), provider.delete(&handle))
            .await
            .unwrap()
            .unwrap();

        assert!(!dir.exists());
        assert!(matches!(
            provider.read_file(&handle, "a").await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(matches!(
            provider.file_exists(&handle, "a").await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(matches!(provider.delete(&handle).await, Err(TransportError::Unreachable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_a_turn_from_a_local_agent() {
        use std::{os::unix::fs::PermissionsExt, sync::Arc};

        use futures::TryStreamExt;
        use sandbox_agents_core::{AgentConfig, EventKind};
        use sandbox_agents_session::{StreamOptions, create_session_for_agent};

        let bin = tempfile::tempdir().unwrap();
        let agent = bin.path().join("fake-claude");
        std::fs::write(
            &agent,
            "#!/bin/sh\n\
             if [ \"$1\" = \"--version\" ]; then echo '0.0.0 (fake)'; exit 0; fi\n\
             echo '{\"type\":\"text\",\"text\":\"hello\"}'\n\
             echo 'not json'\n\
             echo '{\"type\":\"result\",\"result\":\"done\"}'\n\
             echo 'warning: fake' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = tempfile::tempdir().unwrap();
        let provider: Arc<dyn SandboxProvider> = Arc::new(LocalProvider::new(root.path()));
        let config = AgentConfig {
            binary: agent.to_string_lossy().into_owned(),
            install_command: None,
            output_dir: root.path().to_string_lossy().into_owned(),
            ..AgentConfig::with_api_key("sk-test")
        };

        let session = create_session_for_agent(provider, config).await.unwrap();
        let options = StreamOptions::default()
            .poll_interval(Duration::from_millis(10))
            .deadline(Duration::from_secs(30));
        let events: Vec<_> = session
            .stream("hi", options)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let kinds: Vec<_> = events.iter().map(|e| e.kind().clone()).collect();
        assert_eq!(kinds, vec![EventKind::Text, EventKind::Result, EventKind::Stderr]);
        assert_eq!(events[0].content(), "hello");
        assert_eq!(events[1].content(), "done");
        assert!(events[2].content().contains("warning: fake"));

        session.close().await.unwrap();
    }
}
