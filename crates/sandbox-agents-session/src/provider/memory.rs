//! In-memory sandbox provider.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
};

use async_trait::async_trait;
use sandbox_agents_core::{
    SandboxHandle, SandboxProvider, SessionId, TransportError,
    traits::{CreateSandboxRequest, ExecOutput, ExecuteRequest, SubmissionResult},
};
use uuid::Uuid;

type Files = Arc<RwLock<HashMap<String, HashMap<String, Vec<u8>>>>>;

/// Output one background command produces when submitted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Appended to the stdout target one chunk at a time.
    pub stdout_chunks: Vec<String>,
    /// Written to the stderr target after stdout is complete.
    pub stderr: String,
    /// Written to the marker target last.
    pub exit_code: i32,
    /// Never write the marker, like an agent that hangs.
    pub stall: bool,
}

impl ScriptedTurn {
    /// A turn that writes `lines`, each as its own chunk.
    #[must_use]
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stdout_chunks: lines.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

/// A command the provider received.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub sandbox: String,
    /// `None` for one-off `exec` commands.
    pub session: Option<SessionId>,
    pub command: String,
    pub run_async: bool,
}

/// In-memory sandbox provider.
///
/// Useful for tests and offline development. Background commands are not
/// run; instead the next queued [`ScriptedTurn`] is written to the files
/// named by the command's `> out 2> err ; ... > marker` redirections.
pub struct MemorySandbox {
    files: Files,
    sessions: RwLock<HashMap<String, SessionId>>,
    created_sessions: RwLock<Vec<SessionId>>,
    deleted: RwLock<Vec<SandboxHandle>>,
    commands: RwLock<Vec<RecordedCommand>>,
    turns: RwLock<VecDeque<ScriptedTurn>>,
    binary_present: AtomicBool,
    install_exit_code: AtomicI32,
    unreachable: AtomicBool,
    sessions_hang: AtomicBool,
}

impl MemorySandbox {
    /// Create a new in-memory provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            sessions: RwLock::new(HashMap::new()),
            created_sessions: RwLock::new(Vec::new()),
            deleted: RwLock::new(Vec::new()),
            commands: RwLock::new(Vec::new()),
            turns: RwLock::new(VecDeque::new()),
            binary_present: AtomicBool::new(true),
            install_exit_code: AtomicI32::new(0),
            unreachable: AtomicBool::new(false),
            sessions_hang: AtomicBool::new(false),
        }
    }

    /// Queue the output of the next background command.
    pub fn push_turn(&self, turn: ScriptedTurn) {
        write(&self.turns).push_back(turn);
    }

    /// Whether the binary check succeeds.
    pub fn set_binary_present(&self, present: bool) {
        self.binary_present.store(present, Ordering::SeqCst);
    }

    /// Exit code returned by `exec`.
    pub fn set_install_exit_code(&self, code: i32) {
        self.install_exit_code.store(code, Ordering::SeqCst);
    }

    /// Make every call fail with `TransportError::Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `get_or_create_session` never return, like a stuck control plane.
    pub fn set_sessions_hang(&self, hang: bool) {
        self.sessions_hang.store(hang, Ordering::SeqCst);
    }

    /// Write a file, replacing any previous content.
    pub fn write_file(&self, handle: &SandboxHandle, path: &str, data: impl Into<Vec<u8>>) {
        write(&self.files)
            .entry(handle.id.clone())
            .or_default()
            .insert(path.to_string(), data.into());
    }

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<RecordedCommand> {
        read(&self.commands).clone()
    }

    /// Sessions created so far, in order.
    #[must_use]
    pub fn created_sessions(&self) -> Vec<SessionId> {
        read(&self.created_sessions).clone()
    }

    /// Sandboxes deleted so far, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<SandboxHandle> {
        read(&self.deleted).clone()
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TransportError::Unreachable("memory sandbox marked unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn record(&self, sandbox: &SandboxHandle, session: Option<&SessionId>, command: &str, run_async: bool) {
        write(&self.commands).push(RecordedCommand {
            sandbox: sandbox.id.clone(),
            session: session.cloned(),
            command: command.to_string(),
            run_async,
        });
    }

    fn play_turn(&self, handle: &SandboxHandle, command: &str) {
        let Some(targets) = RedirectTargets::parse(command) else {
            tracing::debug!(sandbox = %handle, "background command without redirections; nothing to play");
            return;
        };
        let turn = write(&self.turns).pop_front().unwrap_or_default();
        let files = Arc::clone(&self.files);
        let sandbox = handle.id.clone();

        tokio::spawn(async move {
            for chunk in turn.stdout_chunks {
                tokio::task::yield_now().await;
                append(&files, &sandbox, &targets.stdout, chunk.as_bytes());
            }
            tokio::task::yield_now().await;
            append(&files, &sandbox, &targets.stdout, b"");
            append(&files, &sandbox, &targets.stderr, turn.stderr.as_bytes());
            if turn.stall {
                return;
            }
            append(&files, &sandbox, &targets.marker, format!("{}\n", turn.exit_code).as_bytes());
        });
    }
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for MemorySandbox {
    async fn create(&self, req: &CreateSandboxRequest) -> Result<SandboxHandle, TransportError> {
        self.check_reachable()?;
        let handle = SandboxHandle {
            id: format!("mem-{}", Uuid::new_v4()),
            name: req.name.clone(),
        };
        write(&self.files).insert(handle.id.clone(), HashMap::new());
        Ok(handle)
    }

    async fn delete(&self, handle: &SandboxHandle) -> Result<(), TransportError> {
        self.check_reachable()?;
        write(&self.files).remove(&handle.id);
        write(&self.sessions).remove(&handle.id);
        write(&self.deleted).push(handle.clone());
        Ok(())
    }

    async fn get_or_create_session(&self, handle: &SandboxHandle) -> Result<SessionId, TransportError> {
        self.check_reachable()?;
        if self.sessions_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut sessions = write(&self.sessions);
        if let Some(session) = sessions.get(&handle.id) {
            return Ok(session.clone());
        }
        let session = SessionId(format!("session-{}", Uuid::new_v4()));
        sessions.insert(handle.id.clone(), session.clone());
        write(&self.created_sessions).push(session.clone());
        Ok(session)
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        session: &SessionId,
        req: &ExecuteRequest,
    ) -> Result<SubmissionResult, TransportError> {
        self.check_reachable()?;
        self.record(handle, Some(session), &req.command, req.run_async);
        let command_id = format!("cmd-{}", Uuid::new_v4());

        if req.run_async {
            self.play_turn(handle, &req.command);
            return Ok(SubmissionResult {
                command_id,
                ..SubmissionResult::default()
            });
        }

        if req.command.starts_with("command -v") {
            let present = self.binary_present.load(Ordering::SeqCst);
            return Ok(SubmissionResult {
                command_id,
                exit_code: Some(if present { 0 } else { 1 }),
                stdout: present.then(|| "/usr/local/bin/claude\n1.0.0 (Claude Code)\n".to_string()),
                stderr: (!present).then(|| "not found".to_string()),
            });
        }

        Ok(SubmissionResult {
            command_id,
            exit_code: Some(0),
            stdout: Some(String::new()),
            stderr: None,
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, TransportError> {
        self.check_reachable()?;
        self.record(handle, None, command, false);
        let exit_code = self.install_exit_code.load(Ordering::SeqCst);
        let output = if exit_code == 0 {
            String::new()
        } else {
            format!("{command}: exited with {exit_code}")
        };
        Ok(ExecOutput { exit_code, output })
    }

    async fn file_exists(&self, handle: &SandboxHandle, path: &str) -> Result<bool, TransportError> {
        self.check_reachable()?;
        read(&self.files)
            .get(&handle.id)
            .map(|files| files.contains_key(path))
            .ok_or_else(|| TransportError::sandbox_gone(handle))
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, TransportError> {
        self.check_reachable()?;
        read(&self.files)
            .get(&handle.id)
            .ok_or_else(|| TransportError::sandbox_gone(handle))?
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }
}

/// Files named by `cmd > stdout 2> stderr ; echo $? > marker`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RedirectTargets {
    stdout: String,
    stderr: String,
    marker: String,
}

impl RedirectTargets {
    fn parse(command: &str) -> Option<Self> {
        let tokens = shlex::split(command)?;
        let target_of = |op: &str| {
            tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| *t == op)
                .filter_map(|(i, _)| tokens.get(i + 1).cloned())
                .collect::<Vec<_>>()
        };
        let stdout_targets = target_of(">");
        let stderr = target_of("2>").into_iter().next()?;
        if stdout_targets.len() < 2 {
            return None;
        }
        Some(Self {
            stdout: stdout_targets.first()?.clone(),
            marker: stdout_targets.last()?.clone(),
            stderr,
        })
    }
}

fn append(files: &Files, sandbox: &str, path: &str, data: &[u8]) {
    let mut files = write(files);
    // Deleted sandboxes swallow late writes.
    if let Some(sandbox_files) = files.get_mut(sandbox) {
        sandbox_files.entry(path.to_string()).or_default().extend_from_slice(data);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
