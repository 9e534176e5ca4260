//! Shell detection for running sandbox command lines.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Fallback when no shell can be resolved on PATH.
const FALLBACK_SHELL: &str = "/bin/sh";

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Create from an absolute path to an existing file.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name() {
            Some(name) if name == OsStr::new("bash") => Self::Bash(path_buf),
            Some(name) if name == OsStr::new("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (PathBuf, &'static str) {
        (self.path().to_path_buf(), "-c")
    }
}

/// Returns the POSIX shell used for sandbox commands as `(program, arg)`.
///
/// Sandbox command lines use `;`, `$?` and `2>`, so the user's interactive
/// shell is not consulted.
pub async fn get_shell_command() -> (PathBuf, &'static str) {
    let shell = match resolve_executable_path("sh").await {
        Some(path) => UnixShell::from_path(&path),
        None => None,
    }
    .unwrap_or_else(|| UnixShell::Sh(PathBuf::from(FALLBACK_SHELL)));
    shell.get_shell_command()
}

/// Resolve an executable by name.
///
/// Explicit absolute paths are returned when they exist; anything else is
/// looked up on the current PATH via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
