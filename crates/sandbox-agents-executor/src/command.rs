//! Command building utilities.
//!
//! Commands are rendered to a single POSIX shell line because they run in a
//! remote session, not as a local child process.

use std::borrow::Cow;

use thiserror::Error;
use uuid::Uuid;

/// Prefix of every per-turn file written in the sandbox.
pub const REDIRECT_FILE_PREFIX: &str = "sandbox-agents-";

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Invalid environment variable name: {0:?}")]
    InvalidEnvName(String),
}

/// Remote files capturing one invocation's output.
///
/// All three share a fresh UUID stem, so no two invocations ever collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectPaths {
    /// Standard output, one structured record per line.
    pub output: String,
    /// Standard error.
    pub stderr: String,
    /// Completion marker; holds the exit status once the command finishes.
    pub marker: String,
}

impl RedirectPaths {
    /// Generate a fresh set of paths under `dir`.
    #[must_use]
    pub fn fresh(dir: &str) -> Self {
        let dir = dir.trim_end_matches('/');
        let stem = format!("{dir}/{REDIRECT_FILE_PREFIX}{}", Uuid::new_v4());
        Self {
            output: format!("{stem}.jsonl"),
            stderr: format!("{stem}.err"),
            marker: format!("{stem}.done"),
        }
    }
}

/// Parsed command parts (environment + program + args).
#[derive(Debug, Clone)]
pub struct CommandParts {
    pub env: Vec<(String, String)>,
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(env: Vec<(String, String)>, program: String, args: Vec<String>) -> Self {
        Self { env, program, args }
    }

    /// Render as a quoted shell line.
    ///
    /// # Errors
    /// Returns error if a token cannot be quoted.
    pub fn to_shell_line(&self) -> Result<String, CommandBuildError> {
        let mut tokens = Vec::with_capacity(self.env.len() + self.args.len() + 1);
        for (name, value) in &self.env {
            tokens.push(format!("{name}={}", quote(value)?));
        }
        tokens.push(quote(&self.program)?.into_owned());
        for arg in &self.args {
            tokens.push(quote(arg)?.into_owned());
        }
        Ok(tokens.join(" "))
    }

    /// Render with stdout, stderr and the exit-status marker wired to `paths`.
    ///
    /// The marker is written only after the command exits, so its presence
    /// means both output files are complete.
    ///
    /// # Errors
    /// Returns error if a token cannot be quoted.
    pub fn to_redirected_line(&self, paths: &RedirectPaths) -> Result<String, CommandBuildError> {
        Ok(format!(
            "{} > {} 2> {} ; echo $? > {}",
            self.to_shell_line()?,
            quote(&paths.output)?,
            quote(&paths.stderr)?,
            quote(&paths.marker)?,
        ))
    }
}

/// Builder for constructing commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
    /// Optional parameters to append.
    pub params: Option<Vec<String>>,
    /// Environment assignments prefixed to the command.
    pub env: Vec<(String, String)>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
            env: Vec::new(),
        }
    }

    /// Add parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Extend parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Set an environment variable for the command.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Build command for initial invocation.
    ///
    /// # Errors
    /// Returns error if command is invalid.
    pub fn build_initial(&self) -> Result<CommandParts, CommandBuildError> {
        self.build(&[])
    }

    /// Build command for follow-up invocation.
    ///
    /// # Errors
    /// Returns error if command is invalid.
    pub fn build_follow_up(&self, additional_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        self.build(additional_args)
    }

    fn build(&self, additional_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        for (name, _) in &self.env {
            if !is_env_name(name) {
                return Err(CommandBuildError::InvalidEnvName(name.clone()));
            }
        }

        let mut parts =
            shlex::split(&self.base).ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        if let Some(ref params) = self.params {
            parts.extend(params.clone());
        }
        parts.extend(additional_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(self.env.clone(), program, parts))
    }
}

fn quote(token: &str) -> Result<Cow<'_, str>, CommandBuildError> {
    Ok(shlex::try_quote(token)?)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
