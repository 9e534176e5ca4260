//! Claude Code invocation and stream-json decoding.

pub mod decode;

pub use decode::{DecodeError, EventDecoder};

use crate::command::{CommandBuildError, CommandBuilder, CommandParts};

/// Skip every permission prompt; the sandbox is the isolation boundary.
pub const FLAG_SKIP_PERMISSIONS: &str = "--dangerously-skip-permissions";
/// Run non-interactively with the given prompt.
pub const FLAG_PRINT: &str = "-p";
/// Select the output format.
pub const FLAG_OUTPUT_FORMAT: &str = "--output-format";
/// One JSON object per line on stdout.
pub const OUTPUT_FORMAT_STREAM_JSON: &str = "stream-json";
/// Required by the CLI alongside stream-json in print mode.
pub const FLAG_VERBOSE: &str = "--verbose";
/// Emit incremental message deltas.
pub const FLAG_INCLUDE_PARTIAL: &str = "--include-partial-messages";
/// Append custom instructions to the system prompt.
pub const FLAG_APPEND_SYSTEM_PROMPT: &str = "--append-system-prompt";
/// Resume the most recent conversation in the working context.
pub const FLAG_CONTINUE: &str = "--continue";

/// One turn sent to the agent.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub prompt: String,
    pub instructions: Option<String>,
    pub continue_conversation: bool,
}

/// Builds Claude Code command lines for a sandbox.
#[derive(Debug, Clone)]
pub struct ClaudeCode {
    binary: String,
}

impl ClaudeCode {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Shell line that exits non-zero when the binary is not on PATH.
    ///
    /// # Errors
    /// Returns error if the binary name cannot be quoted.
    pub fn verify_line(&self) -> Result<String, CommandBuildError> {
        let binary = shlex::try_quote(&self.binary)?;
        Ok(format!("command -v {binary} && {binary} --version"))
    }

    /// Build the command for one turn.
    ///
    /// `api_key` is exported to the agent under `api_key_env`.
    ///
    /// # Errors
    /// Returns error if the command is invalid.
    pub fn turn_command(
        &self,
        turn: &TurnRequest,
        api_key_env: &str,
        api_key: &str,
    ) -> Result<CommandParts, CommandBuildError> {
        let mut builder = CommandBuilder::new(shlex::try_quote(&self.binary)?)
            .env(api_key_env, api_key)
            .params([
                FLAG_SKIP_PERMISSIONS,
                FLAG_PRINT,
                turn.prompt.as_str(),
                FLAG_OUTPUT_FORMAT,
                OUTPUT_FORMAT_STREAM_JSON,
                FLAG_VERBOSE,
                FLAG_INCLUDE_PARTIAL,
            ]);

        if let Some(instructions) = turn.instructions.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.extend_params([FLAG_APPEND_SYSTEM_PROMPT, instructions]);
        }

        if turn.continue_conversation {
            builder.build_follow_up(&[FLAG_CONTINUE.to_string()])
        } else {
            builder.build_initial()
        }
    }
}
