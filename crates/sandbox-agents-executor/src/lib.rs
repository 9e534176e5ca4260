//! Agent command building and output decoding.
//!
//! Provides:
//! - Shell command building with per-turn output redirection
//! - Claude Code invocation flags
//! - `stream-json` line decoding

pub mod claude;
pub mod command;

pub use claude::{ClaudeCode, DecodeError, EventDecoder, TurnRequest};
pub use command::{CommandBuildError, CommandBuilder, CommandParts, RedirectPaths};
