//! Core abstractions for streaming agent sessions out of remote sandboxes.
//!
//! This crate provides the fundamental building blocks:
//! - `StreamEvent` - Typed unit of agent output
//! - `AgentConfig` - Credentials and sandbox settings
//! - `SandboxProvider` and `PollSource` collaborator traits
//! - Shared error types

pub mod config;
pub mod error;
pub mod event;
pub mod traits;

pub use config::AgentConfig;
pub use error::{ConfigError, TransportError};
pub use event::{EventKind, StreamEvent};
pub use traits::{PollSource, SandboxHandle, SandboxProvider, SessionId};
