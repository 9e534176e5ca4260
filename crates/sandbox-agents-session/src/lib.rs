//! Sandbox sessions and streaming agent turns.
//!
//! Provides:
//! - `SessionManager` - one lazily created session per sandbox
//! - `AgentRunner` - runs a turn and streams its events
//! - `Session` / `create_session_for_agent` - the public entry point
//! - Provider implementations (memory)

pub mod manager;
pub mod provider;
pub mod runner;
pub mod sandbox;

pub use manager::{SessionError, SessionManager};
pub use runner::{AgentRunner, EventStream, StreamError, StreamOptions};
pub use sandbox::{CreateError, Session, create_session_for_agent};
