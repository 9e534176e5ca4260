//! Local sandbox provider.
//!
//! Provides:
//! - `LocalProvider` - sandboxes as scratch directories on this machine
//! - Shell detection utilities

pub mod provider;
pub mod shell;

pub use provider::LocalProvider;
pub use shell::{get_shell_command, resolve_executable_path};
