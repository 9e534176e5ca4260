//! Sandbox provider implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemorySandbox, RecordedCommand, ScriptedTurn};
