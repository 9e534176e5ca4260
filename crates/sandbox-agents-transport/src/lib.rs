//! Output transport between a sandbox and the event stream.
//!
//! Provides:
//! - `OutputPoller` - in-order lines from a file being appended to remotely
//! - `ProviderPollSource` - poll source over a `SandboxProvider`

pub mod poller;
pub mod source;

pub use poller::{DEFAULT_POLL_INTERVAL, LineStream, OutputPoller};
pub use source::ProviderPollSource;
