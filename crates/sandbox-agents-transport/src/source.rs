//! `PollSource` backed by a sandbox provider's file primitives.

use std::sync::Arc;

use async_trait::async_trait;
use sandbox_agents_core::{PollSource, SandboxHandle, SandboxProvider, TransportError};

/// Reads a sandbox's files through its provider.
#[derive(Clone)]
pub struct ProviderPollSource {
    provider: Arc<dyn SandboxProvider>,
    handle: SandboxHandle,
}

impl ProviderPollSource {
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>, handle: SandboxHandle) -> Self {
        Self { provider, handle }
    }
}

#[async_trait]
impl PollSource for ProviderPollSource {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        match self.provider.read_file(&self.handle, path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        self.provider.file_exists(&self.handle, path).await
    }
}
