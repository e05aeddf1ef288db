use super::{ManagedService, ServiceKind};
use crate::Result;
use async_trait::async_trait;

/// Last-resort candidate: no dependencies, ready immediately.
#[derive(Debug, Clone)]
pub struct PassthroughService {
    name: String,
}

impl PassthroughService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for PassthroughService {
    fn default() -> Self {
        Self::new("basic-fallback")
    }
}

#[async_trait]
impl ManagedService for PassthroughService {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::Passthrough
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
}
