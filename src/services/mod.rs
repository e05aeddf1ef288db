//! Service capability interface.
//!
//! Every concrete subsystem the router can target (AI orchestration client,
//! database-backed task service, blueprint generator, ...) implements
//! [`ManagedService`]. The readiness machinery only ever talks to this trait,
//! and the fallback branch a handler takes is chosen by matching on the
//! explicit [`ServiceKind`] tag rather than by inspecting concrete types.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod passthrough;

pub use passthrough::PassthroughService;

/// Tag attached to every bound service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// LLM-backed chat / planning / review client.
    AiOrchestration,
    /// Persistence-backed project and task operations.
    TaskManagement,
    Blueprint,
    /// Pattern recognition and learning features.
    Intelligence,
    EventGeneration,
    Migration,
    /// Degraded pass-through implementation, always available.
    Passthrough,
}

impl ServiceKind {
    /// Whether results produced by this kind should be presented as "basic mode".
    pub fn is_degraded(&self) -> bool {
        matches!(self, ServiceKind::Passthrough)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::AiOrchestration => "ai_orchestration",
            ServiceKind::TaskManagement => "task_management",
            ServiceKind::Blueprint => "blueprint",
            ServiceKind::Intelligence => "intelligence",
            ServiceKind::EventGeneration => "event_generation",
            ServiceKind::Migration => "migration",
            ServiceKind::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which aggregate readiness tiers a service gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceTier {
    #[serde(default)]
    pub required_for_basic: bool,
    #[serde(default)]
    pub required_for_enhanced: bool,
}

impl ServiceTier {
    pub fn new(required_for_basic: bool, required_for_enhanced: bool) -> Self {
        Self {
            required_for_basic,
            required_for_enhanced,
        }
    }

    /// Needed for minimum-viable operation (and therefore also for enhanced).
    pub fn basic() -> Self {
        Self::new(true, true)
    }

    /// Needed only for full-feature operation.
    pub fn enhanced() -> Self {
        Self::new(false, true)
    }

    /// Tracked and routable, but gates neither tier.
    pub fn auxiliary() -> Self {
        Self::new(false, false)
    }

    pub fn gates_enhanced(&self) -> bool {
        self.required_for_basic || self.required_for_enhanced
    }
}

/// Lifecycle contract shared by every routable service.
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ServiceKind;

    /// Bring the service up. Called in the background, possibly more than once
    /// after failures.
    async fn initialize(&self) -> Result<()>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
