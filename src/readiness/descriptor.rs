use crate::services::ServiceTier;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle status of a tracked service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Initializing,
    Ready,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Initializing => "initializing",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Failed => "failed",
        }
    }

    /// Allowed edges: `initializing -> ready | failed`, `ready | failed -> initializing`.
    pub(crate) fn can_become(&self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (*self, next),
            (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Initializing)
                | (Failed, Initializing)
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one service's readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(with = "crate::utils::time::epoch_ms")]
    pub last_check: SystemTime,
    #[serde(with = "crate::utils::time::opt_duration_ms", default)]
    pub init_duration: Option<Duration>,
    #[serde(default)]
    pub error: Option<String>,
    pub tier: ServiceTier,
    /// Number of times this service has entered `initializing` since registration.
    pub attempt: u32,
}

impl ServiceDescriptor {
    pub(crate) fn initializing(name: String, tier: ServiceTier) -> Self {
        Self {
            name,
            status: ServiceStatus::Initializing,
            last_check: SystemTime::now(),
            init_duration: None,
            error: None,
            tier,
            attempt: 1,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ServiceStatus::Ready
    }
}

/// Aggregate, read-only view over every tracked service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// Sorted by service name.
    pub services: Vec<ServiceDescriptor>,
    pub basic_ready: bool,
    pub enhanced_ready: bool,
}

impl SystemStatus {
    pub fn count(&self, status: ServiceStatus) -> usize {
        self.services.iter().filter(|s| s.status == status).count()
    }

    pub fn total(&self) -> usize {
        self.services.len()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Result of a lifecycle transition request.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: ServiceStatus,
        to: ServiceStatus,
    },
    /// Requested state equals the current one; nothing was written.
    Unchanged(ServiceStatus),
    UnknownService,
    Rejected {
        from: ServiceStatus,
        to: ServiceStatus,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}
