//! Health report served by the staged-status endpoint.
//!
//! The JSON shape is consumed by an existing dashboard, hence camelCase keys
//! and millisecond timestamps.

use crate::readiness::{ServiceDescriptor, ServiceStatus, SystemStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Operational,
    Initializing,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallHealth {
    pub status: OverallStatus,
    /// Percentage of tracked services that are ready, rounded.
    pub health_score: u8,
    pub basic_functionality: bool,
    pub enhanced_functionality: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesSummary {
    pub total: usize,
    pub ready: usize,
    pub initializing: usize,
    pub failed: usize,
    pub details: Vec<ServiceDescriptor>,
}

/// What the deployment can do right now.
///
/// The last three flags look up the conventional service names
/// (`pattern-engine`, `learning-system`, `blueprint-service`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Always true: every route ends in a fallback.
    pub immediate_response: bool,
    pub ai_processing: bool,
    pub intelligent_routing: bool,
    pub pattern_recognition: bool,
    pub learning_system: bool,
    pub blueprint_generation: bool,
}

impl Capabilities {
    pub fn from_status(status: &SystemStatus) -> Self {
        let ready = |name: &str| {
            status
                .services
                .iter()
                .any(|s| s.name == name && s.status == ServiceStatus::Ready)
        };
        Self {
            immediate_response: true,
            ai_processing: status.basic_ready,
            intelligent_routing: status.enhanced_ready,
            pattern_recognition: ready("pattern-engine"),
            learning_system: ready("learning-system"),
            blueprint_generation: ready("blueprint-service"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(with = "crate::utils::time::epoch_ms")]
    pub timestamp: SystemTime,
    pub overall: OverallHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesSummary>,
    /// Route name to "primary candidate currently ready".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl HealthReport {
    pub fn from_status(status: &SystemStatus, routes: BTreeMap<String, bool>) -> Self {
        let total = status.total();
        let ready = status.count(ServiceStatus::Ready);
        let initializing = status.count(ServiceStatus::Initializing);
        let failed = status.count(ServiceStatus::Failed);
        let ratio = if total > 0 {
            ready as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Self {
            timestamp: SystemTime::now(),
            overall: OverallHealth {
                status: if status.basic_ready {
                    OverallStatus::Operational
                } else {
                    OverallStatus::Initializing
                },
                health_score: ratio.round() as u8,
                basic_functionality: status.basic_ready,
                enhanced_functionality: status.enhanced_ready,
            },
            recommendations: recommendations(status, ratio, failed, initializing),
            services: Some(ServicesSummary {
                total,
                ready,
                initializing,
                failed,
                details: status.services.clone(),
            }),
            routes: Some(routes),
            capabilities: Some(Capabilities::from_status(status)),
            error: None,
            fallback: false,
        }
    }

    /// Report for when the status itself could not be computed.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            overall: OverallHealth {
                status: OverallStatus::Error,
                health_score: 0,
                basic_functionality: false,
                enhanced_functionality: false,
            },
            services: None,
            routes: None,
            capabilities: None,
            recommendations: Vec::new(),
            error: Some(message.into()),
            fallback: true,
        }
    }

    /// 200 when basic-ready, 202 while starting, 503 for error reports.
    pub fn http_status(&self) -> u16 {
        match self.overall.status {
            OverallStatus::Operational => 200,
            OverallStatus::Initializing => 202,
            OverallStatus::Error => 503,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn recommendations(
    status: &SystemStatus,
    score: f64,
    failed: usize,
    initializing: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    if score < 50.0 {
        out.push("System is still initializing - expect basic functionality only".to_string());
    } else if score < 100.0 {
        out.push(
            "Partial functionality available - some advanced features may be limited".to_string(),
        );
    } else {
        out.push("All systems operational - full functionality available".to_string());
    }
    if !status.basic_ready {
        out.push("Core AI services are starting up - responses may use fallback mode".to_string());
    }
    if !status.enhanced_ready {
        out.push("Enhanced intelligence features are initializing in the background".to_string());
    }
    if failed > 0 {
        out.push(format!(
            "{} service(s) failed to initialize - some features may be unavailable",
            failed
        ));
    }
    if initializing > 0 {
        out.push(format!(
            "{} service(s) are still starting up - check back in a moment",
            initializing
        ));
    }
    out
}
