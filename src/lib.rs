//! # staged-orchestrator
//!
//! Service orchestration for an application that fronts a hosted LLM API and
//! must answer requests while its heavier subsystems are still starting.
//!
//! ## Overview
//!
//! Services come up in stages. Until a service reports ready, requests that
//! prefer it are routed to the next candidate, ending at an always-available
//! pass-through implementation. Lifecycle changes are published as internal
//! events, delivered in batches to subscribers such as a dashboard.
//!
//! ## Key Features
//!
//! - **Staged readiness**: [`readiness::ReadinessTracker`] with basic and enhanced tiers
//! - **Capability routing**: [`router::CapabilityRouter`] with a guaranteed last-resort candidate
//! - **Retries**: [`retry::RetryPolicy`] with fixed, linear or capped exponential backoff
//! - **Events**: [`events::EventBus`] keyed by category and source, fed by [`events::EventGenerator`]
//! - **Wiring**: [`orchestrator::OrchestrationContext`] owns all of the above, no globals
//! - **Health**: [`health::HealthReport`] for the staged-status endpoint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use staged_orchestrator::config::OrchestratorConfig;
//! use staged_orchestrator::orchestrator::OrchestrationContext;
//! use staged_orchestrator::services::{ManagedService, PassthroughService, ServiceTier};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> staged_orchestrator::Result<()> {
//!     let config = OrchestratorConfig::from_path("config/orchestrator.yaml")?;
//!     let ctx = Arc::new(OrchestrationContext::<dyn ManagedService>::new(config)?);
//!     ctx.register_service(ServiceTier::auxiliary(), Arc::new(PassthroughService::default()))?;
//!     ctx.start()?;
//!
//!     let routed = ctx
//!         .route_request("basic-chat", |svc| async move {
//!             Ok::<_, staged_orchestrator::Error>(format!("served by {}", svc.name))
//!         })
//!         .await?;
//!     println!("{} (fallback: {})", routed.value, routed.routing.used_fallback);
//!
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`readiness`] | Service descriptors, transitions and tier aggregation |
//! | [`router`] | Route configuration and readiness-aware candidate selection |
//! | [`retry`] | Retry policy and backoff strategies |
//! | [`events`] | Event types, pub/sub bus and batched generator |
//! | [`services`] | `ManagedService` lifecycle trait and service tags |
//! | [`orchestrator`] | The context that wires everything together |
//! | [`health`] | Health report shape and HTTP status mapping |
//! | [`config`] | YAML configuration with environment overrides |

pub mod config;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod readiness;
pub mod retry;
pub mod router;
pub mod services;
pub mod utils;

// Re-export main types for convenience
pub use config::OrchestratorConfig;
pub use events::{DiasEvent, EventBus, EventCategory, EventGenerator};
pub use health::HealthReport;
pub use orchestrator::OrchestrationContext;
pub use readiness::{ReadinessTracker, ServiceStatus, SystemStatus};
pub use retry::{BackoffStrategy, RetryPolicy, RetryPolicyConfig};
pub use router::{CapabilityRouter, RouteConfig, RouteDecision, Routed};
pub use services::{ManagedService, ServiceKind, ServiceTier};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
