//! Readiness-aware capability routing.
//!
//! A route is an ordered list of candidate services. [`CapabilityRouter::route_request`]
//! picks the first candidate the [`ReadinessTracker`] reports ready and hands
//! it to the caller's handler. When nothing is ready the **last** candidate is
//! used regardless of its state, so a route always resolves to something;
//! configure a [`PassthroughService`](crate::services::PassthroughService) there.
//!
//! ```rust
//! use staged_orchestrator::readiness::ReadinessTracker;
//! use staged_orchestrator::router::{CapabilityRouter, RouteConfig};
//! use staged_orchestrator::services::{ServiceKind, ServiceTier};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let tracker = Arc::new(ReadinessTracker::new());
//! tracker.register("ai", ServiceTier::basic()).unwrap();
//! tracker.register("basic", ServiceTier::auxiliary()).unwrap();
//!
//! let router: CapabilityRouter<str> = CapabilityRouter::new(Arc::clone(&tracker));
//! router.bind_service("ai", ServiceKind::AiOrchestration, Arc::from("llm"));
//! router.bind_service("basic", ServiceKind::Passthrough, Arc::from("echo"));
//! router
//!     .register_route("chat", RouteConfig::new(["ai", "basic"]))
//!     .unwrap();
//!
//! let routed = router
//!     .route_request("chat", |h| async move {
//!         Ok::<_, staged_orchestrator::Error>(h.service.to_string())
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(routed.value, "echo");
//! assert!(routed.routing.used_fallback);
//! # });
//! ```

use crate::readiness::ReadinessTracker;
use crate::services::ServiceKind;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Candidates in preference order, plus how long to wait for the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub candidates: Vec<String>,
    #[serde(
        rename = "ready_timeout_ms",
        with = "crate::utils::time::duration_ms",
        default
    )]
    pub ready_timeout: Duration,
}

impl RouteConfig {
    pub fn new<I, N>(candidates: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            ready_timeout: Duration::ZERO,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn primary(&self) -> Option<&str> {
        self.candidates.first().map(String::as_str)
    }

    pub(crate) fn validate(&self, route: &str) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(Error::configuration_with_context(
                format!("route '{}' has no candidates", route),
                ErrorContext::new()
                    .with_field_path(format!("routes.{}.candidates", route))
                    .with_source("capability_router"),
            ));
        }
        Ok(())
    }
}

/// What a handler receives: the chosen service and its tag.
pub struct ServiceHandle<S: ?Sized> {
    pub name: String,
    pub kind: ServiceKind,
    pub service: Arc<S>,
}

impl<S: ?Sized> Clone for ServiceHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            service: Arc::clone(&self.service),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for ServiceHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub route_name: String,
    pub chosen_service: String,
    pub chosen_kind: ServiceKind,
    /// True whenever the chosen service is not the primary candidate.
    pub used_fallback: bool,
    #[serde(with = "crate::utils::time::duration_ms")]
    pub decision_latency: Duration,
    pub waited_for_primary: bool,
}

/// Handler output annotated with the routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed<T> {
    pub value: T,
    pub routing: RouteDecision,
}

impl<T> Routed<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Point-in-time answer to "where would this route go right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub route_name: String,
    pub candidates: Vec<String>,
    pub ready_candidates: Vec<String>,
    pub primary_ready: bool,
    pub would_choose: String,
}

struct Binding<S: ?Sized> {
    kind: ServiceKind,
    service: Arc<S>,
}

pub struct CapabilityRouter<S: ?Sized> {
    tracker: Arc<ReadinessTracker>,
    services: RwLock<HashMap<String, Binding<S>>>,
    routes: RwLock<BTreeMap<String, RouteConfig>>,
}

impl<S: ?Sized> CapabilityRouter<S> {
    pub fn new(tracker: Arc<ReadinessTracker>) -> Self {
        Self {
            tracker,
            services: RwLock::new(HashMap::new()),
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ReadinessTracker> {
        &self.tracker
    }

    /// Attaches the implementation for `name`. Replaces any earlier binding.
    pub fn bind_service(&self, name: impl Into<String>, kind: ServiceKind, service: Arc<S>) {
        let name = name.into();
        tracing::debug!(service = %name, %kind, "service bound");
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Binding { kind, service });
    }

    pub fn service(&self, name: &str) -> Option<ServiceHandle<S>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|b| ServiceHandle {
                name: name.to_string(),
                kind: b.kind,
                service: Arc::clone(&b.service),
            })
    }

    pub fn register_route(&self, name: impl Into<String>, config: RouteConfig) -> Result<()> {
        let name = name.into();
        config.validate(&name)?;
        tracing::info!(route = %name, candidates = ?config.candidates, "route registered");
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, config);
        Ok(())
    }

    pub fn route_config(&self, route: &str) -> Option<RouteConfig> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route)
            .cloned()
    }

    pub fn route_names(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Resolves `route` and runs `handler` once against the chosen service.
    ///
    /// Handler errors are returned unchanged. Router errors
    /// ([`Error::RouteNotConfigured`], or a chosen candidate with no bound
    /// implementation) are converted into `E`.
    pub async fn route_request<T, E, F, Fut>(
        &self,
        route: &str,
        handler: F,
    ) -> std::result::Result<Routed<T>, E>
    where
        F: FnOnce(ServiceHandle<S>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let started = Instant::now();
        let config = self.route_config(route).ok_or_else(|| {
            tracing::warn!(route, "request for unconfigured route");
            Error::RouteNotConfigured {
                route: route.to_string(),
            }
        })?;

        let mut waited_for_primary = false;
        if let Some(primary) = config.primary() {
            if !config.ready_timeout.is_zero() && !self.tracker.is_ready(primary) {
                waited_for_primary = true;
                self.tracker
                    .wait_until_ready(primary, config.ready_timeout)
                    .await;
            }
        }

        let (index, chosen) = self.choose(&config).ok_or_else(|| Error::RouteNotConfigured {
            route: route.to_string(),
        })?;
        let handle = self.service(chosen).ok_or_else(|| {
            Error::configuration_with_context(
                format!("route '{}' chose '{}' but no service is bound", route, chosen),
                ErrorContext::new()
                    .with_field_path(format!("routes.{}.candidates", route))
                    .with_source("capability_router"),
            )
        })?;

        let routing = RouteDecision {
            route_name: route.to_string(),
            chosen_service: handle.name.clone(),
            chosen_kind: handle.kind,
            used_fallback: index > 0,
            decision_latency: started.elapsed(),
            waited_for_primary,
        };
        if routing.used_fallback {
            tracing::info!(
                route,
                service = %routing.chosen_service,
                kind = %routing.chosen_kind,
                waited_for_primary,
                "routing to fallback"
            );
        } else {
            tracing::debug!(
                route,
                service = %routing.chosen_service,
                latency_us = routing.decision_latency.as_micros() as u64,
                "routing to primary"
            );
        }

        let value = handler(handle).await?;
        Ok(Routed { value, routing })
    }

    /// True when the primary candidate of `route` is ready.
    pub fn can_route_without_fallback(&self, route: &str) -> bool {
        self.route_config(route)
            .and_then(|c| c.primary().map(|p| self.tracker.is_ready(p)))
            .unwrap_or(false)
    }

    pub fn route_status(&self, route: &str) -> Option<RouteStatus> {
        let config = self.route_config(route)?;
        Some(self.status_of(route, &config))
    }

    pub fn route_statuses(&self) -> Vec<RouteStatus> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .map(|(name, config)| self.status_of(name, config))
            .collect()
    }

    fn status_of(&self, route: &str, config: &RouteConfig) -> RouteStatus {
        let ready_candidates: Vec<String> = config
            .candidates
            .iter()
            .filter(|c| self.tracker.is_ready(c))
            .cloned()
            .collect();
        RouteStatus {
            route_name: route.to_string(),
            candidates: config.candidates.clone(),
            primary_ready: config
                .primary()
                .map(|p| self.tracker.is_ready(p))
                .unwrap_or(false),
            would_choose: self
                .choose(config)
                .map(|(_, name)| name.to_string())
                .unwrap_or_default(),
            ready_candidates,
        }
    }

    /// First ready candidate, else the last one.
    fn choose<'a>(&self, config: &'a RouteConfig) -> Option<(usize, &'a str)> {
        let last = config.candidates.len().checked_sub(1)?;
        let index = config
            .candidates
            .iter()
            .position(|c| self.tracker.is_ready(c))
            .unwrap_or(last);
        Some((index, config.candidates[index].as_str()))
    }
}

impl<S: ?Sized> std::fmt::Debug for CapabilityRouter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("routes", &self.route_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ManagedService, PassthroughService, ServiceTier};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup(names: &[&str]) -> (Arc<ReadinessTracker>, CapabilityRouter<dyn ManagedService>) {
        let tracker = Arc::new(ReadinessTracker::new());
        let router = CapabilityRouter::<dyn ManagedService>::new(Arc::clone(&tracker));
        for name in names {
            tracker.register(*name, ServiceTier::auxiliary()).unwrap();
            let svc: Arc<dyn ManagedService> = Arc::new(PassthroughService::new(*name));
            let kind = if *name == "basic" {
                ServiceKind::Passthrough
            } else {
                ServiceKind::AiOrchestration
            };
            router.bind_service(*name, kind, svc);
        }
        (tracker, router)
    }

    async fn chosen(router: &CapabilityRouter<dyn ManagedService>, route: &str) -> RouteDecision {
        router
            .route_request(route, |h| async move { Ok::<_, Error>(h.name) })
            .await
            .unwrap()
            .routing
    }

    #[test]
    fn test_empty_candidates_rejected() {
        let (_, router) = setup(&[]);
        let err = router
            .register_route("chat", RouteConfig::new(Vec::<String>::new()))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(router.route_config("chat").is_none());
    }

    #[tokio::test]
    async fn test_fallback_to_first_ready_candidate() {
        let (tracker, router) = setup(&["A", "B", "C"]);
        router
            .register_route("r", RouteConfig::new(["A", "B", "C"]))
            .unwrap();
        let _ = tracker.mark_ready("B", Duration::from_millis(1));
        let _ = tracker.mark_ready("C", Duration::from_millis(1));

        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "B");
        assert!(decision.used_fallback);
        assert!(!decision.waited_for_primary);
    }

    #[tokio::test]
    async fn test_nothing_ready_uses_last_candidate() {
        let (_, router) = setup(&["A", "basic"]);
        router
            .register_route("r", RouteConfig::new(["A", "basic"]))
            .unwrap();
        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "basic");
        assert_eq!(decision.chosen_kind, ServiceKind::Passthrough);
        assert!(decision.used_fallback);
    }

    #[tokio::test]
    async fn test_primary_ready_is_not_fallback() {
        let (tracker, router) = setup(&["A", "basic"]);
        router
            .register_route("r", RouteConfig::new(["A", "basic"]))
            .unwrap();
        let _ = tracker.mark_ready("A", Duration::from_millis(1));
        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "A");
        assert!(!decision.used_fallback);
        assert!(router.can_route_without_fallback("r"));
    }

    #[tokio::test]
    async fn test_single_candidate_route() {
        let (_, router) = setup(&["basic"]);
        router.register_route("r", RouteConfig::new(["basic"])).unwrap();
        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "basic");
        assert!(!decision.used_fallback);
    }

    #[tokio::test]
    async fn test_unknown_route_never_invokes_handler() {
        let (_, router) = setup(&["A"]);
        let calls = AtomicU32::new(0);
        let err = router
            .route_request("nope", |_h| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RouteNotConfigured { ref route } if route == "nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!router.can_route_without_fallback("nope"));
    }

    #[derive(Debug)]
    enum HandlerError {
        Upstream(u16),
        Router(String),
    }

    impl From<Error> for HandlerError {
        fn from(e: Error) -> Self {
            HandlerError::Router(e.to_string())
        }
    }

    #[tokio::test]
    async fn test_handler_error_propagates_unchanged() {
        let (tracker, router) = setup(&["A", "basic"]);
        router
            .register_route("r", RouteConfig::new(["A", "basic"]))
            .unwrap();
        let _ = tracker.mark_ready("A", Duration::ZERO);

        let err = router
            .route_request("r", |_h| async { Err::<(), _>(HandlerError::Upstream(429)) })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Upstream(429)));

        let err = router
            .route_request("missing", |_h| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Router(msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn test_unbound_candidate_is_configuration_error() {
        let tracker = Arc::new(ReadinessTracker::new());
        let router = CapabilityRouter::<dyn ManagedService>::new(Arc::clone(&tracker));
        router.register_route("r", RouteConfig::new(["ghost"])).unwrap();
        let err = router
            .route_request("r", |_h| async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_waits_for_primary() {
        let (tracker, router) = setup(&["A", "basic"]);
        router
            .register_route(
                "r",
                RouteConfig::new(["A", "basic"]).with_ready_timeout(Duration::from_millis(500)),
            )
            .unwrap();

        let t = Arc::clone(&tracker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = t.mark_ready("A", Duration::from_millis(100));
        });

        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "A");
        assert!(decision.waited_for_primary);
        assert!(!decision.used_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_expires_into_fallback() {
        let (_, router) = setup(&["A", "basic"]);
        router
            .register_route(
                "r",
                RouteConfig::new(["A", "basic"]).with_ready_timeout(Duration::from_millis(200)),
            )
            .unwrap();
        let decision = chosen(&router, "r").await;
        assert_eq!(decision.chosen_service, "basic");
        assert!(decision.waited_for_primary);
    }

    #[tokio::test]
    async fn test_route_statuses_have_no_side_effects() {
        let (tracker, router) = setup(&["A", "B", "basic"]);
        router
            .register_route("chat", RouteConfig::new(["A", "basic"]))
            .unwrap();
        router
            .register_route("plan", RouteConfig::new(["B", "basic"]))
            .unwrap();
        let _ = tracker.mark_ready("B", Duration::ZERO);

        let statuses = router.route_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].route_name, "chat");
        assert!(!statuses[0].primary_ready);
        assert_eq!(statuses[0].would_choose, "basic");
        assert!(statuses[1].primary_ready);
        assert_eq!(statuses[1].ready_candidates, vec!["B".to_string()]);
        assert!(!tracker.is_ready("A"));
    }
}
