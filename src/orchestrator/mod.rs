//! Process-wide wiring of the orchestration components.
//!
//! One [`OrchestrationContext`] is built at startup and shared by `Arc`. It
//! owns the readiness tracker, the capability router, the event bus and the
//! event generator, and drives every registered [`ManagedService`] through its
//! lifecycle:
//!
//! 1. `register_service` records the service as `initializing`, binds it into
//!    the router and starts `initialize()` in the background. Requests routed
//!    in the meantime fall back to other candidates.
//! 2. Each attempt runs under `init_timeout` and is retried with the
//!    configured [`RetryPolicyConfig`](crate::retry::RetryPolicyConfig).
//!    Outcomes are published as `service.ready` / `service.failed` system
//!    events from source [`EVENT_SOURCE`].
//! 3. After [`start`](OrchestrationContext::start), a health pass runs every
//!    `health_check_interval`. A ready service that fails its probe is marked
//!    failed and re-initialized; a failed service with no attempt in flight
//!    is re-initialized.
//! 4. [`shutdown`](OrchestrationContext::shutdown) stops the health loop,
//!    cancels pending initializations, runs `cleanup()` everywhere and drains
//!    the event queue last.

use crate::config::OrchestratorConfig;
use crate::events::{EventBus, EventGenerator, FlushOutcome};
use crate::health::HealthReport;
use crate::readiness::{ReadinessTracker, ServiceStatus, SystemStatus};
use crate::retry::RetryPolicy;
use crate::router::{CapabilityRouter, RouteConfig, Routed, ServiceHandle};
use crate::services::{ManagedService, ServiceTier};
use crate::utils::time::duration_millis;
use crate::{Error, ErrorContext, Result};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source key of lifecycle events on the bus (category `system`).
pub const EVENT_SOURCE: &str = "orchestrator";

struct Managed<S: ?Sized> {
    name: String,
    service: Arc<S>,
    retry: RetryPolicy,
    initializing: AtomicBool,
}

pub struct OrchestrationContext<S: ?Sized + ManagedService + 'static> {
    config: OrchestratorConfig,
    tracker: Arc<ReadinessTracker>,
    bus: Arc<EventBus>,
    generator: Arc<EventGenerator>,
    router: CapabilityRouter<S>,
    managed: RwLock<BTreeMap<String, Arc<Managed<S>>>>,
    health_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    lifecycle: CancellationToken,
}

impl<S: ?Sized + ManagedService + 'static> OrchestrationContext<S> {
    /// Builds the components and registers every route declared in `config`.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(ReadinessTracker::new());
        let bus = Arc::new(EventBus::with_buffer_limit(config.events.max_queue_size));
        let generator = Arc::new(EventGenerator::new(
            Arc::clone(&bus),
            config.events.clone(),
        ));
        let router = CapabilityRouter::new(Arc::clone(&tracker));
        for (name, route) in &config.routes {
            router.register_route(name.clone(), route.clone())?;
        }
        Ok(Self {
            config,
            tracker,
            bus,
            generator,
            router,
            managed: RwLock::new(BTreeMap::new()),
            health_task: Mutex::new(None),
            lifecycle: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ReadinessTracker> {
        &self.tracker
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn generator(&self) -> &Arc<EventGenerator> {
        &self.generator
    }

    pub fn router(&self) -> &CapabilityRouter<S> {
        &self.router
    }

    /// Registers `service` and starts initializing it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_service(&self, tier: ServiceTier, service: Arc<S>) -> Result<()> {
        let name = service.name().to_string();
        self.tracker.register(name.clone(), tier)?;
        self.router
            .bind_service(name.clone(), service.kind(), Arc::clone(&service));

        let managed = Arc::new(Managed {
            name: name.clone(),
            service,
            retry: RetryPolicy::new(self.config.retry.clone()),
            initializing: AtomicBool::new(false),
        });
        self.managed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::clone(&managed));
        self.spawn_initialization(managed);
        Ok(())
    }

    /// Registers a service using the tier declared for its name in the config.
    pub fn register_declared(&self, service: Arc<S>) -> Result<()> {
        let tier = self
            .config
            .service(service.name())
            .map(|s| s.tier())
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("service '{}' is not declared", service.name()),
                    ErrorContext::new()
                        .with_field_path("services")
                        .with_source("orchestration_context"),
                )
            })?;
        self.register_service(tier, service)
    }

    pub fn register_route(&self, name: impl Into<String>, config: RouteConfig) -> Result<()> {
        self.router.register_route(name, config)
    }

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
        self.router.route_request(route, handler).await
    }

    pub fn system_status(&self) -> SystemStatus {
        self.tracker.get_system_status()
    }

    pub fn health_report(&self) -> HealthReport {
        let routes = self
            .router
            .route_names()
            .into_iter()
            .map(|name| {
                let ok = self.router.can_route_without_fallback(&name);
                (name, ok)
            })
            .collect();
        HealthReport::from_status(&self.tracker.get_system_status(), routes)
    }

    /// Waits for basic readiness, by default up to `basic_ready_timeout`.
    pub async fn wait_for_basic(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(self.config.basic_ready_timeout);
        let ready = self.tracker.wait_for_basic(timeout).await;
        if !ready {
            tracing::warn!(
                timeout_ms = duration_millis(timeout),
                "basic services not ready, continuing in fallback mode"
            );
        }
        ready
    }

    /// Starts the event flush timer and the periodic health pass.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.lifecycle.is_cancelled() {
            return Err(Error::runtime_with_context(
                "orchestration context has been shut down",
                ErrorContext::new().with_source("orchestration_context"),
            ));
        }
        self.generator.start()?;

        let mut slot = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let token = self.lifecycle.child_token();
        let cancel = token.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        let Some(ctx) = weak.upgrade() else { break };
                        ctx.run_health_checks().await;
                    }
                }
            }
        });
        *slot = Some((token, handle));
        tracing::info!(
            interval_ms = duration_millis(period),
            "orchestration context started"
        );
        Ok(())
    }

    /// One health pass. Returns the services that were sent back to initialization.
    pub async fn run_health_checks(&self) -> Vec<String> {
        let services: Vec<Arc<Managed<S>>> = self
            .managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut restarted = Vec::new();
        for m in services {
            match self.tracker.get_status(&m.name).map(|d| d.status) {
                Some(ServiceStatus::Ready) => {
                    if m.service.health_check().await {
                        self.tracker.record_check(&m.name);
                        continue;
                    }
                    tracing::warn!(service = %m.name, "health check failed");
                    let _ = self.tracker.mark_initializing(&m.name);
                    let _ = self.tracker.mark_failed(&m.name, "health check failed");
                    self.generator
                        .generate_system_event(
                            "service.unhealthy",
                            EVENT_SOURCE,
                            json!({ "service": m.name }),
                        )
                        .await;
                }
                Some(ServiceStatus::Failed) if !m.initializing.load(Ordering::SeqCst) => {
                    tracing::info!(service = %m.name, "retrying failed service");
                }
                _ => continue,
            }
            restarted.push(m.name.clone());
            self.spawn_initialization(m);
        }
        restarted
    }

    /// Stops background work, cleans up every service, then drains events.
    pub async fn shutdown(&self) -> FlushOutcome {
        let health = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = health {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health task ended abnormally");
            }
        }
        self.lifecycle.cancel();

        let services: Vec<Arc<Managed<S>>> = self
            .managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let results = join_all(
            services
                .iter()
                .map(|m| async move { (m.name.as_str(), m.service.cleanup().await) }),
        )
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                tracing::warn!(service = name, error = %e, "service cleanup failed");
            }
        }

        let outcome = self.generator.shutdown().await;
        tracing::info!(?outcome, "orchestration context stopped");
        outcome
    }

    fn spawn_initialization(&self, managed: Arc<Managed<S>>) {
        if managed.initializing.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = Arc::clone(&self.tracker);
        let generator = Arc::clone(&self.generator);
        let timeout = self.config.init_timeout;
        let cancel = self.lifecycle.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(service = %managed.name, "initialization cancelled");
                }
                outcome = managed.retry.execute(|| {
                    initialize_once(&managed, &tracker, &generator, timeout)
                }) => {
                    // on success the flag was cleared when the service went ready
                    if let Err(e) = outcome {
                        tracing::error!(
                            service = %managed.name,
                            error = %e,
                            "service did not come up"
                        );
                        managed.initializing.store(false, Ordering::SeqCst);
                    }
                    return;
                }
            }
            managed.initializing.store(false, Ordering::SeqCst);
        });
    }
}

async fn initialize_once<S: ?Sized + ManagedService>(
    managed: &Managed<S>,
    tracker: &ReadinessTracker,
    generator: &EventGenerator,
    timeout: Duration,
) -> Result<()> {
    let _ = tracker.mark_initializing(&managed.name);
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, managed.service.initialize()).await {
        Ok(result) => result,
        Err(_) => Err(Error::InitializationTimeout {
            service: managed.name.clone(),
            timeout_ms: duration_millis(timeout),
        }),
    };

    match result {
        Ok(()) => {
            let took = started.elapsed();
            let _ = tracker.mark_ready(&managed.name, took);
            // a health pass may fail the service while the event below is queued
            managed.initializing.store(false, Ordering::SeqCst);
            generator
                .generate_system_event(
                    "service.ready",
                    EVENT_SOURCE,
                    json!({ "service": managed.name, "initMs": duration_millis(took) }),
                )
                .await;
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            let _ = tracker.mark_failed(&managed.name, message.clone());
            generator
                .generate_system_event(
                    "service.failed",
                    EVENT_SOURCE,
                    json!({ "service": managed.name, "error": message }),
                )
                .await;
            Err(e)
        }
    }
}

impl<S: ?Sized + ManagedService + 'static> Drop for OrchestrationContext<S> {
    fn drop(&mut self) {
        self.lifecycle.cancel();
    }
}

impl<S: ?Sized + ManagedService + 'static> std::fmt::Debug for OrchestrationContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("tracker", &self.tracker)
            .field("router", &self.router)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCategory;
    use crate::retry::{BackoffStrategy, RetryPolicyConfig};
    use crate::services::ServiceKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct TestService {
        name: &'static str,
        delay: Duration,
        failures_left: AtomicU32,
        healthy: AtomicBool,
        cleaned: AtomicBool,
    }

    impl TestService {
        fn new(name: &'static str, delay_ms: u64) -> Arc<Self> {
            Self::failing(name, delay_ms, 0)
        }

        fn failing(name: &'static str, delay_ms: u64, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                failures_left: AtomicU32::new(failures),
                healthy: AtomicBool::new(true),
                cleaned: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ManagedService for TestService {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ServiceKind {
            ServiceKind::AiOrchestration
        }

        async fn initialize(&self) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::runtime("database unreachable"));
            }
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn config(max_retries: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicyConfig::new()
                .with_max_retries(max_retries)
                .with_backoff(BackoffStrategy::Fixed)
                .with_base_delay(Duration::from_millis(100)),
            init_timeout: Duration::from_millis(1000),
            ..OrchestratorConfig::default()
        }
    }

    type Ctx = OrchestrationContext<dyn ManagedService>;

    #[tokio::test(start_paused = true)]
    async fn test_staged_initialization() {
        let ctx = Ctx::new(config(0)).unwrap();
        ctx.register_service(ServiceTier::basic(), TestService::new("ai-client", 100))
            .unwrap();
        ctx.register_service(ServiceTier::enhanced(), TestService::new("dias", 800))
            .unwrap();

        assert!(ctx.wait_for_basic(None).await);
        let status = ctx.system_status();
        assert!(status.basic_ready);
        assert!(!status.enhanced_ready);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(ctx.system_status().enhanced_ready);
        let d = ctx.tracker().get_status("dias").unwrap();
        assert!(d.init_duration.unwrap() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_init_is_retried_and_reported() {
        let ctx = Ctx::new(config(3)).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        ctx.bus()
            .subscribe_fn(EventCategory::System, EVENT_SOURCE, "test", move |e| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(e.event_type.clone());
                    Ok(())
                }
            })
            .await;

        ctx.register_service(ServiceTier::basic(), TestService::failing("tasks", 10, 2))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let d = ctx.tracker().get_status("tasks").unwrap();
        assert_eq!(d.status, ServiceStatus::Ready);
        assert_eq!(d.attempt, 3);

        ctx.generator().flush_events().await;
        assert_eq!(
            *events.lock().unwrap(),
            vec!["service.failed", "service.failed", "service.ready"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_marks_failed() {
        let ctx = Ctx::new(config(0)).unwrap();
        ctx.register_service(ServiceTier::basic(), TestService::new("slow", 5000))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let d = ctx.tracker().get_status("slow").unwrap();
        assert_eq!(d.status, ServiceStatus::Failed);
        assert!(d.error.unwrap().contains("timed out after 1000ms"));
        assert!(!ctx.wait_for_basic(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_service_is_reinitialized() {
        let ctx = Ctx::new(config(0)).unwrap();
        let svc = TestService::new("ai-client", 10);
        ctx.register_service(ServiceTier::basic(), svc.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.tracker().is_ready("ai-client"));

        svc.healthy.store(false, Ordering::SeqCst);
        assert_eq!(ctx.run_health_checks().await, vec!["ai-client".to_string()]);
        assert!(!ctx.tracker().is_ready("ai-client"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.tracker().is_ready("ai-client"));
        svc.healthy.store(true, Ordering::SeqCst);
        assert!(ctx.run_health_checks().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_while_ready_event_is_being_delivered() {
        let mut cfg = config(0);
        cfg.events = cfg.events.with_batch_size(1);
        let ctx = Ctx::new(cfg).unwrap();

        // the first service.ready delivery stalls until released
        let release = Arc::new(tokio::sync::Notify::new());
        let stalled = Arc::new(AtomicBool::new(false));
        let (r, st) = (Arc::clone(&release), Arc::clone(&stalled));
        ctx.bus()
            .subscribe_fn(EventCategory::System, EVENT_SOURCE, "slow-dashboard", move |e| {
                let (r, st) = (Arc::clone(&r), Arc::clone(&st));
                async move {
                    if e.event_type == "service.ready" && !st.swap(true, Ordering::SeqCst) {
                        r.notified().await;
                    }
                    Ok(())
                }
            })
            .await;

        let svc = TestService::new("ai-client", 10);
        ctx.register_service(ServiceTier::basic(), svc.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.tracker().is_ready("ai-client"));
        assert!(stalled.load(Ordering::SeqCst));

        svc.healthy.store(false, Ordering::SeqCst);
        assert_eq!(ctx.run_health_checks().await, vec!["ai-client".to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.tracker().is_ready("ai-client"));

        release.notify_one();
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_service_retried_by_health_pass() {
        let ctx = Ctx::new(config(0)).unwrap();
        ctx.register_service(ServiceTier::basic(), TestService::failing("dias", 10, 1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ctx.tracker().get_status("dias").unwrap().status,
            ServiceStatus::Failed
        );

        assert_eq!(ctx.run_health_checks().await, vec!["dias".to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.tracker().is_ready("dias"));
    }

    #[tokio::test]
    async fn test_register_declared_requires_declaration() {
        let ctx = Ctx::new(config(0)).unwrap();
        let err = ctx
            .register_declared(TestService::new("ghost", 0))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(!ctx.tracker().contains("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cleans_up_and_drains() {
        let ctx = Arc::new(Ctx::new(config(0)).unwrap());
        let svc = TestService::new("ai-client", 10);
        ctx.register_service(ServiceTier::basic(), svc.clone()).unwrap();
        ctx.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.generator().queue_len(), 1);

        assert_eq!(ctx.shutdown().await, FlushOutcome::Delivered(1));
        assert!(svc.cleaned.load(Ordering::SeqCst));
        assert!(ctx.start().is_err());
    }
}
