//! Staged readiness tracking.
//!
//! The [`ReadinessTracker`] owns one [`ServiceDescriptor`] per named service
//! and answers two questions for the rest of the system: "is service X ready
//! right now?" and "is the system ready enough for basic / enhanced
//! operation?".
//!
//! ## Consistency
//!
//! Descriptors live in an [`ArcSwap`]-published map. Readers load the current
//! snapshot without locking and can never observe a half-written descriptor.
//! Writers serialize on a single mutex, so transitions for a given name are
//! totally ordered.
//!
//! ## Waiting
//!
//! Every applied transition bumps a [`tokio::sync::watch`] generation counter.
//! [`ReadinessTracker::wait_for_basic`] and [`ReadinessTracker::wait_until_ready`]
//! park on that channel instead of polling. Giving up on a wait does not cancel
//! anything: a late `mark_ready` still lands and is visible to later requests.

use crate::services::ServiceTier;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

mod descriptor;

pub use descriptor::{ServiceDescriptor, ServiceStatus, SystemStatus, Transition};

type DescriptorMap = BTreeMap<String, Arc<ServiceDescriptor>>;

pub struct ReadinessTracker {
    descriptors: ArcSwap<DescriptorMap>,
    write_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        let (changes, _rx) = watch::channel(0u64);
        Self {
            descriptors: ArcSwap::from_pointee(BTreeMap::new()),
            write_lock: Mutex::new(()),
            changes,
        }
    }

    /// Adds `name` in `initializing` state.
    ///
    /// Registering an existing name with the same tier resets it to a fresh
    /// `initializing` descriptor; a different tier is a configuration error.
    pub fn register(&self, name: impl Into<String>, tier: ServiceTier) -> Result<()> {
        let name = name.into();
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.descriptors.load();
        if let Some(existing) = current.get(&name) {
            if existing.tier != tier {
                return Err(Error::configuration_with_context(
                    format!("service '{}' is already registered with a different tier", name),
                    ErrorContext::new()
                        .with_details(format!(
                            "existing: {:?}, requested: {:?}",
                            existing.tier, tier
                        ))
                        .with_source("readiness_tracker"),
                ));
            }
            tracing::info!(service = %name, "re-registering service, state reset");
        } else {
            tracing::info!(service = %name, ?tier, "registered service");
        }
        let mut next = (**current).clone();
        next.insert(
            name.clone(),
            Arc::new(ServiceDescriptor::initializing(name, tier)),
        );
        self.publish(next);
        Ok(())
    }

    /// Starts a new attempt for a `ready` or `failed` service.
    pub fn mark_initializing(&self, name: &str) -> Transition {
        self.transition(name, ServiceStatus::Initializing, |d| {
            d.attempt = d.attempt.saturating_add(1);
            d.init_duration = None;
            d.error = None;
        })
    }

    pub fn mark_ready(&self, name: &str, init_duration: Duration) -> Transition {
        self.transition(name, ServiceStatus::Ready, |d| {
            d.init_duration = Some(init_duration);
            d.error = None;
        })
    }

    pub fn mark_failed(&self, name: &str, error: impl Into<String>) -> Transition {
        let error = error.into();
        self.transition(name, ServiceStatus::Failed, move |d| {
            d.error = Some(error);
        })
    }

    /// Refreshes `last_check` without changing status (successful health probe).
    pub fn record_check(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.descriptors.load();
        let Some(existing) = current.get(name) else {
            return false;
        };
        let mut updated = (**existing).clone();
        updated.last_check = SystemTime::now();
        let mut next = (**current).clone();
        next.insert(name.to_string(), Arc::new(updated));
        self.descriptors.store(Arc::new(next));
        true
    }

    pub fn get_status(&self, name: &str) -> Option<ServiceDescriptor> {
        self.descriptors.load().get(name).map(|d| (**d).clone())
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.descriptors
            .load()
            .get(name)
            .map(|d| d.is_ready())
            .unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.load().contains_key(name)
    }

    pub fn ready_services(&self) -> Vec<String> {
        self.descriptors
            .load()
            .values()
            .filter(|d| d.is_ready())
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate view computed from one consistent snapshot.
    ///
    /// `basic_ready`: every basic-required service is ready.
    /// `enhanced_ready`: every service required for basic or enhanced is ready.
    /// An empty tier is vacuously ready.
    pub fn get_system_status(&self) -> SystemStatus {
        let snapshot = self.descriptors.load();
        let mut basic_ready = true;
        let mut enhanced_ready = true;
        let mut services = Vec::with_capacity(snapshot.len());
        for d in snapshot.values() {
            if d.tier.required_for_basic && !d.is_ready() {
                basic_ready = false;
            }
            if d.tier.gates_enhanced() && !d.is_ready() {
                enhanced_ready = false;
            }
            services.push((**d).clone());
        }
        SystemStatus {
            services,
            basic_ready,
            enhanced_ready,
        }
    }

    /// Waits up to `timeout` for basic readiness. Returns the final answer.
    pub async fn wait_for_basic(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |t| t.get_system_status().basic_ready)
            .await
    }

    /// Waits up to `timeout` for `name` to become ready.
    pub async fn wait_until_ready(&self, name: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |t| t.is_ready(name)).await
    }

    async fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        // Subscribe before checking so no transition slips between check and park.
        let mut rx = self.changes.subscribe();
        if done(self) {
            return true;
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if done(self) {
                    return true;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(reached) => reached,
            Err(_) => done(self),
        }
    }

    fn transition<F>(&self, name: &str, to: ServiceStatus, apply: F) -> Transition
    where
        F: FnOnce(&mut ServiceDescriptor),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.descriptors.load();
        let Some(existing) = current.get(name) else {
            tracing::warn!(service = %name, to = %to, "transition for unknown service ignored");
            return Transition::UnknownService;
        };
        let from = existing.status;
        if from == to {
            return Transition::Unchanged(from);
        }
        if !from.can_become(to) {
            tracing::warn!(
                service = %name,
                from = %from,
                to = %to,
                "invalid readiness transition rejected"
            );
            return Transition::Rejected { from, to };
        }

        let mut updated = (**existing).clone();
        updated.status = to;
        updated.last_check = SystemTime::now();
        apply(&mut updated);
        match to {
            ServiceStatus::Ready => tracing::info!(
                service = %name,
                init_ms = updated.init_duration.map(|d| d.as_millis() as u64),
                "service ready"
            ),
            ServiceStatus::Failed => tracing::warn!(
                service = %name,
                error = updated.error.as_deref().unwrap_or(""),
                "service failed"
            ),
            ServiceStatus::Initializing => tracing::info!(
                service = %name,
                attempt = updated.attempt,
                "service initializing"
            ),
        }

        let mut next = (**current).clone();
        next.insert(name.to_string(), Arc::new(updated));
        self.publish(next);
        Transition::Applied { from, to }
    }

    fn publish(&self, next: DescriptorMap) {
        self.descriptors.store(Arc::new(next));
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadinessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessTracker")
            .field("services", &self.descriptors.load().keys().collect::<Vec<_>>())
            .finish()
    }
}
