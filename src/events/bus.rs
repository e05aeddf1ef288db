//! Publish/subscribe channel keyed by `(category, source)`.
//!
//! ## Rules
//! - A subscriber receives exactly the events published under the key it
//!   subscribed to and accepted by its filter, if it has one. The origin tag
//!   is for diagnostics only.
//! - Delivery to the subscribers of one event runs concurrently; their
//!   relative order is unspecified.
//! - Publishes to the same key are delivered in the order `publish` was
//!   called: each key owns a fair async lane that a publish holds for the
//!   duration of its fan-out. No ordering is promised across keys.
//! - A publish fails if any subscriber fails. Successful subscribers are not
//!   rolled back, so a retried publish may reach them twice.
//! - Events published to a key nobody subscribes to are buffered, up to
//!   `buffer_limit` per key with the oldest dropped first, and replayed in
//!   order to the next subscriber of that key before any later publish.
//!
//! A subscriber must not publish or subscribe to its own key from inside
//! `on_event`: the key's lane is held for the whole delivery.

use super::types::{DiasEvent, EventCategory};
use crate::error::DeliveryFailure;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Per-key buffer size used by [`EventBus::new`].
pub const DEFAULT_BUFFER_LIMIT: usize = 1000;

/// Receiver side of the bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: Arc<DiasEvent>) -> Result<()>;
}

/// Predicate a subscription applies before delivery.
pub type EventFilter = Arc<dyn Fn(&DiasEvent) -> bool + Send + Sync>;

struct FnSubscriber<F>(F);

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(Arc<DiasEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: Arc<DiasEvent>) -> Result<()> {
        (self.0)(event).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub filtered: u64,
    pub buffered: u64,
    /// Buffered events dropped because their key's buffer was full.
    pub dropped: u64,
    pub replayed: u64,
}

type Key = (EventCategory, String);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    origin: String,
    subscriber: Arc<dyn EventSubscriber>,
    filter: Option<EventFilter>,
}

pub struct EventBus {
    subscriptions: RwLock<HashMap<Key, Vec<Subscription>>>,
    lanes: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
    buffers: Mutex<HashMap<Key, VecDeque<Arc<DiasEvent>>>>,
    buffer_limit: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    filtered: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
    replayed: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_buffer_limit(DEFAULT_BUFFER_LIMIT)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limit of 0 disables buffering: events without subscribers are dropped.
    pub fn with_buffer_limit(buffer_limit: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            buffer_limit,
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
        }
    }

    /// Registers `subscriber` and replays anything buffered for the key.
    pub async fn subscribe(
        &self,
        category: EventCategory,
        source: impl Into<String>,
        origin: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        self.subscribe_with(category, source.into(), origin.into(), subscriber, None)
            .await
    }

    /// Like [`EventBus::subscribe`], delivering only events `filter` accepts.
    pub async fn subscribe_filtered<P>(
        &self,
        category: EventCategory,
        source: impl Into<String>,
        origin: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
        filter: P,
    ) -> SubscriptionId
    where
        P: Fn(&DiasEvent) -> bool + Send + Sync + 'static,
    {
        let filter: EventFilter = Arc::new(filter);
        self.subscribe_with(
            category,
            source.into(),
            origin.into(),
            subscriber,
            Some(filter),
        )
        .await
    }

    /// Closure form of [`EventBus::subscribe`].
    pub async fn subscribe_fn<F, Fut>(
        &self,
        category: EventCategory,
        source: impl Into<String>,
        origin: impl Into<String>,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(Arc<DiasEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(category, source, origin, Arc::new(FnSubscriber(callback)))
            .await
    }

    async fn subscribe_with(
        &self,
        category: EventCategory,
        source: String,
        origin: String,
        subscriber: Arc<dyn EventSubscriber>,
        filter: Option<EventFilter>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = (category, source);
        let lane = self.lane(&key);
        let _turn = lane.lock().await;

        let subscription = Subscription {
            id,
            origin,
            subscriber,
            filter,
        };
        tracing::info!(
            %category,
            source = %key.1,
            origin = %subscription.origin,
            "subscriber registered"
        );
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push(subscription.clone());

        let backlog = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .unwrap_or_default();
        if !backlog.is_empty() {
            tracing::info!(
                %category,
                source = %key.1,
                count = backlog.len(),
                "replaying buffered events"
            );
        }
        for event in backlog {
            self.replayed.fetch_add(1, Ordering::Relaxed);
            // failures are logged and counted by deliver
            let _ = self.deliver(&subscription, event).await;
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for ((category, source), list) in subs.iter_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                let removed = list.remove(pos);
                tracing::info!(%category, %source, origin = %removed.origin, "subscriber removed");
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, category: EventCategory, source: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, source.to_string()))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Events waiting for a first subscriber of `(category, source)`.
    pub fn buffered_len(&self, category: EventCategory, source: &str) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, source.to_string()))
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Delivers `event` to every subscriber of `(category, source)`.
    pub async fn publish(
        &self,
        category: EventCategory,
        source: &str,
        event: Arc<DiasEvent>,
    ) -> Result<()> {
        let key = (category, source.to_string());
        let lane = self.lane(&key);
        let _turn = lane.lock().await;

        self.published.fetch_add(1, Ordering::Relaxed);
        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            self.buffer(key, event);
            return Ok(());
        }

        let outcomes = join_all(targets.iter().map(|s| {
            let event = Arc::clone(&event);
            async move { (s, self.deliver(s, event).await) }
        }))
        .await;

        let failures: Vec<DeliveryFailure> = outcomes
            .into_iter()
            .filter_map(|(sub, outcome)| match outcome {
                Some(Err(e)) => Some(DeliveryFailure {
                    origin: sub.origin.clone(),
                    message: e.to_string(),
                }),
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::EventDelivery {
                event_id: event.id.clone(),
                failures,
            })
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }

    /// `None` when the subscription's filter skipped the event.
    async fn deliver(&self, sub: &Subscription, event: Arc<DiasEvent>) -> Option<Result<()>> {
        if let Some(filter) = &sub.filter {
            if !filter(&event) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        let outcome = sub.subscriber.on_event(Arc::clone(&event)).await;
        match &outcome {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.id,
                    origin = %sub.origin,
                    error = %e,
                    "subscriber rejected event"
                );
            }
        }
        Some(outcome)
    }

    /// Caller holds the key's lane.
    fn buffer(&self, key: Key, event: Arc<DiasEvent>) {
        if self.buffer_limit == 0 {
            tracing::debug!(
                event_id = %event.id,
                category = %key.0,
                source = %key.1,
                "no subscribers for event"
            );
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers.entry(key).or_default();
        if buffer.len() >= self.buffer_limit {
            if let Some(old) = buffer.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dropped_event_id = %old.id,
                    buffer_limit = self.buffer_limit,
                    "event buffer full, dropped oldest event"
                );
            }
        }
        tracing::debug!(event_id = %event.id, buffered = buffer.len() + 1, "event buffered");
        buffer.push_back(event);
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    fn lane(&self, key: &Key) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry(key.clone()).or_default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer_limit", &self.buffer_limit)
            .field("stats", &self.stats())
            .finish()
    }
}
