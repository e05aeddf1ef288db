//! Batched event generation.
//!
//! Events are appended to an in-memory queue and delivered to the
//! [`EventBus`] in batches: as soon as `batch_size` events have arrived since
//! the last flush attempt, and otherwise every `flush_interval` from a
//! background task.
//!
//! Delivery is at-least-once. A flush drains the whole queue in one step and
//! publishes every drained event in parallel; if any publish fails the entire
//! drained batch is put back at the front of the queue in its original order
//! and retried on the next trigger. Events whose publish did succeed in that
//! batch will be delivered again, so subscribers must tolerate duplicates.
//!
//! An event whose own publish has failed more than `max_retries` times is
//! moved to the dead-letter list instead of being re-queued. The queue and the
//! dead-letter list each hold at most `max_queue_size` events; the oldest
//! entry is dropped first.
//!
//! Flushes are serialized. A re-queued batch is therefore always retried
//! before anything generated after it, which keeps per-key FIFO intact. A
//! size-triggered flush never waits for a running one: events generated while
//! a flush is in progress (including from inside a subscriber) are picked up
//! when that flush returns.

use super::bus::EventBus;
use super::types::{DiasEvent, EventCategory};
use crate::{Error, ErrorContext, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventGeneratorConfig {
    pub batch_size: usize,
    #[serde(rename = "flush_interval_ms", with = "crate::utils::time::duration_ms")]
    pub flush_interval: Duration,
    pub max_queue_size: usize,
    /// Failed publishes an event may retry before it is dead-lettered.
    pub max_retries: u32,
}

impl Default for EventGeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(5000),
            max_queue_size: 1000,
            max_retries: 3,
        }
    }
}

impl EventGeneratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_flush_interval(mut self, d: Duration) -> Self {
        self.flush_interval = d;
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}

/// Returned to the producer once the event is queued.
///
/// `success` is false only when the generator has been shut down and the
/// event was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub success: bool,
    pub event_id: String,
    #[serde(with = "crate::utils::time::duration_ms")]
    pub generation_time: Duration,
    pub category: EventCategory,
    pub event_type: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Delivered(usize),
    /// Some publish failed. `requeued` events went back to the queue and
    /// `dead_lettered` ran out of retries.
    Failed {
        requeued: usize,
        dead_lettered: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorStats {
    pub generated: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub requeued_events: u64,
    /// Dropped because the queue was full.
    pub dropped_events: u64,
    pub dead_lettered: u64,
}

/// An event that exhausted its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Arc<DiasEvent>,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: SystemTime,
}

struct Queued {
    event: Arc<DiasEvent>,
    failures: u32,
}

/// A batch taken off the queue for publishing. Dropped before
/// [`disarm`](Self::disarm) (the flush future was cancelled), it goes back to
/// the front of the queue.
struct DrainedBatch<'a> {
    queue: &'a Mutex<PendingQueue>,
    batch: Vec<Queued>,
}

impl DrainedBatch<'_> {
    fn disarm(mut self) -> Vec<Queued> {
        std::mem::take(&mut self.batch)
    }
}

impl Drop for DrainedBatch<'_> {
    fn drop(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        for queued in std::mem::take(&mut self.batch).into_iter().rev() {
            q.events.push_front(queued);
        }
    }
}

#[derive(Default)]
struct PendingQueue {
    events: VecDeque<Queued>,
    /// Events added since the last drain.
    fresh: usize,
}

pub struct EventGenerator {
    config: EventGeneratorConfig,
    bus: Arc<EventBus>,
    queue: Mutex<PendingQueue>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    flush_gate: tokio::sync::Mutex<()>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    stopped: AtomicBool,
    generated: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    requeued_events: AtomicU64,
    dropped_events: AtomicU64,
    dead_lettered: AtomicU64,
}

impl EventGenerator {
    pub fn new(bus: Arc<EventBus>, config: EventGeneratorConfig) -> Self {
        let config = EventGeneratorConfig {
            batch_size: config.batch_size.max(1),
            max_queue_size: config.max_queue_size.max(1),
            ..config
        };
        Self {
            config,
            bus,
            queue: Mutex::new(PendingQueue::default()),
            dead_letters: Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
            stopped: AtomicBool::new(false),
            generated: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            requeued_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EventGeneratorConfig {
        &self.config
    }

    pub async fn generate_system_event(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> GenerationResult {
        self.generate_event(EventCategory::System, event_type, source, payload)
            .await
    }

    pub async fn generate_analysis_event(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> GenerationResult {
        self.generate_event(EventCategory::Analysis, event_type, source, payload)
            .await
    }

    pub async fn generate_migration_event(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> GenerationResult {
        self.generate_event(EventCategory::Migration, event_type, source, payload)
            .await
    }

    pub async fn generate_event(
        &self,
        category: EventCategory,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> GenerationResult {
        self.enqueue(DiasEvent::new(category, event_type, source, payload))
            .await
    }

    /// Queues a pre-built event (e.g. one carrying a correlation id).
    ///
    /// Flushes inline once `batch_size` events have arrived since the last
    /// flush, unless a flush is already running. Delivery problems are handled
    /// by the flush and never reported here.
    pub async fn enqueue(&self, event: DiasEvent) -> GenerationResult {
        let started = Instant::now();
        let event = Arc::new(event);
        let mut result = GenerationResult {
            success: true,
            event_id: event.id.clone(),
            generation_time: Duration::ZERO,
            category: event.category,
            event_type: event.event_type.clone(),
            source: event.source.clone(),
        };

        if self.stopped.load(Ordering::SeqCst) {
            tracing::warn!(
                event_id = %result.event_id,
                event_type = %result.event_type,
                "event generator is shut down, event discarded"
            );
            result.success = false;
            result.generation_time = started.elapsed();
            return result;
        }

        let (queued, due, dropped) = {
            let mut q = self.lock_queue();
            let dropped = if q.events.len() >= self.config.max_queue_size {
                q.events.pop_front()
            } else {
                None
            };
            q.events.push_back(Queued {
                event,
                failures: 0,
            });
            q.fresh += 1;
            (q.events.len(), q.fresh >= self.config.batch_size, dropped)
        };
        self.generated.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = dropped {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dropped_event_id = %old.event.id,
                max_queue_size = self.config.max_queue_size,
                "event queue full, dropped oldest event"
            );
        }
        tracing::debug!(event_id = %result.event_id, queued, "event queued");

        result.generation_time = started.elapsed();
        if due {
            self.flush_while_due().await;
        }
        result
    }

    /// Drains the queue and publishes the batch, waiting for a running flush first.
    pub async fn flush_events(&self) -> FlushOutcome {
        let outcome = {
            let _serial = self.flush_gate.lock().await;
            self.flush_locked().await
        };
        if self.size_due() {
            self.flush_while_due().await;
        }
        outcome
    }

    /// Size-triggered flushing. Returns immediately if another flush holds
    /// the gate; that flush re-checks the threshold after releasing it.
    async fn flush_while_due(&self) {
        loop {
            let Ok(serial) = self.flush_gate.try_lock() else {
                return;
            };
            let _ = self.flush_locked().await;
            drop(serial);
            if !self.size_due() {
                return;
            }
        }
    }

    fn size_due(&self) -> bool {
        self.lock_queue().fresh >= self.config.batch_size
    }

    /// Must be called with `flush_gate` held.
    async fn flush_locked(&self) -> FlushOutcome {
        let drained = {
            let mut q = self.lock_queue();
            q.fresh = 0;
            DrainedBatch {
                queue: &self.queue,
                batch: std::mem::take(&mut q.events).into(),
            }
        };
        if drained.batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let events: Vec<Arc<DiasEvent>> = drained
            .batch
            .iter()
            .map(|q| Arc::clone(&q.event))
            .collect();
        let results = join_all(
            events
                .iter()
                .map(|e| self.bus.publish(e.category, &e.source, Arc::clone(e))),
        )
        .await;
        let batch = drained.disarm();
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed == 0 {
            tracing::debug!(count = batch.len(), "flushed events");
            return FlushOutcome::Delivered(batch.len());
        }

        if let Some(Err(first)) = results.iter().find(|r| r.is_err()) {
            tracing::warn!(
                count = batch.len(),
                failed,
                error = %first,
                "event flush failed, re-queueing batch"
            );
        }

        let mut requeue = Vec::with_capacity(batch.len());
        let mut expired = Vec::new();
        for (mut queued, result) in batch.into_iter().zip(results) {
            match result {
                Err(e) => {
                    queued.failures += 1;
                    if queued.failures > self.config.max_retries {
                        expired.push(DeadLetter {
                            event: queued.event,
                            attempts: queued.failures,
                            reason: e.to_string(),
                            failed_at: SystemTime::now(),
                        });
                    } else {
                        requeue.push(queued);
                    }
                }
                Ok(()) => requeue.push(queued),
            }
        }

        let requeued = requeue.len();
        let dropped = {
            let mut q = self.lock_queue();
            for queued in requeue.into_iter().rev() {
                q.events.push_front(queued);
            }
            let mut dropped = 0u64;
            while q.events.len() > self.config.max_queue_size {
                q.events.pop_front();
                dropped += 1;
            }
            dropped
        };
        if dropped > 0 {
            self.dropped_events.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(
                dropped,
                max_queue_size = self.config.max_queue_size,
                "event queue full after re-queue, dropped oldest events"
            );
        }

        let dead_lettered = expired.len();
        if dead_lettered > 0 {
            for letter in &expired {
                tracing::error!(
                    event_id = %letter.event.id,
                    attempts = letter.attempts,
                    reason = %letter.reason,
                    "event dead-lettered"
                );
            }
            let mut dead = self
                .dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            dead.extend(expired);
            while dead.len() > self.config.max_queue_size {
                dead.pop_front();
            }
            self.dead_lettered
                .fetch_add(dead_lettered as u64, Ordering::Relaxed);
        }

        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        self.requeued_events
            .fetch_add(requeued as u64, Ordering::Relaxed);
        FlushOutcome::Failed {
            requeued,
            dead_lettered,
        }
    }

    /// Starts the periodic flush task. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::runtime_with_context(
                "event generator has been shut down",
                ErrorContext::new().with_source("event_generator"),
            ));
        }
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // the first tick of an interval completes immediately
            ticks.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        let Some(generator) = weak.upgrade() else { break };
                        let _ = generator.flush_events().await;
                    }
                }
            }
        });
        *timer = Some((token, handle));
        tracing::info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = period.as_millis() as u64,
            max_queue_size = self.config.max_queue_size,
            "event generator started"
        );
        Ok(())
    }

    /// Stops accepting events, stops the timer, then flushes what is left.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.stopped.store(true, Ordering::SeqCst);
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = timer {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "event flush task ended abnormally");
            }
        }
        let outcome = self.flush_events().await;
        tracing::info!(pending = self.queue_len(), ?outcome, "event generator stopped");
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_queue().events.len()
    }

    /// Snapshot of queued events in delivery order.
    pub fn pending(&self) -> Vec<Arc<DiasEvent>> {
        self.lock_queue()
            .events
            .iter()
            .map(|q| Arc::clone(&q.event))
            .collect()
    }

    /// Snapshot of dead-lettered events, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Empties the dead-letter list and returns what it held.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        let mut dead = self
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *dead).into()
    }

    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            generated: self.generated.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            requeued_events: self.requeued_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventGenerator {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some((token, _)) = timer.take() {
                token.cancel();
            }
        }
    }
}
