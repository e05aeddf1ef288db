//! Batched event delivery through the generator and bus

use async_trait::async_trait;
use serde_json::json;
use staged_orchestrator::events::{
    DiasEvent, EventBus, EventCategory, EventGenerator, EventGeneratorConfig, EventSubscriber,
    FlushOutcome,
};
use staged_orchestrator::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

/// Records event ids; rejects the first `reject` deliveries.
struct Dashboard {
    seen: Mutex<Vec<String>>,
    reject: AtomicU32,
}

impl Dashboard {
    fn new(reject: u32) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            reject: AtomicU32::new(reject),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSubscriber for Dashboard {
    async fn on_event(&self, event: Arc<DiasEvent>) -> staged_orchestrator::Result<()> {
        let rejected = self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::runtime("websocket not connected"));
        }
        self.seen.lock().unwrap().push(event.id.clone());
        Ok(())
    }
}

async fn setup(
    reject: u32,
    config: EventGeneratorConfig,
) -> (Arc<EventGenerator>, Arc<Dashboard>) {
    let bus = Arc::new(EventBus::new());
    let dashboard = Dashboard::new(reject);
    bus.subscribe(
        EventCategory::Analysis,
        "code-review",
        "dashboard",
        dashboard.clone(),
    )
    .await;
    (Arc::new(EventGenerator::new(bus, config)), dashboard)
}

#[tokio::test]
async fn test_tenth_event_flushes_batch() {
    let (generator, dashboard) = setup(0, EventGeneratorConfig::default()).await;
    let mut ids = Vec::new();
    for i in 0..10 {
        let r = generator
            .generate_analysis_event("finding", "code-review", json!({ "line": i }))
            .await;
        assert!(r.success);
        ids.push(r.event_id);
    }
    assert_eq!(generator.stats().flushes, 1);
    assert_eq!(dashboard.seen(), ids);
}

#[tokio::test]
async fn test_partial_failure_redelivers_whole_batch() {
    let (generator, dashboard) = setup(1, EventGeneratorConfig::new().with_batch_size(50)).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            generator
                .generate_analysis_event("finding", "code-review", json!({ "line": i }))
                .await
                .event_id,
        );
    }

    // first event rejected, the other two delivered
    assert_eq!(
        generator.flush_events().await,
        FlushOutcome::Failed {
            requeued: 3,
            dead_lettered: 0
        }
    );
    let pending: Vec<String> = generator.pending().iter().map(|e| e.id.clone()).collect();
    assert_eq!(pending, ids);
    assert_eq!(dashboard.seen(), ids[1..].to_vec());

    assert_eq!(generator.flush_events().await, FlushOutcome::Delivered(3));
    assert_eq!(generator.queue_len(), 0);
    // at-least-once: events 2 and 3 arrive twice
    let seen = dashboard.seen();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[2..], ids[..]);
}

#[tokio::test]
async fn test_requeued_batch_precedes_newer_events() {
    let (generator, dashboard) = setup(1, EventGeneratorConfig::new().with_batch_size(50)).await;
    let old = generator
        .generate_analysis_event("finding", "code-review", json!({}))
        .await
        .event_id;
    assert_eq!(
        generator.flush_events().await,
        FlushOutcome::Failed {
            requeued: 1,
            dead_lettered: 0
        }
    );

    let new = generator
        .enqueue(
            DiasEvent::new(EventCategory::Analysis, "finding", "code-review", json!({}))
                .with_correlation_id("req-7"),
        )
        .await
        .event_id;
    assert_eq!(generator.flush_events().await, FlushOutcome::Delivered(2));
    assert_eq!(dashboard.seen(), vec![old, new]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_and_shutdown_drain() {
    let (generator, dashboard) = setup(
        0,
        EventGeneratorConfig::new().with_flush_interval(Duration::from_millis(5000)),
    )
    .await;
    generator.start().unwrap();

    generator
        .generate_analysis_event("finding", "code-review", json!({}))
        .await;
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(dashboard.seen().len(), 1);

    generator
        .generate_analysis_event("finding", "code-review", json!({}))
        .await;
    assert_eq!(generator.shutdown().await, FlushOutcome::Delivered(1));
    assert_eq!(dashboard.seen().len(), 2);

    let late = generator
        .generate_analysis_event("finding", "code-review", json!({}))
        .await;
    assert!(!late.success);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dashboard.seen().len(), 2);
    assert_eq!(generator.queue_len(), 0);
}

#[tokio::test]
async fn test_other_keys_are_not_delivered() {
    let (generator, dashboard) = setup(0, EventGeneratorConfig::new().with_batch_size(50)).await;
    generator
        .generate_migration_event("step.done", "code-review", json!({}))
        .await;
    generator
        .generate_analysis_event("finding", "planner", json!({}))
        .await;
    assert_eq!(generator.flush_events().await, FlushOutcome::Delivered(2));
    assert!(dashboard.seen().is_empty());
}

/// Emits a derived system event for every analysis event it sees.
struct Monitor {
    generator: OnceLock<Weak<EventGenerator>>,
    seen: AtomicU32,
}

#[async_trait]
impl EventSubscriber for Monitor {
    async fn on_event(&self, event: Arc<DiasEvent>) -> staged_orchestrator::Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if let Some(generator) = self.generator.get().and_then(Weak::upgrade) {
            generator
                .generate_system_event("finding.observed", "monitor", json!({ "of": event.id }))
                .await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_monitor_generating_from_subscriber_keeps_flowing() {
    let bus = Arc::new(EventBus::new());
    let monitor = Arc::new(Monitor {
        generator: OnceLock::new(),
        seen: AtomicU32::new(0),
    });
    bus.subscribe(
        EventCategory::Analysis,
        "code-review",
        "monitor",
        monitor.clone(),
    )
    .await;
    let generator = Arc::new(EventGenerator::new(
        Arc::clone(&bus),
        EventGeneratorConfig::new().with_batch_size(2),
    ));
    let _ = monitor.generator.set(Arc::downgrade(&generator));

    let produce = async {
        for i in 0..6 {
            generator
                .generate_analysis_event("finding", "code-review", json!({ "line": i }))
                .await;
        }
        generator.shutdown().await
    };
    let outcome = tokio::time::timeout(Duration::from_secs(3), produce)
        .await
        .expect("generator stalled");

    assert_eq!(outcome, FlushOutcome::Empty);
    assert_eq!(monitor.seen.load(Ordering::SeqCst), 6);
    assert_eq!(generator.queue_len(), 0);
    assert_eq!(bus.buffered_len(EventCategory::System, "monitor"), 6);
}

#[tokio::test]
async fn test_late_dashboard_receives_earlier_events() {
    let bus = Arc::new(EventBus::new());
    let generator = EventGenerator::new(
        Arc::clone(&bus),
        EventGeneratorConfig::new().with_batch_size(50),
    );
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            generator
                .generate_analysis_event("finding", "code-review", json!({ "line": i }))
                .await
                .event_id,
        );
    }
    assert_eq!(generator.flush_events().await, FlushOutcome::Delivered(3));

    let dashboard = Dashboard::new(0);
    bus.subscribe(
        EventCategory::Analysis,
        "code-review",
        "dashboard",
        dashboard.clone(),
    )
    .await;
    assert_eq!(dashboard.seen(), ids);
}

#[tokio::test]
async fn test_offline_dashboard_backlog_stays_bounded() {
    let (generator, dashboard) = setup(
        u32::MAX,
        EventGeneratorConfig::new()
            .with_batch_size(10)
            .with_max_retries(1)
            .with_max_queue_size(15),
    )
    .await;
    for i in 0..100 {
        generator
            .generate_analysis_event("finding", "code-review", json!({ "line": i }))
            .await;
    }
    let stats = generator.stats();
    assert_eq!(stats.flushes, 10);
    assert!(generator.queue_len() <= 15);
    assert_eq!(
        stats.generated,
        stats.dead_lettered + stats.dropped_events + generator.queue_len() as u64
    );
    assert!(dashboard.seen().is_empty());
    assert_eq!(generator.dead_letters().len() as u64, stats.dead_lettered.min(15));
}
