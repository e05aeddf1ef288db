//! Internal events.
//!
//! Producers hand events to the [`EventGenerator`], which batches them and
//! publishes to the [`EventBus`]. Subscribers register on the bus under a
//! `(category, source)` key.

pub mod bus;
pub mod generator;
pub mod types;

pub use bus::{
    BusStats, EventBus, EventFilter, EventSubscriber, SubscriptionId, DEFAULT_BUFFER_LIMIT,
};
pub use generator::{
    DeadLetter, EventGenerator, EventGeneratorConfig, FlushOutcome, GenerationResult,
    GeneratorStats,
};
pub use types::{DiasEvent, EventCategory};
