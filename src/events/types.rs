//! Internal event types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Component,
    Pipeline,
    Quality,
    User,
    System,
    Integration,
    Analysis,
    Migration,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Component => "component",
            EventCategory::Pipeline => "pipeline",
            EventCategory::Quality => "quality",
            EventCategory::User => "user",
            EventCategory::System => "system",
            EventCategory::Integration => "integration",
            EventCategory::Analysis => "analysis",
            EventCategory::Migration => "migration",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable internal event.
///
/// Shared with subscribers as `Arc<DiasEvent>`; nobody mutates it after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiasEvent {
    pub id: String,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(with = "crate::utils::time::epoch_ms")]
    pub timestamp: SystemTime,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl DiasEvent {
    pub fn new(
        category: EventCategory,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            category,
            event_type: event_type.into(),
            source: source.into(),
            timestamp: SystemTime::now(),
            payload,
            correlation_id: None,
            project_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_project_id(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_has_unique_id() {
        let a = DiasEvent::new(EventCategory::System, "service.ready", "ai-client", json!({}));
        let b = DiasEvent::new(EventCategory::System, "service.ready", "ai-client", json!({}));
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("evt-"));
    }

    #[test]
    fn test_event_json_shape() {
        let e = DiasEvent::new(
            EventCategory::Analysis,
            "review.completed",
            "code-review",
            json!({"findings": 3}),
        )
        .with_correlation_id("req-42");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["category"], "analysis");
        assert_eq!(v["type"], "review.completed");
        assert_eq!(v["payload"]["findings"], 3);
        assert_eq!(v["correlationId"], "req-42");
        assert!(v.get("projectId").is_none());
        assert!(v["timestamp"].is_u64());
    }
}
