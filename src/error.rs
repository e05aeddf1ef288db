use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "routes.chat.candidates", "events.batch_size")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected value, offending service name)
    pub details: Option<String>,
    /// Source of the error (e.g., "readiness_tracker", "capability_router")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber that rejected an event during publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Origin tag the subscriber registered with.
    pub origin: String,
    pub message: String,
}

/// Unified error type for the orchestration layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// The route name has no registered candidates. Never retried.
    #[error("Route '{route}' is not configured")]
    RouteNotConfigured { route: String },

    #[error("Max retries ({max_retries}) exceeded after {attempts} attempts: {last_error}")]
    RetryExhausted {
        max_retries: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("Event delivery failed for {event_id}: {}", format_failures(.failures))]
    EventDelivery {
        event_id: String,
        failures: Vec<DeliveryFailure>,
    },

    #[error("Service '{service}' initialization timed out after {timeout_ms}ms")]
    InitializationTimeout { service: String, timeout_ms: u64 },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_failures(failures: &[DeliveryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.origin, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Shorthand for a runtime error without context.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// True for wiring mistakes that will fail the same way on every call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. } | Error::RouteNotConfigured { .. } | Error::Yaml(_)
        )
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Error::RetryExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_rendered_in_message() {
        let err = Error::configuration_with_context(
            "route has no candidates",
            ErrorContext::new()
                .with_field_path("routes.chat.candidates")
                .with_source("orchestrator_config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: route has no candidates (field: routes.chat.candidates, source: orchestrator_config)"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_retry_exhausted_message_carries_budget_and_cause() {
        let err = Error::RetryExhausted {
            max_retries: 3,
            attempts: 4,
            last_error: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Max retries (3)"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_retry_exhausted());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_delivery_failures_are_listed() {
        let err = Error::EventDelivery {
            event_id: "evt-1".into(),
            failures: vec![
                DeliveryFailure {
                    origin: "dashboard".into(),
                    message: "socket closed".into(),
                },
                DeliveryFailure {
                    origin: "audit".into(),
                    message: "disk full".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Event delivery failed for evt-1: dashboard: socket closed; audit: disk full"
        );
    }

    #[test]
    fn test_route_not_configured_is_configuration() {
        let err = Error::RouteNotConfigured {
            route: "chat".into(),
        };
        assert!(err.is_configuration());
        assert!(err.context().is_none());
    }
}
