//! Fan-out of one domain event to N named child sinks with routing,
//! best-effort vs required-sinks delivery, and an optional compact
//! transform.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use common::config::{SinkMode, TransformMode};
use common::events::{DomainEvent, EventType};

use super::{EventSink, SinkError};

pub struct MultiplexSink {
    sinks: Vec<(String, Arc<dyn EventSink>)>,
    mode: SinkMode,
    required: HashSet<String>,
    routes: HashMap<String, Vec<String>>,
    transform: TransformMode,
}

impl MultiplexSink {
    pub fn new(
        sinks: Vec<(String, Arc<dyn EventSink>)>,
        mode: SinkMode,
        required_sinks: &[String],
        routes: HashMap<String, Vec<String>>,
        transform: TransformMode,
    ) -> Self {
        Self {
            sinks,
            mode,
            required: required_sinks.iter().cloned().collect(),
            routes,
            transform,
        }
    }

    /// Deliver to every routed child sequentially. Non-required failures
    /// are logged and swallowed; a failed required sink raises after all
    /// children were attempted.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let targets = self.resolve_targets(event.event_type);
        let shaped = match self.transform {
            TransformMode::Full => event.clone(),
            TransformMode::Compact => event.without_raw(),
        };

        let mut failed: Vec<String> = Vec::new();
        for name in targets {
            let Some((_, sink)) = self.sinks.iter().find(|(sink_name, _)| *sink_name == name)
            else {
                continue;
            };
            if let Err(error) = sink.publish(&shaped).await {
                warn!(sink = %name, %error, "sink publish failed");
                failed.push(name);
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let mut required_failed: Vec<String> = failed
            .into_iter()
            .filter(|name| self.mode == SinkMode::RequiredSinks || self.required.contains(name))
            .collect();
        if required_failed.is_empty() {
            return Ok(());
        }
        required_failed.sort();
        Err(SinkError::RequiredFailed(required_failed))
    }

    /// Route-table lookup by canonical and alternate event-type name;
    /// no route means all sinks.
    fn resolve_targets(&self, event_type: EventType) -> Vec<String> {
        let routed = self
            .routes
            .get(event_type.as_str())
            .or_else(|| self.routes.get(event_type.alt_name()));
        match routed {
            Some(names) if !names.is_empty() => names.clone(),
            _ => self.sinks.iter().map(|(name, _)| name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use common::events::EventPayload;

    struct CaptureSink {
        events: Mutex<Vec<DomainEvent>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<DomainEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for CaptureSink {
        async fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: &DomainEvent) -> Result<(), SinkError> {
            Err(SinkError::Status(500))
        }
    }

    fn health_event() -> DomainEvent {
        let mut event = DomainEvent::new(
            EventType::HealthEvent,
            EventPayload::Health {
                status: "refresh_ok".to_string(),
                duration_ms: Some(10),
                error: None,
            },
        );
        event.raw = Some(serde_json::json!({"detail": true}));
        event
    }

    #[tokio::test]
    async fn full_transform_delivers_equal_event_to_every_child() {
        let a = CaptureSink::new();
        let b = CaptureSink::new();
        let multiplex = MultiplexSink::new(
            vec![
                ("a".to_string(), a.clone() as Arc<dyn EventSink>),
                ("b".to_string(), b.clone() as Arc<dyn EventSink>),
            ],
            SinkMode::BestEffort,
            &[],
            HashMap::new(),
            TransformMode::Full,
        );

        let event = health_event();
        multiplex.publish(&event).await.unwrap();
        assert_eq!(a.received(), vec![event.clone()]);
        assert_eq!(b.received(), vec![event]);
    }

    #[tokio::test]
    async fn compact_transform_drops_raw() {
        let a = CaptureSink::new();
        let multiplex = MultiplexSink::new(
            vec![("a".to_string(), a.clone() as Arc<dyn EventSink>)],
            SinkMode::BestEffort,
            &[],
            HashMap::new(),
            TransformMode::Compact,
        );

        let event = health_event();
        multiplex.publish(&event).await.unwrap();
        let received = a.received();
        assert!(received[0].raw.is_none());
        assert_eq!(received[0].event_id, event.event_id);
    }

    #[tokio::test]
    async fn routes_limit_targets() {
        let a = CaptureSink::new();
        let b = CaptureSink::new();
        let routes: HashMap<String, Vec<String>> =
            [("HealthEvent".to_string(), vec!["b".to_string()])]
                .into_iter()
                .collect();
        let multiplex = MultiplexSink::new(
            vec![
                ("a".to_string(), a.clone() as Arc<dyn EventSink>),
                ("b".to_string(), b.clone() as Arc<dyn EventSink>),
            ],
            SinkMode::BestEffort,
            &[],
            routes,
            TransformMode::Full,
        );

        multiplex.publish(&health_event()).await.unwrap();
        assert!(a.received().is_empty());
        assert_eq!(b.received().len(), 1);
    }

    #[tokio::test]
    async fn routes_lookup_accepts_alternate_name() {
        let a = CaptureSink::new();
        let b = CaptureSink::new();
        let routes: HashMap<String, Vec<String>> =
            [("HEALTH_EVENT".to_string(), vec!["a".to_string()])]
                .into_iter()
                .collect();
        let multiplex = MultiplexSink::new(
            vec![
                ("a".to_string(), a.clone() as Arc<dyn EventSink>),
                ("b".to_string(), b.clone() as Arc<dyn EventSink>),
            ],
            SinkMode::BestEffort,
            &[],
            routes,
            TransformMode::Full,
        );

        multiplex.publish(&health_event()).await.unwrap();
        assert_eq!(a.received().len(), 1);
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn required_sink_failure_raises_after_delivering_to_others() {
        let a = CaptureSink::new();
        let multiplex = MultiplexSink::new(
            vec![
                ("a".to_string(), a.clone() as Arc<dyn EventSink>),
                ("b".to_string(), Arc::new(FailingSink) as Arc<dyn EventSink>),
            ],
            SinkMode::BestEffort,
            &["b".to_string()],
            HashMap::new(),
            TransformMode::Full,
        );

        let result = multiplex.publish(&health_event()).await;
        match result {
            Err(SinkError::RequiredFailed(names)) => assert_eq!(names, vec!["b".to_string()]),
            other => panic!("expected required failure, got {other:?}"),
        }
        // sink a still received the event
        assert_eq!(a.received().len(), 1);
    }

    #[tokio::test]
    async fn best_effort_swallows_non_required_failures() {
        let a = CaptureSink::new();
        let multiplex = MultiplexSink::new(
            vec![
                ("a".to_string(), a.clone() as Arc<dyn EventSink>),
                ("b".to_string(), Arc::new(FailingSink) as Arc<dyn EventSink>),
            ],
            SinkMode::BestEffort,
            &[],
            HashMap::new(),
            TransformMode::Full,
        );

        multiplex.publish(&health_event()).await.unwrap();
        assert_eq!(a.received().len(), 1);
    }

    #[tokio::test]
    async fn required_sinks_mode_makes_every_sink_required() {
        let multiplex = MultiplexSink::new(
            vec![("b".to_string(), Arc::new(FailingSink) as Arc<dyn EventSink>)],
            SinkMode::RequiredSinks,
            &[],
            HashMap::new(),
            TransformMode::Full,
        );

        assert!(multiplex.publish(&health_event()).await.is_err());
    }
}
