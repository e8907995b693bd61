//! Downstream event sinks and the multiplex that fans out to them.

use async_trait::async_trait;
use thiserror::Error;

use common::events::DomainEvent;

pub mod multiplex;
pub mod stdout;
pub mod webhook;

pub use multiplex::MultiplexSink;
pub use stdout::StdoutSink;
pub use webhook::WebhookSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("required sinks failed: {0:?}")]
    RequiredFailed(Vec<String>),
}

/// A downstream consumer of domain events. Delivery is at-least-once;
/// implementations own their retry policy.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), SinkError>;
}
