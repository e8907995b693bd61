//! Serialized event records on standard output.

use async_trait::async_trait;

use common::events::DomainEvent;

use super::{EventSink, SinkError};

pub struct StdoutSink;

#[async_trait]
impl EventSink for StdoutSink {
    async fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let line =
            serde_json::to_string(event).map_err(|error| SinkError::Serialize(error.to_string()))?;
        println!("{line}");
        Ok(())
    }
}
