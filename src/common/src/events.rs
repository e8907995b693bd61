//! Domain events published through the sink multiplex.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::now_ms;

/// Event source stamped on every emitted record.
pub const EVENT_SOURCE: &str = "polymarket";

/// Top-level classification of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    CandidateSelected,
    SubscriptionChanged,
    MonitoringStatus,
    TradeSignal,
    BookSignal,
    PriceSignal,
    MarketLifecycle,
    HealthEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CandidateSelected => "CandidateSelected",
            EventType::SubscriptionChanged => "SubscriptionChanged",
            EventType::MonitoringStatus => "MonitoringStatus",
            EventType::TradeSignal => "TradeSignal",
            EventType::BookSignal => "BookSignal",
            EventType::PriceSignal => "PriceSignal",
            EventType::MarketLifecycle => "MarketLifecycle",
            EventType::HealthEvent => "HealthEvent",
        }
    }

    /// Alternate route-table spelling (`TRADE_SIGNAL` for `TradeSignal`).
    pub fn alt_name(&self) -> &'static str {
        match self {
            EventType::CandidateSelected => "CANDIDATE_SELECTED",
            EventType::SubscriptionChanged => "SUBSCRIPTION_CHANGED",
            EventType::MonitoringStatus => "MONITORING_STATUS",
            EventType::TradeSignal => "TRADE_SIGNAL",
            EventType::BookSignal => "BOOK_SIGNAL",
            EventType::PriceSignal => "PRICE_SIGNAL",
            EventType::MarketLifecycle => "MARKET_LIFECYCLE",
            EventType::HealthEvent => "HEALTH_EVENT",
        }
    }
}

/// Signal payloads; the `signal` field is the wire discriminant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal")]
pub enum SignalPayload {
    #[serde(rename = "major_change")]
    MajorChange {
        pct_change: Decimal,
        pct_change_signed: Decimal,
        direction: String,
        price: Decimal,
        prev_price: Decimal,
        window_sec: u64,
        notional: Decimal,
        source: String,
    },
    #[serde(rename = "big_trade")]
    BigTrade {
        notional: Decimal,
        price: Decimal,
        size: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        vol_1m: Option<Decimal>,
    },
    #[serde(rename = "volume_spike_1m")]
    VolumeSpike1m {
        vol_1m: Decimal,
        price: Decimal,
        size: Decimal,
    },
    #[serde(rename = "big_wall")]
    BigWall {
        max_bid: Decimal,
        max_ask: Decimal,
        threshold: Decimal,
    },
    #[serde(rename = "web_volume_spike")]
    WebVolumeSpike {
        delta_volume: f64,
        volume_24h: f64,
        window_sec: u64,
        source: String,
        orderbook: bool,
    },
}

impl SignalPayload {
    /// The discriminant value, also the cooldown key component.
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::MajorChange { .. } => "major_change",
            SignalPayload::BigTrade { .. } => "big_trade",
            SignalPayload::VolumeSpike1m { .. } => "volume_spike_1m",
            SignalPayload::BigWall { .. } => "big_wall",
            SignalPayload::WebVolumeSpike { .. } => "web_volume_spike",
        }
    }
}

/// Tagged union of all event payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Signal(SignalPayload),
    MonitoringStatus {
        status: String,
        market_count: usize,
        token_count: usize,
        unsubscribable_count: usize,
    },
    Lifecycle {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_ts_ms: Option<i64>,
    },
    Health {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CandidateSelected {
        market_count: usize,
    },
    SubscriptionChanged {
        token_count: usize,
    },
}

/// One event record as published to the sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub ts_ms: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_key: Option<String>,
    pub payload: EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            ts_ms: now_ms(),
            source: EVENT_SOURCE.to_string(),
            category: None,
            event_type,
            market_id: None,
            token_id: None,
            side: None,
            title: None,
            topic_key: None,
            payload,
            raw: None,
        }
    }

    pub fn at(mut self, ts_ms: i64) -> Self {
        self.ts_ms = ts_ms;
        self
    }

    /// The signal discriminant for trade/book signal events, if any.
    pub fn signal_name(&self) -> Option<&'static str> {
        match &self.payload {
            EventPayload::Signal(signal) => Some(signal.name()),
            _ => None,
        }
    }

    /// Copy of this event with the `raw` field dropped (compact transform).
    pub fn without_raw(&self) -> Self {
        Self {
            raw: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signal_payload_serializes_with_discriminant() {
        let payload = SignalPayload::BigTrade {
            notional: dec!(12000),
            price: dec!(0.55),
            size: dec!(21818.18),
            vol_1m: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["signal"], "big_trade");
        assert!(json.get("vol_1m").is_none());
    }

    #[test]
    fn event_type_names() {
        assert_eq!(EventType::TradeSignal.as_str(), "TradeSignal");
        assert_eq!(EventType::TradeSignal.alt_name(), "TRADE_SIGNAL");
        let json = serde_json::to_value(EventType::HealthEvent).unwrap();
        assert_eq!(json, "HealthEvent");
    }

    #[test]
    fn without_raw_drops_only_raw() {
        let mut event = DomainEvent::new(
            EventType::TradeSignal,
            EventPayload::Signal(SignalPayload::VolumeSpike1m {
                vol_1m: dec!(150),
                price: dec!(0.4),
                size: dec!(10),
            }),
        );
        event.raw = Some(serde_json::json!({"k": "v"}));
        let compact = event.without_raw();
        assert!(compact.raw.is_none());
        assert_eq!(compact.event_id, event.event_id);
        assert_eq!(compact.payload, event.payload);
    }
}
