//! HTTP webhook sink with per-request retry and a short aggregation
//! window for multi-outcome trade signals.
//!
//! Retry policy: transport errors and HTTP 429/5xx retry up to
//! `max_retries`, honouring `Retry-After` (JSON body field or header),
//! otherwise jittered exponential backoff capped at 30 s. Other statuses
//! fail immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, warn};

use common::config::WebhookSinkConfig;
use common::events::{DomainEvent, EventPayload, EventType, SignalPayload};

use super::{EventSink, SinkError};

/// Aggregation buffer key: `(market_id, signal)`.
type AggKey = (String, String);

struct Inner {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    aggregate_multi_outcome: bool,
    aggregate_window: Duration,
    aggregate_max_items: usize,
    buffers: Mutex<HashMap<AggKey, Vec<DomainEvent>>>,
}

pub struct WebhookSink {
    inner: Arc<Inner>,
}

impl WebhookSink {
    pub fn new(cfg: &WebhookSinkConfig, url: String) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_sec))
            .build()
            .map_err(|error| SinkError::Transport(error.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url,
                max_retries: cfg.max_retries,
                aggregate_multi_outcome: cfg.aggregate_multi_outcome,
                aggregate_window: Duration::from_secs_f64(cfg.aggregate_window_sec.max(0.0)),
                aggregate_max_items: cfg.aggregate_max_items.max(1),
                buffers: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
        if let Some(key) = aggregation_key(event, self.inner.aggregate_multi_outcome) {
            let first = {
                let mut buffers = self.inner.buffers.lock().expect("webhook buffers poisoned");
                let buffer = buffers.entry(key.clone()).or_default();
                buffer.push(event.clone());
                buffer.len() == 1
            };
            if first {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(inner.aggregate_window).await;
                    flush_aggregate(inner, key).await;
                });
            }
            return Ok(());
        }

        let body =
            serde_json::to_value(event).map_err(|error| SinkError::Serialize(error.to_string()))?;
        post_with_retry(&self.inner, &body).await
    }
}

async fn flush_aggregate(inner: Arc<Inner>, key: AggKey) {
    let events = {
        let mut buffers = inner.buffers.lock().expect("webhook buffers poisoned");
        buffers.remove(&key).unwrap_or_default()
    };
    if events.is_empty() {
        return;
    }
    let body = aggregate_body(&key, events, inner.aggregate_max_items);
    if let Err(error) = post_with_retry(&inner, &body).await {
        warn!(%error, market_id = %key.0, signal = %key.1, "aggregate webhook delivery failed");
    }
}

/// Events eligible for aggregation: trade signals of the merging kinds on
/// a multi-outcome side.
fn aggregation_key(event: &DomainEvent, enabled: bool) -> Option<AggKey> {
    if !enabled || event.event_type != EventType::TradeSignal {
        return None;
    }
    let signal = event.signal_name()?;
    if !matches!(signal, "major_change" | "big_trade" | "volume_spike_1m") {
        return None;
    }
    let side = event.side.as_deref()?;
    let upper = side.to_uppercase();
    if upper == "YES" || upper == "NO" {
        return None;
    }
    let market_id = event.market_id.clone()?;
    Some((market_id, signal.to_string()))
}

fn magnitude(event: &DomainEvent) -> Decimal {
    match &event.payload {
        EventPayload::Signal(SignalPayload::MajorChange {
            pct_change_signed, ..
        }) => pct_change_signed.abs(),
        EventPayload::Signal(SignalPayload::BigTrade { notional, .. }) => *notional,
        EventPayload::Signal(SignalPayload::VolumeSpike1m { vol_1m, .. }) => *vol_1m,
        _ => Decimal::ZERO,
    }
}

/// One aggregate message: the biggest `max_items` entries by magnitude.
fn aggregate_body(key: &AggKey, mut events: Vec<DomainEvent>, max_items: usize) -> Value {
    let total = events.len();
    events.sort_by(|a, b| magnitude(b).cmp(&magnitude(a)));
    events.truncate(max_items);
    json!({
        "aggregate": key.1,
        "market_id": key.0,
        "count": total,
        "items": events,
    })
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 0.5 * 2f64.powi(attempt.min(16) as i32);
    let jitter = rand::random::<f64>() * 0.25;
    Duration::from_secs_f64((base + jitter).min(30.0))
}

/// `Retry-After` from the JSON body (`retry_after`) or the header.
async fn retry_after(response: reqwest::Response) -> Option<f64> {
    let header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<f64>().ok());
    let body: Option<Value> = response.json().await.ok();
    let from_body = body
        .as_ref()
        .and_then(|value| value.get("retry_after"))
        .and_then(|value| {
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
        });
    from_body.or(header)
}

async fn post_with_retry(inner: &Inner, body: &Value) -> Result<(), SinkError> {
    let mut attempt: u32 = 0;
    loop {
        match inner.client.post(&inner.url).json(body).send().await {
            Err(error) => {
                if attempt >= inner.max_retries {
                    return Err(SinkError::Transport(error.to_string()));
                }
                debug!(%error, attempt, "webhook transport error, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let code = status.as_u16();
                if code != 429 && !(500..600).contains(&code) {
                    return Err(SinkError::Status(code));
                }
                if attempt >= inner.max_retries {
                    return Err(SinkError::Status(code));
                }
                let delay = retry_after(response)
                    .await
                    .map(Duration::from_secs_f64)
                    .unwrap_or_else(|| backoff_delay(attempt));
                debug!(status = code, attempt, delay_ms = delay.as_millis() as u64, "webhook retry");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal_event(signal: SignalPayload, side: Option<&str>) -> DomainEvent {
        let mut event = DomainEvent::new(EventType::TradeSignal, EventPayload::Signal(signal));
        event.market_id = Some("m1".to_string());
        event.side = side.map(|s| s.to_string());
        event
    }

    fn big_trade(notional: Decimal) -> SignalPayload {
        SignalPayload::BigTrade {
            notional,
            price: dec!(0.5),
            size: dec!(10),
            vol_1m: None,
        }
    }

    #[test]
    fn aggregation_key_requires_multi_outcome_side() {
        let event = signal_event(big_trade(dec!(100)), Some("CANDIDATE A"));
        assert_eq!(
            aggregation_key(&event, true),
            Some(("m1".to_string(), "big_trade".to_string()))
        );
        // YES/NO outcomes and missing sides flow straight through
        assert!(aggregation_key(&signal_event(big_trade(dec!(100)), Some("YES")), true).is_none());
        assert!(aggregation_key(&signal_event(big_trade(dec!(100)), None), true).is_none());
        // disabled aggregation
        let event = signal_event(big_trade(dec!(100)), Some("CANDIDATE A"));
        assert!(aggregation_key(&event, false).is_none());
    }

    #[test]
    fn aggregation_key_ignores_other_event_types() {
        let mut event = signal_event(
            SignalPayload::BigWall {
                max_bid: dec!(1),
                max_ask: dec!(2),
                threshold: dec!(1),
            },
            Some("CANDIDATE A"),
        );
        event.event_type = EventType::BookSignal;
        assert!(aggregation_key(&event, true).is_none());
    }

    #[test]
    fn aggregate_body_sorts_by_magnitude_and_truncates() {
        let key = ("m1".to_string(), "big_trade".to_string());
        let events = vec![
            signal_event(big_trade(dec!(100)), Some("A")),
            signal_event(big_trade(dec!(900)), Some("B")),
            signal_event(big_trade(dec!(500)), Some("C")),
        ];
        let body = aggregate_body(&key, events, 2);
        assert_eq!(body["count"], 3);
        assert_eq!(body["aggregate"], "big_trade");
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["side"], "B");
        assert_eq!(items[1]["side"], "C");
    }

    #[test]
    fn magnitude_per_signal_kind() {
        let major = signal_event(
            SignalPayload::MajorChange {
                pct_change: dec!(7),
                pct_change_signed: dec!(-7),
                direction: "down".to_string(),
                price: dec!(0.4),
                prev_price: dec!(0.43),
                window_sec: 60,
                notional: dec!(0),
                source: "trade".to_string(),
            },
            Some("A"),
        );
        assert_eq!(magnitude(&major), dec!(7));
        let spike = signal_event(
            SignalPayload::VolumeSpike1m {
                vol_1m: dec!(321),
                price: dec!(0.5),
                size: dec!(1),
            },
            Some("A"),
        );
        assert_eq!(magnitude(&spike), dec!(321));
    }

    #[test]
    fn backoff_delay_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt).as_secs_f64() <= 30.0);
        }
        assert!(backoff_delay(0).as_secs_f64() >= 0.5);
    }
}
