//! The orchestrator: a refresh loop driving discovery and subscriptions,
//! a consume loop routing feed messages through the book registry and the
//! signal engine, and a pump draining emitted events into the sink
//! multiplex. One shutdown signal stops all three.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use common::clob::{extract_token_id, parse_book, parse_trade};
use common::clock::now_ms;
use common::config::Config;
use common::events::{DomainEvent, EventPayload, EventType, SignalPayload};
use common::models::{normalize_side, Market, TokenMeta};
use common::orderbook::{BookUpdate, OrderBookRegistry};
use common::selection::normalize_topic;
use common::{FeedController, FeedHandle, FeedMessage};

use crate::detector::{schedule_flush, SignalEngine};
use crate::discovery::{Discovery, DiscoveryResult};
use crate::sinks::MultiplexSink;

/// The currently monitored universe, shared between the two loops.
#[derive(Debug, Default)]
pub struct Universe {
    pub token_meta: HashMap<String, TokenMeta>,
    pub markets_by_id: HashMap<String, Market>,
}

#[derive(Debug, Default)]
struct RefreshState {
    first_refresh_done: bool,
    monitoring_announced: bool,
    markets_by_id: HashMap<String, Market>,
    token_ids: Vec<String>,
    prev_volume: HashMap<String, f64>,
    polling_last_emit: HashMap<String, i64>,
}

/// Resync throttle: at most one resubscribe per `min_interval`.
struct ResyncGate {
    enabled: bool,
    min_interval: Duration,
    last: Option<Instant>,
}

impl ResyncGate {
    fn new(enabled: bool, min_interval_sec: u64) -> Self {
        Self {
            enabled,
            min_interval: Duration::from_secs(min_interval_sec),
            last: None,
        }
    }

    fn should_resync(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(last) = self.last {
            if last.elapsed() < self.min_interval {
                return false;
            }
        }
        self.last = Some(Instant::now());
        true
    }
}

pub struct Monitor {
    cfg: Config,
    discovery: Discovery,
    feed: FeedHandle,
    engine: Arc<Mutex<SignalEngine>>,
    registry: Arc<Mutex<OrderBookRegistry>>,
    sink: Arc<MultiplexSink>,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    events_rx: mpsc::UnboundedReceiver<DomainEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        discovery: Discovery,
        feed: FeedHandle,
        engine: Arc<Mutex<SignalEngine>>,
        registry: Arc<Mutex<OrderBookRegistry>>,
        sink: Arc<MultiplexSink>,
        events_tx: mpsc::UnboundedSender<DomainEvent>,
        events_rx: mpsc::UnboundedReceiver<DomainEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            discovery,
            feed,
            engine,
            registry,
            sink,
            events_tx,
            events_rx,
            shutdown,
        }
    }

    /// Run all three tasks; the first to finish (shutdown, feed death)
    /// stops the rest and closes the feed.
    pub async fn run(self) -> anyhow::Result<()> {
        let Monitor {
            cfg,
            discovery,
            feed,
            engine,
            registry,
            sink,
            events_tx,
            events_rx,
            shutdown,
        } = self;
        let controller = feed.controller();
        let universe = Arc::new(Mutex::new(Universe::default()));

        let refresh = refresh_loop(
            cfg.clone(),
            discovery,
            controller.clone(),
            engine.clone(),
            registry.clone(),
            universe.clone(),
            events_tx.clone(),
            shutdown.clone(),
        );
        let consume = consume_loop(
            cfg,
            feed,
            controller.clone(),
            engine,
            registry,
            universe,
            events_tx,
            shutdown.clone(),
        );
        let pump = sink_pump(sink, events_rx, shutdown);

        tokio::select! {
            _ = refresh => {}
            _ = consume => {}
            _ = pump => {}
        }
        controller.close();
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn refresh_loop(
    cfg: Config,
    discovery: Discovery,
    controller: FeedController,
    engine: Arc<Mutex<SignalEngine>>,
    registry: Arc<Mutex<OrderBookRegistry>>,
    universe: Arc<Mutex<Universe>>,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = RefreshState::default();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let start = now_ms();
        match discovery.refresh(&cfg.app.categories).await {
            Ok(result) => {
                let changed = apply_refresh(
                    &cfg,
                    &result,
                    &mut state,
                    &engine,
                    &registry,
                    &universe,
                    &events_tx,
                    now_ms(),
                );
                if let Some(token_ids) = changed {
                    controller.subscribe(token_ids);
                }
                let duration_ms = now_ms() - start;
                emit_health(&events_tx, "refresh_ok", Some(duration_ms), None);
            }
            Err(error) => {
                warn!(%error, "refresh failed");
                emit_health(&events_tx, "refresh_error", None, Some(error.to_string()));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cfg.app.refresh_interval_sec.max(1))) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Apply one discovery result: diff the universe, rebuild token metadata,
/// emit candidate/subscription/status/polling events. Returns the new
/// sorted token id list when the subscription must change.
#[allow(clippy::too_many_arguments)]
fn apply_refresh(
    cfg: &Config,
    result: &DiscoveryResult,
    state: &mut RefreshState,
    engine: &Arc<Mutex<SignalEngine>>,
    registry: &Arc<Mutex<OrderBookRegistry>>,
    universe: &Arc<Mutex<Universe>>,
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    now: i64,
) -> Option<Vec<String>> {
    let mut new_markets: HashMap<String, Market> = HashMap::new();
    for markets in result.markets_by_category.values() {
        for market in markets {
            new_markets.insert(market.market_id.clone(), market.clone());
        }
    }
    for market in &result.untradeable {
        new_markets.insert(market.market_id.clone(), market.clone());
    }

    // the very first refresh just records the set, no add/remove noise
    if state.first_refresh_done {
        emit_universe_diff(&state.markets_by_id, &new_markets, events_tx, now);
    }

    let token_meta = build_token_meta(&result.markets_by_category);
    engine
        .lock()
        .expect("signal engine lock poisoned")
        .update_registry(token_meta.clone());
    let known_tokens: std::collections::HashSet<String> = token_meta.keys().cloned().collect();
    registry
        .lock()
        .expect("book registry lock poisoned")
        .retain_tokens(&known_tokens);
    {
        let mut universe = universe.lock().expect("universe lock poisoned");
        universe.token_meta = token_meta.clone();
        universe.markets_by_id = new_markets.clone();
    }

    let mut token_ids: Vec<String> = token_meta.keys().cloned().collect();
    token_ids.sort();
    let subscription_changed = token_ids != state.token_ids;
    if subscription_changed {
        let mut event = DomainEvent::new(
            EventType::SubscriptionChanged,
            EventPayload::SubscriptionChanged {
                token_count: token_ids.len(),
            },
        )
        .at(now);
        event.raw = Some(json!({"token_ids": token_ids}));
        let _ = events_tx.send(event);
    }

    for (category, markets) in &result.markets_by_category {
        emit_candidates(category, markets, events_tx, now);
    }

    emit_untradeable_signals(
        cfg,
        &result.untradeable,
        state,
        events_tx,
        now,
    );

    if !state.monitoring_announced && !token_ids.is_empty() {
        let subscribed: Vec<&str> = result
            .markets_by_category
            .values()
            .flatten()
            .map(|market| market.question.as_str())
            .collect();
        let untradeable: Vec<&str> = result
            .untradeable
            .iter()
            .map(|market| market.question.as_str())
            .collect();
        let mut event = DomainEvent::new(
            EventType::MonitoringStatus,
            EventPayload::MonitoringStatus {
                status: "monitoring_started".to_string(),
                market_count: subscribed.len(),
                token_count: token_ids.len(),
                unsubscribable_count: untradeable.len(),
            },
        )
        .at(now);
        event.raw = Some(json!({
            "subscribed_markets": subscribed,
            "untradeable_markets": untradeable,
        }));
        let _ = events_tx.send(event);
        state.monitoring_announced = true;
        info!(
            markets = subscribed.len(),
            tokens = token_ids.len(),
            "monitoring started"
        );
    }

    state.first_refresh_done = true;
    state.markets_by_id = new_markets;
    if subscription_changed {
        state.token_ids = token_ids.clone();
        Some(token_ids)
    } else {
        None
    }
}

/// One TokenMeta per (market, outcome-with-token); markets whose outcomes
/// carry no token ids fall back to the flat token list with no side.
fn build_token_meta(
    markets_by_category: &HashMap<String, Vec<Market>>,
) -> HashMap<String, TokenMeta> {
    let mut mapping = HashMap::new();
    for (category, markets) in markets_by_category {
        for market in markets {
            let topic_key = market
                .topic_key
                .clone()
                .unwrap_or_else(|| normalize_topic(&market.question));
            let with_tokens: Vec<_> = market
                .outcomes
                .iter()
                .filter(|outcome| !outcome.token_id.is_empty())
                .collect();
            if !with_tokens.is_empty() {
                for outcome in with_tokens {
                    mapping.insert(
                        outcome.token_id.clone(),
                        TokenMeta {
                            token_id: outcome.token_id.clone(),
                            market_id: market.market_id.clone(),
                            category: category.clone(),
                            title: Some(market.question.clone()),
                            side: normalize_side(outcome.side.as_deref()),
                            topic_key: Some(topic_key.clone()),
                            end_ts_ms: market.end_ts_ms,
                        },
                    );
                }
            } else {
                for token_id in &market.token_ids {
                    mapping.insert(
                        token_id.clone(),
                        TokenMeta {
                            token_id: token_id.clone(),
                            market_id: market.market_id.clone(),
                            category: category.clone(),
                            title: Some(market.question.clone()),
                            side: None,
                            topic_key: Some(topic_key.clone()),
                            end_ts_ms: market.end_ts_ms,
                        },
                    );
                }
            }
        }
    }
    mapping
}

fn emit_universe_diff(
    old: &HashMap<String, Market>,
    new: &HashMap<String, Market>,
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    now: i64,
) {
    for (market_id, market) in old {
        if !new.contains_key(market_id) {
            emit_lifecycle(market, "removed", events_tx, now);
        }
    }
    for (market_id, market) in new {
        if !old.contains_key(market_id) {
            emit_lifecycle(market, "new", events_tx, now);
        }
    }
}

fn emit_lifecycle(
    market: &Market,
    status: &str,
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    now: i64,
) {
    let mut event = DomainEvent::new(
        EventType::MarketLifecycle,
        EventPayload::Lifecycle {
            status: status.to_string(),
            end_ts_ms: market.end_ts_ms,
        },
    )
    .at(now);
    event.category = market.category.clone();
    event.market_id = Some(market.market_id.clone());
    event.title = Some(market.question.clone());
    event.topic_key = market.topic_key.clone();
    let _ = events_tx.send(event);
}

fn emit_candidates(
    category: &str,
    markets: &[Market],
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    now: i64,
) {
    let listing: Vec<Value> = markets
        .iter()
        .map(|market| {
            json!({
                "market_id": market.market_id,
                "question": market.question,
                "liquidity": market.liquidity,
                "volume_24h": market.volume_24h,
                "end_ts_ms": market.end_ts_ms,
                "token_ids": market.token_ids,
            })
        })
        .collect();
    let mut event = DomainEvent::new(
        EventType::CandidateSelected,
        EventPayload::CandidateSelected {
            market_count: markets.len(),
        },
    )
    .at(now);
    event.category = Some(category.to_string());
    event.raw = Some(json!({"markets": listing}));
    let _ = events_tx.send(event);
}

/// Catalog-observed volume spikes on untradeable markets. The first
/// observation of a market only primes its baseline.
fn emit_untradeable_signals(
    cfg: &Config,
    untradeable: &[Market],
    state: &mut RefreshState,
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    now: i64,
) {
    let window_sec = cfg.app.refresh_interval_sec;
    let threshold = cfg.signals.big_volume_1m_usd.to_f64().unwrap_or(0.0)
        * (window_sec.max(1) as f64)
        / 60.0;
    let cooldown_ms = cfg.signals.cooldown_sec as i64 * 1000;

    for market in untradeable {
        let volume = market.volume_24h.unwrap_or(0.0);
        let Some(prev) = state
            .prev_volume
            .insert(market.market_id.clone(), volume)
        else {
            continue;
        };
        let delta = (volume - prev).max(0.0);
        if delta < threshold {
            continue;
        }
        let last_emit = state
            .polling_last_emit
            .get(&market.market_id)
            .copied()
            .unwrap_or(0);
        if now - last_emit < cooldown_ms {
            continue;
        }
        state.polling_last_emit.insert(market.market_id.clone(), now);

        let mut event = DomainEvent::new(
            EventType::TradeSignal,
            EventPayload::Signal(SignalPayload::WebVolumeSpike {
                delta_volume: delta,
                volume_24h: volume,
                window_sec,
                source: "gamma".to_string(),
                orderbook: false,
            }),
        )
        .at(now);
        event.category = market.category.clone();
        event.market_id = Some(market.market_id.clone());
        event.title = Some(market.question.clone());
        event.topic_key = market.topic_key.clone();
        info!(
            market_id = %market.market_id,
            delta_volume = delta,
            "web volume spike on untradeable market"
        );
        let _ = events_tx.send(event);
    }
}

fn emit_health(
    events_tx: &mpsc::UnboundedSender<DomainEvent>,
    status: &str,
    duration_ms: Option<i64>,
    error: Option<String>,
) {
    let event = DomainEvent::new(
        EventType::HealthEvent,
        EventPayload::Health {
            status: status.to_string(),
            duration_ms,
            error,
        },
    );
    let _ = events_tx.send(event);
}

/// Enrich a feed lifecycle message from the known universe; unknown
/// markets are dropped.
fn feed_lifecycle_event(payload: &Value, universe: &Universe, now: i64) -> Option<DomainEvent> {
    let hint = payload
        .get("event_type")
        .or_else(|| payload.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    let status = if hint == "new_market" { "new" } else { "resolved" };

    let market_id = ["market", "conditionId", "condition_id", "market_id", "marketId"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string());
    let token_id = extract_token_id(payload).or_else(|| {
        payload
            .get("assets_ids")
            .or_else(|| payload.get("asset_ids"))
            .and_then(|v| v.as_array())
            .and_then(|ids| ids.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });

    let meta = token_id
        .as_deref()
        .and_then(|token| universe.token_meta.get(token));
    let market = market_id
        .as_deref()
        .and_then(|id| universe.markets_by_id.get(id));
    if meta.is_none() && market.is_none() {
        return None;
    }

    let mut event = DomainEvent::new(
        EventType::MarketLifecycle,
        EventPayload::Lifecycle {
            status: status.to_string(),
            end_ts_ms: market.and_then(|m| m.end_ts_ms),
        },
    )
    .at(now);
    event.category = meta
        .map(|m| m.category.clone())
        .or_else(|| market.and_then(|m| m.category.clone()));
    event.market_id = market_id.or_else(|| meta.map(|m| m.market_id.clone()));
    event.token_id = token_id;
    event.title = meta
        .and_then(|m| m.title.clone())
        .or_else(|| market.map(|m| m.question.clone()));
    event.topic_key = meta
        .and_then(|m| m.topic_key.clone())
        .or_else(|| market.and_then(|m| m.topic_key.clone()));
    event.raw = Some(payload.clone());
    Some(event)
}

#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    cfg: Config,
    mut feed: FeedHandle,
    controller: FeedController,
    engine: Arc<Mutex<SignalEngine>>,
    registry: Arc<Mutex<OrderBookRegistry>>,
    universe: Arc<Mutex<Universe>>,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut resync = ResyncGate::new(cfg.clob.resync_on_gap, cfg.clob.resync_min_interval_sec);
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => return,
            message = feed.next() => match message {
                Some(message) => message,
                None => {
                    info!("feed message stream ended");
                    return;
                }
            },
        };

        match message {
            FeedMessage::Trade(payload) => {
                let Some(trade) = parse_trade(&payload) else {
                    debug!("unparseable trade message dropped");
                    continue;
                };
                let now = now_ms();
                let schedule = engine
                    .lock()
                    .expect("signal engine lock poisoned")
                    .handle_trade(&trade, now);
                if let Some(schedule) = schedule {
                    schedule_flush(engine.clone(), schedule);
                }
            }
            FeedMessage::Book(payload) => {
                let Some(book) = parse_book(&payload) else {
                    debug!("unparseable book message dropped");
                    continue;
                };
                let update = registry
                    .lock()
                    .expect("book registry lock poisoned")
                    .apply_snapshot(book, &payload);
                route_book_update(update, &engine, &controller, &mut resync);
            }
            FeedMessage::PriceChange(payload) => {
                let update = registry
                    .lock()
                    .expect("book registry lock poisoned")
                    .apply_price_change(&payload);
                route_book_update(update, &engine, &controller, &mut resync);
            }
            FeedMessage::MarketLifecycle(payload) => {
                let event = {
                    let universe = universe.lock().expect("universe lock poisoned");
                    feed_lifecycle_event(&payload, &universe, now_ms())
                };
                match event {
                    Some(event) => {
                        let _ = events_tx.send(event);
                    }
                    None => debug!("feed lifecycle for unknown market dropped"),
                }
            }
            FeedMessage::BestBidAsk(_) => debug!("best bid/ask update"),
            FeedMessage::Unknown(payload) => debug!(?payload, "feed message ignored"),
        }
    }
}

fn route_book_update(
    update: BookUpdate,
    engine: &Arc<Mutex<SignalEngine>>,
    controller: &FeedController,
    resync: &mut ResyncGate,
) {
    if update.resync_needed {
        if resync.should_resync() {
            warn!(
                token_id = ?update.token_id,
                expected = ?update.expected_seq,
                received = ?update.received_seq,
                "sequence gap, resubscribing"
            );
            controller.resubscribe();
        }
        return;
    }
    if let Some(snapshot) = update.snapshot {
        engine
            .lock()
            .expect("signal engine lock poisoned")
            .handle_book(&snapshot, now_ms());
    }
}

async fn sink_pump(
    sink: Arc<MultiplexSink>,
    mut events_rx: mpsc::UnboundedReceiver<DomainEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if let Err(error) = sink.publish(&event).await {
            warn!(%error, event_type = event.event_type.as_str(), "event delivery failed");
        }
    }
}
