//! Signal engine: per-token trade windows, cooldowns, the major-change
//! detector, wall detection, and merge buckets.
//!
//! The engine is synchronous; emitted events go out through an unbounded
//! channel and merge-bucket flushes are scheduled by the caller via
//! [`schedule_flush`]. A bucket that disappears (registry update) turns its
//! pending flush into a no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};

use common::clock::now_ms;
use common::config::SignalConfig;
use common::events::{DomainEvent, EventPayload, EventType, SignalPayload};
use common::models::{BookSnapshot, TokenMeta, TradeTick};

/// Rolling 60-second notional window for one token.
#[derive(Debug, Default)]
struct TradeWindow {
    entries: VecDeque<(i64, Decimal)>,
    total: Decimal,
}

impl TradeWindow {
    fn add(&mut self, ts_ms: i64, notional: Decimal) {
        self.entries.push_back((ts_ms, notional));
        self.total += notional;
    }

    fn trim(&mut self, cutoff_ms: i64) {
        while let Some(&(ts_ms, notional)) = self.entries.front() {
            if ts_ms >= cutoff_ms {
                break;
            }
            self.entries.pop_front();
            self.total -= notional;
        }
    }
}

/// Merge-bucket key: `(market_id, upper(side) or "N/A")`.
pub type BucketKey = (String, String);

#[derive(Debug)]
struct TradeBucket {
    token_id: String,
    total_notional: Decimal,
    total_size: Decimal,
    last_price: Decimal,
    last_size: Decimal,
    max_vol_1m: Option<Decimal>,
    has_big_trade: bool,
    has_volume_spike: bool,
}

/// A bucket flush the caller must schedule.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    pub key: BucketKey,
    pub delay: Duration,
}

pub struct SignalEngine {
    cfg: SignalConfig,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    token_meta: HashMap<String, TokenMeta>,
    windows: HashMap<String, TradeWindow>,
    cooldowns: HashMap<(String, &'static str), i64>,
    last_price: HashMap<String, (Decimal, i64)>,
    best_quote: HashMap<String, (Decimal, Decimal)>,
    buckets: HashMap<BucketKey, TradeBucket>,
}

impl SignalEngine {
    pub fn new(cfg: SignalConfig, events_tx: mpsc::UnboundedSender<DomainEvent>) -> Self {
        Self {
            cfg,
            events_tx,
            token_meta: HashMap::new(),
            windows: HashMap::new(),
            cooldowns: HashMap::new(),
            last_price: HashMap::new(),
            best_quote: HashMap::new(),
            buckets: HashMap::new(),
        }
    }

    /// Replace the known-token set; state keyed to removed tokens is
    /// purged, including in-flight merge buckets of vanished markets.
    pub fn update_registry(&mut self, token_meta: HashMap<String, TokenMeta>) {
        self.windows.retain(|token, _| token_meta.contains_key(token));
        self.cooldowns
            .retain(|(token, _), _| token_meta.contains_key(token));
        self.last_price
            .retain(|token, _| token_meta.contains_key(token));
        self.best_quote
            .retain(|token, _| token_meta.contains_key(token));

        if !self.buckets.is_empty() {
            let active_markets: HashSet<&String> =
                token_meta.values().map(|meta| &meta.market_id).collect();
            self.buckets
                .retain(|(market_id, _), _| active_markets.contains(market_id));
        }
        self.token_meta = token_meta;
    }

    pub fn known_tokens(&self) -> usize {
        self.token_meta.len()
    }

    /// Process one trade. Returns a flush to schedule when the trade opened
    /// a new merge bucket.
    pub fn handle_trade(&mut self, trade: &TradeTick, now_ms: i64) -> Option<FlushSchedule> {
        let meta = self.token_meta.get(&trade.token_id)?.clone();
        if self.is_market_expired(&meta, now_ms) {
            info!(
                market_id = %meta.market_id,
                token_id = %meta.token_id,
                "signal suppressed: market expired"
            );
            return None;
        }

        let notional = trade.notional();
        let vol_1m = {
            let window = self.windows.entry(trade.token_id.clone()).or_default();
            window.add(trade.ts_ms, notional);
            window.trim(now_ms - 60_000);
            window.total
        };

        if self.cfg.major_change_source.covers_trades() {
            self.maybe_emit_major_change(
                &meta,
                trade.price,
                trade.ts_ms,
                Some(notional),
                "trade",
                None,
                None,
                now_ms,
            );
        }

        let is_big_trade = notional >= self.cfg.big_trade_usd;
        let is_volume_spike = vol_1m >= self.cfg.big_volume_1m_usd;
        if !is_big_trade && !is_volume_spike {
            return None;
        }

        if self.is_high_confidence(trade.price) {
            if !self.is_reverse_allow(trade.price) {
                info!(
                    market_id = %meta.market_id,
                    token_id = %meta.token_id,
                    price = %trade.price,
                    "signal suppressed: high confidence"
                );
                return None;
            }
            debug!(
                token_id = %meta.token_id,
                price = %trade.price,
                "signal allowed: reverse side under threshold"
            );
        }

        if self.cfg.merge_window_sec > 0.0 {
            return self.deposit_bucket(&meta, trade, notional, vol_1m, is_big_trade, is_volume_spike);
        }

        if is_big_trade && is_volume_spike {
            info!(token_id = %meta.token_id, "volume spike folded into big trade");
            self.emit_signal(
                &meta,
                SignalPayload::BigTrade {
                    notional,
                    price: trade.price,
                    size: trade.size,
                    vol_1m: Some(vol_1m),
                },
                EventType::TradeSignal,
                now_ms,
            );
            return None;
        }

        if is_big_trade {
            self.emit_signal(
                &meta,
                SignalPayload::BigTrade {
                    notional,
                    price: trade.price,
                    size: trade.size,
                    vol_1m: None,
                },
                EventType::TradeSignal,
                now_ms,
            );
        }

        if is_volume_spike {
            self.emit_signal(
                &meta,
                SignalPayload::VolumeSpike1m {
                    vol_1m,
                    price: trade.price,
                    size: trade.size,
                },
                EventType::TradeSignal,
                now_ms,
            );
        }
        None
    }

    /// Process one reconstructed book snapshot.
    pub fn handle_book(&mut self, book: &BookSnapshot, now_ms: i64) {
        let Some(meta) = self.token_meta.get(&book.token_id).cloned() else {
            return;
        };
        if self.is_market_expired(&meta, now_ms) {
            info!(
                market_id = %meta.market_id,
                token_id = %meta.token_id,
                "signal suppressed: market expired"
            );
            return;
        }

        let best_bid = book.best_bid();
        let best_ask = book.best_ask();
        match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                self.best_quote.insert(book.token_id.clone(), (bid, ask));
            }
            _ => {
                self.best_quote.remove(&book.token_id);
            }
        }

        if self.cfg.major_change_source.covers_books() {
            if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
                let mid = (bid + ask) / Decimal::TWO;
                self.maybe_emit_major_change(
                    &meta,
                    mid,
                    book.ts_ms,
                    None,
                    "book",
                    Some(bid),
                    Some(ask),
                    now_ms,
                );
            }
        }

        let Some(wall_size) = self.cfg.big_wall_size else {
            return;
        };
        let max_bid = book
            .bids
            .iter()
            .map(|level| level.size)
            .max()
            .unwrap_or(Decimal::ZERO);
        let max_ask = book
            .asks
            .iter()
            .map(|level| level.size)
            .max()
            .unwrap_or(Decimal::ZERO);
        if max_bid.max(max_ask) < wall_size {
            return;
        }
        self.emit_signal(
            &meta,
            SignalPayload::BigWall {
                max_bid,
                max_ask,
                threshold: wall_size,
            },
            EventType::BookSignal,
            now_ms,
        );
    }

    fn deposit_bucket(
        &mut self,
        meta: &TokenMeta,
        trade: &TradeTick,
        notional: Decimal,
        vol_1m: Decimal,
        is_big_trade: bool,
        is_volume_spike: bool,
    ) -> Option<FlushSchedule> {
        let key = bucket_key(meta);
        let mut opened = false;
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            opened = true;
            TradeBucket {
                token_id: meta.token_id.clone(),
                total_notional: Decimal::ZERO,
                total_size: Decimal::ZERO,
                last_price: Decimal::ZERO,
                last_size: Decimal::ZERO,
                max_vol_1m: None,
                has_big_trade: false,
                has_volume_spike: false,
            }
        });

        bucket.token_id = meta.token_id.clone();
        bucket.last_price = trade.price;
        bucket.last_size = trade.size;
        if is_big_trade {
            bucket.has_big_trade = true;
            bucket.total_notional += notional;
            bucket.total_size += trade.size;
        }
        if is_volume_spike {
            bucket.has_volume_spike = true;
            bucket.max_vol_1m = Some(match bucket.max_vol_1m {
                Some(max) => max.max(vol_1m),
                None => vol_1m,
            });
        }

        opened.then(|| FlushSchedule {
            key,
            delay: Duration::from_secs_f64(self.cfg.merge_window_sec),
        })
    }

    /// Emit the merged signal for `key`, if the bucket still exists.
    pub fn flush_bucket(&mut self, key: &BucketKey, now_ms: i64) {
        let Some(bucket) = self.buckets.remove(key) else {
            return;
        };
        let Some(meta) = self.token_meta.get(&bucket.token_id).cloned() else {
            return;
        };
        if self.is_market_expired(&meta, now_ms) {
            info!(
                market_id = %meta.market_id,
                token_id = %meta.token_id,
                "signal suppressed: market expired"
            );
            return;
        }

        let payload = if bucket.has_big_trade {
            let price = if bucket.total_size > Decimal::ZERO {
                bucket.total_notional / bucket.total_size
            } else {
                bucket.last_price
            };
            let size = if bucket.total_size > Decimal::ZERO {
                bucket.total_size
            } else {
                bucket.last_size
            };
            SignalPayload::BigTrade {
                notional: bucket.total_notional,
                price,
                size,
                vol_1m: bucket.max_vol_1m,
            }
        } else {
            SignalPayload::VolumeSpike1m {
                vol_1m: bucket.max_vol_1m.unwrap_or(Decimal::ZERO),
                price: bucket.last_price,
                size: bucket.last_size,
            }
        };

        info!(
            market_id = %meta.market_id,
            token_id = %meta.token_id,
            signal = payload.name(),
            window_sec = self.cfg.merge_window_sec,
            "merged trade signals flushed"
        );
        self.emit_signal(&meta, payload, EventType::TradeSignal, now_ms);
    }

    fn is_market_expired(&self, meta: &TokenMeta, now_ms: i64) -> bool {
        if !self.cfg.drop_expired_markets {
            return false;
        }
        meta.end_ts_ms.map_or(false, |end| now_ms >= end)
    }

    fn is_high_confidence(&self, price: Decimal) -> bool {
        if self.cfg.high_confidence_threshold <= Decimal::ZERO {
            return false;
        }
        if price < Decimal::ZERO || price > Decimal::ONE {
            return false;
        }
        let confidence = price.max(Decimal::ONE - price);
        confidence >= self.cfg.high_confidence_threshold
    }

    fn is_reverse_allow(&self, price: Decimal) -> bool {
        if self.cfg.reverse_allow_threshold <= Decimal::ZERO {
            return false;
        }
        if price < Decimal::ZERO || price > Decimal::ONE {
            return false;
        }
        price <= self.cfg.reverse_allow_threshold
    }

    #[allow(clippy::too_many_arguments)]
    fn maybe_emit_major_change(
        &mut self,
        meta: &TokenMeta,
        price: Decimal,
        ts_ms: i64,
        notional: Option<Decimal>,
        source: &str,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        now_ms: i64,
    ) {
        if self.cfg.major_change_pct <= Decimal::ZERO {
            return;
        }
        // read-then-overwrite: the current observation always becomes the
        // new reference point
        let previous = self.last_price.insert(meta.token_id.clone(), (price, ts_ms));
        let Some((prev_price, prev_ts)) = previous else {
            return;
        };
        if prev_price <= Decimal::ZERO {
            return;
        }
        let window_ms = self.cfg.major_change_window_sec as i64 * 1000;
        if ts_ms - prev_ts > window_ms {
            return;
        }

        let delta = price - prev_price;
        let abs_delta = delta.abs();

        if self.cfg.major_change_spread_gate_k > Decimal::ZERO {
            if let Some(spread) = self.resolve_spread(&meta.token_id, best_bid, best_ask) {
                if spread > Decimal::ZERO
                    && abs_delta <= self.cfg.major_change_spread_gate_k * spread
                {
                    debug!(
                        token_id = %meta.token_id,
                        spread = %spread,
                        delta = %abs_delta,
                        "signal suppressed: within spread gate"
                    );
                    return;
                }
            }
        }

        let pct_signed = delta / prev_price * Decimal::ONE_HUNDRED;
        let pct = pct_signed.abs();
        if self.use_low_price_abs(prev_price, price) {
            if abs_delta < self.cfg.major_change_low_price_abs {
                debug!(
                    token_id = %meta.token_id,
                    delta = %abs_delta,
                    "signal suppressed: below low-price absolute threshold"
                );
                return;
            }
        } else if pct < self.cfg.major_change_pct {
            return;
        }

        if self.cfg.major_change_min_notional > Decimal::ZERO
            && notional.map_or(true, |value| value < self.cfg.major_change_min_notional)
        {
            return;
        }

        let direction = if pct_signed > Decimal::ZERO { "up" } else { "down" };
        self.emit_signal(
            meta,
            SignalPayload::MajorChange {
                pct_change: pct.round_dp(4),
                pct_change_signed: pct_signed.round_dp(4),
                direction: direction.to_string(),
                price,
                prev_price,
                window_sec: self.cfg.major_change_window_sec,
                notional: notional.unwrap_or(Decimal::ZERO),
                source: source.to_string(),
            },
            EventType::TradeSignal,
            now_ms,
        );
    }

    fn use_low_price_abs(&self, prev_price: Decimal, price: Decimal) -> bool {
        if self.cfg.major_change_low_price_abs <= Decimal::ZERO {
            return false;
        }
        if self.cfg.major_change_low_price_max <= Decimal::ZERO {
            return false;
        }
        prev_price.min(price) <= self.cfg.major_change_low_price_max
    }

    fn resolve_spread(
        &self,
        token_id: &str,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Option<Decimal> {
        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            return Some((ask - bid).max(Decimal::ZERO));
        }
        let (bid, ask) = self.best_quote.get(token_id)?;
        Some((ask - bid).max(Decimal::ZERO))
    }

    fn emit_signal(
        &mut self,
        meta: &TokenMeta,
        payload: SignalPayload,
        event_type: EventType,
        now_ms: i64,
    ) {
        let cooldown_key = (meta.token_id.clone(), payload.name());
        let last_emit = self.cooldowns.get(&cooldown_key).copied().unwrap_or(0);
        let cooldown_ms = self.cfg.cooldown_sec as i64 * 1000;
        if now_ms - last_emit < cooldown_ms {
            return;
        }
        self.cooldowns.insert(cooldown_key, now_ms);

        let signal = payload.name();
        let mut event =
            DomainEvent::new(event_type, EventPayload::Signal(payload)).at(now_ms);
        event.category = Some(meta.category.clone());
        event.market_id = Some(meta.market_id.clone());
        event.token_id = Some(meta.token_id.clone());
        event.side = meta.side.clone();
        event.title = meta.title.clone();
        event.topic_key = meta.topic_key.clone();

        info!(
            event_type = event.event_type.as_str(),
            signal,
            market_id = %meta.market_id,
            token_id = %meta.token_id,
            "signal emitted"
        );
        let _ = self.events_tx.send(event);
    }
}

fn bucket_key(meta: &TokenMeta) -> BucketKey {
    let side = meta
        .side
        .as_deref()
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| "N/A".to_string());
    (meta.market_id.clone(), side)
}

/// Run a bucket flush after its merge window. Removal of the bucket in the
/// meantime makes this a no-op.
pub fn schedule_flush(engine: Arc<Mutex<SignalEngine>>, schedule: FlushSchedule) {
    tokio::spawn(async move {
        tokio::time::sleep(schedule.delay).await;
        let now = now_ms();
        engine
            .lock()
            .expect("signal engine lock poisoned")
            .flush_bucket(&schedule.key, now);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::MajorChangeSource;
    use common::models::BookLevel;
    use rust_decimal_macros::dec;

    const NOW: i64 = 1_700_000_000_000;

    fn test_cfg() -> SignalConfig {
        SignalConfig {
            big_trade_usd: dec!(10000),
            big_volume_1m_usd: dec!(25000),
            big_wall_size: None,
            cooldown_sec: 0,
            major_change_pct: dec!(5),
            major_change_window_sec: 60,
            major_change_min_notional: Decimal::ZERO,
            major_change_source: MajorChangeSource::Trade,
            major_change_low_price_max: Decimal::ZERO,
            major_change_low_price_abs: Decimal::ZERO,
            major_change_spread_gate_k: Decimal::ZERO,
            high_confidence_threshold: Decimal::ZERO,
            reverse_allow_threshold: Decimal::ZERO,
            merge_window_sec: 0.0,
            drop_expired_markets: true,
        }
    }

    fn meta(token: &str, market: &str) -> TokenMeta {
        TokenMeta {
            token_id: token.to_string(),
            market_id: market.to_string(),
            category: "finance".to_string(),
            title: Some("Test market?".to_string()),
            side: Some("YES".to_string()),
            topic_key: Some("test market".to_string()),
            end_ts_ms: None,
        }
    }

    fn engine_with(
        cfg: SignalConfig,
        metas: &[TokenMeta],
    ) -> (SignalEngine, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = SignalEngine::new(cfg, tx);
        engine.update_registry(
            metas
                .iter()
                .map(|m| (m.token_id.clone(), m.clone()))
                .collect(),
        );
        (engine, rx)
    }

    fn trade(token: &str, price: Decimal, size: Decimal, ts_ms: i64) -> TradeTick {
        TradeTick {
            token_id: token.to_string(),
            market_id: None,
            side: Some("BUY".to_string()),
            price,
            size,
            ts_ms,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DomainEvent>) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn big_trade_at_threshold_emits() {
        let (mut engine, mut rx) = engine_with(test_cfg(), &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW), NOW);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, EventType::TradeSignal);
        match &event.payload {
            EventPayload::Signal(SignalPayload::BigTrade {
                notional,
                price,
                size,
                vol_1m,
            }) => {
                assert_eq!(*notional, dec!(10000));
                assert_eq!(*price, dec!(1.0));
                assert_eq!(*size, dec!(10000));
                assert!(vol_1m.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn one_cent_under_threshold_does_not_emit() {
        let (mut engine, mut rx) = engine_with(test_cfg(), &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(9999.99), NOW), NOW);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn volume_spike_builds_over_window() {
        let cfg = SignalConfig {
            big_volume_1m_usd: dec!(100),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(2), dec!(20), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(2), dec!(20), NOW + 10_000), NOW + 10_000);
        assert!(drain(&mut rx).is_empty());
        engine.handle_trade(&trade("t1", dec!(2), dec!(20), NOW + 20_000), NOW + 20_000);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::VolumeSpike1m { vol_1m, .. }) => {
                assert_eq!(*vol_1m, dec!(120));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn window_trims_entries_older_than_sixty_seconds() {
        let cfg = SignalConfig {
            big_volume_1m_usd: dec!(100),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(2), dec!(30), NOW), NOW);
        // 61s later the first notional is out of the window
        engine.handle_trade(&trade("t1", dec!(2), dec!(30), NOW + 61_000), NOW + 61_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn cooldown_suppresses_repeat_emission() {
        let cfg = SignalConfig {
            cooldown_sec: 60,
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW + 30_000), NOW + 30_000);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn cooldown_elapsed_allows_emission() {
        let cfg = SignalConfig {
            cooldown_sec: 60,
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW + 60_000), NOW + 60_000);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn both_flags_fold_into_single_big_trade() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(50),
            big_volume_1m_usd: dec!(50),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1), dec!(60), NOW), NOW);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::BigTrade { vol_1m, .. }) => {
                assert_eq!(*vol_1m, Some(dec!(60)));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn expired_market_suppresses() {
        let mut expired = meta("t1", "m1");
        expired.end_ts_ms = Some(NOW);
        let (mut engine, mut rx) = engine_with(test_cfg(), &[expired]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(10000), NOW), NOW);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn high_confidence_suppresses_unless_reverse_allowed() {
        let cfg = SignalConfig {
            high_confidence_threshold: dec!(0.9),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(0.95), dec!(20000), NOW), NOW);
        assert!(drain(&mut rx).is_empty());

        let cfg = SignalConfig {
            high_confidence_threshold: dec!(0.9),
            reverse_allow_threshold: dec!(0.1),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(0.05), dec!(300000), NOW), NOW);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn major_change_boundary() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(1000000),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg.clone(), &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(0.40), dec!(1), NOW), NOW);
        // exactly +5 percent
        engine.handle_trade(&trade("t1", dec!(0.42), dec!(1), NOW + 1_000), NOW + 1_000);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::MajorChange {
                pct_change,
                pct_change_signed,
                direction,
                ..
            }) => {
                assert_eq!(*pct_change, dec!(5));
                assert_eq!(*pct_change_signed, dec!(5));
                assert_eq!(direction, "up");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // a basis point under the threshold stays silent
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(1.0), dec!(1), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(1.0499), dec!(1), NOW + 1_000), NOW + 1_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn major_change_observation_window() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(1000000),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(0.40), dec!(1), NOW), NOW);
        // previous observation too old to compare against
        engine.handle_trade(&trade("t1", dec!(0.80), dec!(1), NOW + 61_000), NOW + 61_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn major_change_low_price_regime_uses_absolute_delta() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(1000000),
            major_change_low_price_max: dec!(0.10),
            major_change_low_price_abs: dec!(0.03),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        // +50 percent but only 2 cents: below the absolute floor
        engine.handle_trade(&trade("t1", dec!(0.04), dec!(1), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(0.06), dec!(1), NOW + 1_000), NOW + 1_000);
        assert!(drain(&mut rx).is_empty());
        // 3 cents clears it
        engine.handle_trade(&trade("t1", dec!(0.09), dec!(1), NOW + 2_000), NOW + 2_000);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn major_change_min_notional_gate() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(1000000),
            major_change_min_notional: dec!(100),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t1", dec!(0.40), dec!(10), NOW), NOW);
        engine.handle_trade(&trade("t1", dec!(0.50), dec!(10), NOW + 1_000), NOW + 1_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn major_change_spread_gate() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(1000000),
            major_change_source: MajorChangeSource::Book,
            major_change_spread_gate_k: dec!(2),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        let book = |bid: Decimal, ask: Decimal, ts: i64| BookSnapshot {
            token_id: "t1".to_string(),
            bids: vec![BookLevel {
                price: bid,
                size: dec!(10),
            }],
            asks: vec![BookLevel {
                price: ask,
                size: dec!(10),
            }],
            ts_ms: ts,
        };
        // mid moves 7.3 percent but only 0.03 absolute with spread 0.02:
        // delta <= k * spread, so the move is inside the gate
        engine.handle_book(&book(dec!(0.40), dec!(0.42), NOW), NOW);
        engine.handle_book(&book(dec!(0.43), dec!(0.45), NOW + 1_000), NOW + 1_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn big_wall_emits_book_signal() {
        let cfg = SignalConfig {
            big_wall_size: Some(dec!(5000)),
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        let book = BookSnapshot {
            token_id: "t1".to_string(),
            bids: vec![BookLevel {
                price: dec!(0.5),
                size: dec!(6000),
            }],
            asks: vec![BookLevel {
                price: dec!(0.6),
                size: dec!(100),
            }],
            ts_ms: NOW,
        };
        engine.handle_book(&book, NOW);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BookSignal);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::BigWall { max_bid, max_ask, threshold }) => {
                assert_eq!(*max_bid, dec!(6000));
                assert_eq!(*max_ask, dec!(100));
                assert_eq!(*threshold, dec!(5000));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn merge_bucket_accumulates_and_flushes_once() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(100),
            merge_window_sec: 2.0,
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        let first = engine.handle_trade(&trade("t1", dec!(0.5), dec!(400), NOW), NOW);
        let schedule = first.expect("first deposit schedules a flush");
        assert_eq!(schedule.key, ("m1".to_string(), "YES".to_string()));
        let second = engine.handle_trade(&trade("t1", dec!(0.6), dec!(500), NOW + 500), NOW + 500);
        assert!(second.is_none());
        assert!(drain(&mut rx).is_empty());

        engine.flush_bucket(&schedule.key, NOW + 2_500);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::BigTrade {
                notional,
                price,
                size,
                ..
            }) => {
                // 0.5*400 + 0.6*500 = 500; sizes 900; avg 500/900
                assert_eq!(*notional, dec!(500));
                assert_eq!(*size, dec!(900));
                assert_eq!(*price, dec!(500) / dec!(900));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        // second flush of the same key is a no-op
        engine.flush_bucket(&schedule.key, NOW + 3_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn merge_bucket_volume_spike_only() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(1000000),
            big_volume_1m_usd: dec!(50),
            merge_window_sec: 1.0,
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        let schedule = engine
            .handle_trade(&trade("t1", dec!(0.5), dec!(120), NOW), NOW)
            .expect("flush scheduled");
        engine.handle_trade(&trade("t1", dec!(0.5), dec!(40), NOW + 100), NOW + 100);
        engine.flush_bucket(&schedule.key, NOW + 1_200);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Signal(SignalPayload::VolumeSpike1m { vol_1m, price, size }) => {
                assert_eq!(*vol_1m, dec!(80));
                assert_eq!(*price, dec!(0.5));
                assert_eq!(*size, dec!(40));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn registry_update_purges_state_and_buckets() {
        let cfg = SignalConfig {
            big_trade_usd: dec!(100),
            merge_window_sec: 5.0,
            ..test_cfg()
        };
        let (mut engine, mut rx) = engine_with(cfg, &[meta("t1", "m1")]);
        let schedule = engine
            .handle_trade(&trade("t1", dec!(0.5), dec!(400), NOW), NOW)
            .expect("flush scheduled");

        // market leaves the universe before the flush fires
        engine.update_registry(HashMap::new());
        engine.flush_bucket(&schedule.key, NOW + 6_000);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.known_tokens(), 0);
    }

    #[test]
    fn unknown_token_is_ignored() {
        let (mut engine, mut rx) = engine_with(test_cfg(), &[meta("t1", "m1")]);
        engine.handle_trade(&trade("t9", dec!(1.0), dec!(10000), NOW), NOW);
        assert!(drain(&mut rx).is_empty());
    }
}
