//! Per-token order-book state built from snapshot + delta messages.
//!
//! The registry detects sequence gaps and reports them; it never requests a
//! resync itself, that decision belongs to the orchestrator.

use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clob::{extract_sequence, extract_token_id, extract_ts_ms, parse_price_changes};
use crate::models::{BookLevel, BookSnapshot};

/// Outcome of applying one feed message to the registry.
#[derive(Debug, Clone, Default)]
pub struct BookUpdate {
    pub token_id: Option<String>,
    pub snapshot: Option<BookSnapshot>,
    pub resync_needed: bool,
    pub expected_seq: Option<u64>,
    pub received_seq: Option<u64>,
}

/// Book state for one token. Levels with non-positive size are never
/// retained.
#[derive(Debug, Clone)]
pub struct OrderBookState {
    token_id: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_seq: Option<u64>,
    last_ts_ms: Option<i64>,
}

impl OrderBookState {
    fn new(token_id: String) -> Self {
        Self {
            token_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: None,
            last_ts_ms: None,
        }
    }

    fn install_snapshot(&mut self, snapshot: &BookSnapshot, seq: Option<u64>) {
        self.bids = snapshot
            .bids
            .iter()
            .filter(|level| level.size > Decimal::ZERO)
            .map(|level| (level.price, level.size))
            .collect();
        self.asks = snapshot
            .asks
            .iter()
            .filter(|level| level.size > Decimal::ZERO)
            .map(|level| (level.price, level.size))
            .collect();
        if seq.is_some() {
            self.last_seq = seq;
        }
        self.last_ts_ms = Some(snapshot.ts_ms);
    }

    fn apply_change(&mut self, side: &str, price: Decimal, size: Decimal) {
        let book = if side == "BUY" {
            &mut self.bids
        } else {
            &mut self.asks
        };
        if size <= Decimal::ZERO {
            book.remove(&price);
        } else {
            book.insert(price, size);
        }
    }

    fn to_snapshot(&self) -> BookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .map(|(&price, &size)| BookLevel { price, size })
            .collect();
        let asks = self
            .asks
            .iter()
            .map(|(&price, &size)| BookLevel { price, size })
            .collect();
        BookSnapshot {
            token_id: self.token_id.clone(),
            bids,
            asks,
            ts_ms: self.last_ts_ms.unwrap_or(0),
        }
    }

    fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_seq = None;
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

fn sequence_gap(last_seq: Option<u64>, next_seq: Option<u64>) -> (bool, Option<u64>) {
    let (Some(last), Some(next)) = (last_seq, next_seq) else {
        return (false, None);
    };
    let expected = last + 1;
    (next != expected, Some(expected))
}

/// All per-token book state.
#[derive(Debug, Default)]
pub struct OrderBookRegistry {
    books: HashMap<String, OrderBookState>,
}

impl OrderBookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book for `snapshot.token_id`. A sequence gap clears the
    /// book and reports `resync_needed` without installing the snapshot.
    pub fn apply_snapshot(&mut self, snapshot: BookSnapshot, payload: &Value) -> BookUpdate {
        let token_id = snapshot.token_id.clone();
        let seq = extract_sequence(payload);
        let state = self
            .books
            .entry(token_id.clone())
            .or_insert_with(|| OrderBookState::new(token_id.clone()));

        let (gap, expected) = sequence_gap(state.last_seq, seq);
        if gap {
            warn!(
                token_id = %token_id,
                expected_seq = ?expected,
                received_seq = ?seq,
                "orderbook sequence gap on snapshot"
            );
            state.clear();
            return BookUpdate {
                token_id: Some(token_id),
                snapshot: None,
                resync_needed: true,
                expected_seq: expected,
                received_seq: seq,
            };
        }

        state.install_snapshot(&snapshot, seq);
        BookUpdate {
            token_id: Some(token_id),
            snapshot: Some(snapshot),
            ..BookUpdate::default()
        }
    }

    /// Apply a price-change delta. A delta for an unknown token is dropped
    /// (the upstream sends a snapshot on subscribe); a sequence gap clears
    /// the book and reports `resync_needed`.
    pub fn apply_price_change(&mut self, payload: &Value) -> BookUpdate {
        let Some(token_id) = extract_token_id(payload) else {
            return BookUpdate::default();
        };

        let Some(state) = self.books.get_mut(&token_id) else {
            debug!(token_id = %token_id, "price change before snapshot, dropped");
            return BookUpdate {
                token_id: Some(token_id),
                ..BookUpdate::default()
            };
        };

        let seq = extract_sequence(payload);
        let (gap, expected) = sequence_gap(state.last_seq, seq);
        if gap {
            warn!(
                token_id = %token_id,
                expected_seq = ?expected,
                received_seq = ?seq,
                "orderbook sequence gap on price change"
            );
            state.clear();
            return BookUpdate {
                token_id: Some(token_id),
                snapshot: None,
                resync_needed: true,
                expected_seq: expected,
                received_seq: seq,
            };
        }

        let changes = parse_price_changes(payload);
        if changes.is_empty() {
            return BookUpdate {
                token_id: Some(token_id),
                ..BookUpdate::default()
            };
        }

        for change in &changes {
            state.apply_change(&change.side, change.price, change.size);
        }
        if seq.is_some() {
            state.last_seq = seq;
        }
        if let Some(ts_ms) = extract_ts_ms(payload) {
            state.last_ts_ms = Some(ts_ms);
        }
        let snapshot = state.to_snapshot();
        BookUpdate {
            token_id: Some(token_id),
            snapshot: Some(snapshot),
            ..BookUpdate::default()
        }
    }

    /// Drop state for tokens that left the universe.
    pub fn retain_tokens(&mut self, tokens: &HashSet<String>) {
        self.books.retain(|token_id, _| tokens.contains(token_id));
    }

    pub fn book(&self, token_id: &str) -> Option<&OrderBookState> {
        self.books.get(token_id)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
