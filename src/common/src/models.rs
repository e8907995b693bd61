//! Shared domain models for the market catalog and the streaming feed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A catalog tag used to resolve configured categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: String,
    pub slug: Option<String>,
    pub name: Option<String>,
}

/// One tradable outcome of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub token_id: String,
    pub side: Option<String>,
}

/// A prediction market as parsed from the catalog API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub event_id: Option<String>,
    pub category: Option<String>,
    /// `None` means the catalog did not say; only an explicit `false`
    /// makes the market untradeable on the stream.
    pub enable_orderbook: Option<bool>,
    pub active: bool,
    pub closed: bool,
    pub resolved: bool,
    pub end_ts_ms: Option<i64>,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub token_ids: Vec<String>,
    pub outcomes: Vec<OutcomeToken>,
    pub topic_key: Option<String>,
}

impl Default for Market {
    fn default() -> Self {
        Self {
            market_id: String::new(),
            question: String::new(),
            event_id: None,
            category: None,
            enable_orderbook: None,
            active: true,
            closed: false,
            resolved: false,
            end_ts_ms: None,
            liquidity: None,
            volume_24h: None,
            token_ids: Vec::new(),
            outcomes: Vec::new(),
            topic_key: None,
        }
    }
}

impl Market {
    /// Active, not closed, not resolved.
    pub fn is_live(&self) -> bool {
        self.active && !self.closed && !self.resolved
    }

    /// Live, order book published, and not past its end time.
    pub fn is_tradeable(&self, now_ms: i64) -> bool {
        self.is_live()
            && self.enable_orderbook != Some(false)
            && self.end_ts_ms.map_or(true, |end| end > now_ms)
    }

    /// Live market whose order book is not published on the stream.
    pub fn is_untradeable(&self) -> bool {
        self.is_live() && self.enable_orderbook == Some(false)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.end_ts_ms.map_or(false, |end| end <= now_ms)
    }
}

/// Denormalized per-token registry entry handed to the signal engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub token_id: String,
    pub market_id: String,
    pub category: String,
    pub title: Option<String>,
    pub side: Option<String>,
    pub topic_key: Option<String>,
    pub end_ts_ms: Option<i64>,
}

/// A single trade observed on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub token_id: String,
    pub market_id: Option<String>,
    pub side: Option<String>,
    pub price: Decimal,
    pub size: Decimal,
    pub ts_ms: i64,
}

impl TradeTick {
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// One resting level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// A full order-book snapshot for one token; bids sorted descending,
/// asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts_ms: i64,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|level| level.price).max()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|level| level.price).min()
    }
}

/// Normalize an outcome label: anything containing YES maps to `YES`,
/// anything containing NO maps to `NO`, everything else stays uppercase
/// verbatim (multi-outcome markets).
pub fn normalize_side(value: Option<&str>) -> Option<String> {
    let upper = value?.to_uppercase();
    if upper.contains("YES") {
        Some("YES".to_string())
    } else if upper.contains("NO") {
        Some("NO".to_string())
    } else {
        Some(upper)
    }
}
