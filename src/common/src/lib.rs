//! Common library for the polysignal services.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Gamma catalog client
//! - CLOB websocket feed client
//! - Order-book registry
//! - Domain models, events, and selection rules

pub mod clob;
pub mod clock;
pub mod config;
pub mod events;
pub mod gamma;
pub mod models;
pub mod orderbook;
pub mod selection;

pub use clob::{
    classify, parse_book, parse_trade, ClobFeed, FeedCommand, FeedController, FeedHandle,
    FeedMessage,
};
pub use clock::now_ms;
pub use config::{
    ClobConfig, Config, ConfigError, GammaConfig, MajorChangeSource, SignalConfig, SinkConfig,
    SinkMode, TransformMode,
};
pub use events::{DomainEvent, EventPayload, EventType, SignalPayload};
pub use gamma::{GammaClient, GammaError};
pub use models::{
    normalize_side, BookLevel, BookSnapshot, Market, OutcomeToken, Tag, TokenMeta, TradeTick,
};
pub use orderbook::{BookUpdate, OrderBookRegistry};
pub use selection::{normalize_topic, select_primary_markets, select_top_markets};
