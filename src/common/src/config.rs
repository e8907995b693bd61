//! Configuration loading from environment variables.
//!
//! Every knob has a default; the environment (and a `.env` file, if
//! present) overrides it. Malformed values and unknown enum variants are
//! startup-fatal.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_opt_string(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn env_opt_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_opt_string(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env_opt_string(key) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_opt_string(key) {
        Some(value) => split_csv(&value),
        None => default.iter().map(|item| item.to_string()).collect(),
    }
}

/// Parse a route table of the form
/// `TradeSignal=webhook|stdout,HealthEvent=stdout`.
fn parse_routes(value: &str) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let mut routes = HashMap::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (event_type, sinks) =
            entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "SINKS_ROUTES".to_string(),
                    value: entry.to_string(),
                })?;
        let names: Vec<String> = sinks
            .split('|')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        routes.insert(event_type.trim().to_string(), names);
    }
    Ok(routes)
}

/// Top-level application settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub categories: Vec<String>,
    pub refresh_interval_sec: u64,
}

/// Per-category candidate filtering.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// `<= 0` disables truncation.
    pub top_k_per_category: i64,
    pub hot_sort: Vec<String>,
    pub min_liquidity: Option<f64>,
    pub focus_keywords: Vec<String>,
    pub keyword_allow: Vec<String>,
    pub keyword_block: Vec<String>,
}

/// Rolling primary-market selection.
#[derive(Debug, Clone)]
pub struct RollingConfig {
    pub enabled: bool,
    pub primary_selection_priority: Vec<String>,
    pub max_markets_per_topic: usize,
}

/// Cross-category "top" list.
#[derive(Debug, Clone)]
pub struct TopConfig {
    pub enabled: bool,
    pub limit: usize,
    pub order: String,
    pub ascending: bool,
    pub featured_only: bool,
    pub category_name: String,
}

/// Gamma catalog client settings.
#[derive(Debug, Clone)]
pub struct GammaConfig {
    pub base_url: String,
    pub timeout_sec: f64,
    pub page_size: usize,
    pub use_events_endpoint: bool,
    pub events_limit_per_category: Option<usize>,
    pub events_sort_primary: Option<String>,
    pub events_sort_secondary: Option<String>,
    pub events_sort_desc: bool,
    pub related_tags: bool,
    pub request_interval_ms: u64,
    pub tags_cache_sec: u64,
    pub retry_max_attempts: u32,
}

/// CLOB websocket feed settings.
#[derive(Debug, Clone)]
pub struct ClobConfig {
    pub ws_url: String,
    pub channel: String,
    pub custom_feature_enabled: bool,
    pub initial_dump: bool,
    pub max_frame_bytes: usize,
    pub ping_interval_sec: Option<u64>,
    pub ping_message: String,
    pub pong_message: String,
    pub reconnect_backoff_sec: u64,
    pub reconnect_max_sec: u64,
    pub resync_on_gap: bool,
    pub resync_min_interval_sec: u64,
}

/// Which observations drive the major-change detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorChangeSource {
    Trade,
    Book,
    Any,
}

impl MajorChangeSource {
    pub fn covers_trades(&self) -> bool {
        matches!(self, MajorChangeSource::Trade | MajorChangeSource::Any)
    }

    pub fn covers_books(&self) -> bool {
        matches!(self, MajorChangeSource::Book | MajorChangeSource::Any)
    }
}

impl FromStr for MajorChangeSource {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "trade" => Ok(MajorChangeSource::Trade),
            "book" => Ok(MajorChangeSource::Book),
            "any" => Ok(MajorChangeSource::Any),
            _ => Err(()),
        }
    }
}

/// Signal-engine thresholds and gates.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub big_trade_usd: Decimal,
    pub big_volume_1m_usd: Decimal,
    pub big_wall_size: Option<Decimal>,
    pub cooldown_sec: u64,
    pub major_change_pct: Decimal,
    pub major_change_window_sec: u64,
    pub major_change_min_notional: Decimal,
    pub major_change_source: MajorChangeSource,
    pub major_change_low_price_max: Decimal,
    pub major_change_low_price_abs: Decimal,
    pub major_change_spread_gate_k: Decimal,
    pub high_confidence_threshold: Decimal,
    pub reverse_allow_threshold: Decimal,
    pub merge_window_sec: f64,
    pub drop_expired_markets: bool,
}

/// Delivery policy of the sink multiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    BestEffort,
    RequiredSinks,
}

impl FromStr for SinkMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "best_effort" => Ok(SinkMode::BestEffort),
            "required_sinks" => Ok(SinkMode::RequiredSinks),
            _ => Err(()),
        }
    }
}

/// Event shaping before fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Full,
    Compact,
}

impl FromStr for TransformMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "full" => Ok(TransformMode::Full),
            "compact" => Ok(TransformMode::Compact),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StdoutSinkConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WebhookSinkConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub max_retries: u32,
    pub timeout_sec: f64,
    pub aggregate_multi_outcome: bool,
    pub aggregate_window_sec: f64,
    pub aggregate_max_items: usize,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub mode: SinkMode,
    pub required_sinks: Vec<String>,
    pub routes: HashMap<String, Vec<String>>,
    pub transform: TransformMode,
    pub stdout: StdoutSinkConfig,
    pub webhook: WebhookSinkConfig,
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub filters: FilterConfig,
    pub rolling: RollingConfig,
    pub top: TopConfig,
    pub gamma: GammaConfig,
    pub clob: ClobConfig,
    pub signals: SignalConfig,
    pub sinks: SinkConfig,
}

impl Config {
    /// Load configuration, reading a `.env` file first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no `.env`).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let app = AppConfig {
            categories: env_list("APP_CATEGORIES", &["finance", "geopolitics"]),
            refresh_interval_sec: env_parse("APP_REFRESH_INTERVAL_SEC", 60)?,
        };

        let filters = FilterConfig {
            top_k_per_category: env_parse("FILTERS_TOP_K_PER_CATEGORY", 10)?,
            hot_sort: env_list("FILTERS_HOT_SORT", &["liquidity", "volume_24h"]),
            min_liquidity: env_opt_parse("FILTERS_MIN_LIQUIDITY")?,
            focus_keywords: env_list("FILTERS_FOCUS_KEYWORDS", &[]),
            keyword_allow: env_list("FILTERS_KEYWORD_ALLOW", &[]),
            keyword_block: env_list("FILTERS_KEYWORD_BLOCK", &[]),
        };

        let rolling = RollingConfig {
            enabled: env_bool("ROLLING_ENABLED", true)?,
            primary_selection_priority: env_list(
                "ROLLING_PRIMARY_SELECTION_PRIORITY",
                &["liquidity", "volume_24h", "end_ts"],
            ),
            max_markets_per_topic: env_parse("ROLLING_MAX_MARKETS_PER_TOPIC", 1)?,
        };

        let top = TopConfig {
            enabled: env_bool("TOP_ENABLED", false)?,
            limit: env_parse("TOP_LIMIT", 30)?,
            order: env_string("TOP_ORDER", "volume24hr"),
            ascending: env_bool("TOP_ASCENDING", false)?,
            featured_only: env_bool("TOP_FEATURED_ONLY", false)?,
            category_name: env_string("TOP_CATEGORY_NAME", "top"),
        };

        let gamma = GammaConfig {
            base_url: env_string("GAMMA_BASE_URL", "https://gamma-api.polymarket.com"),
            timeout_sec: env_parse("GAMMA_TIMEOUT_SEC", 10.0)?,
            page_size: env_parse("GAMMA_PAGE_SIZE", 200)?,
            use_events_endpoint: env_bool("GAMMA_USE_EVENTS_ENDPOINT", true)?,
            events_limit_per_category: env_opt_parse("GAMMA_EVENTS_LIMIT_PER_CATEGORY")?,
            events_sort_primary: env_opt_string("GAMMA_EVENTS_SORT_PRIMARY")
                .or_else(|| Some("volume24hr".to_string())),
            events_sort_secondary: env_opt_string("GAMMA_EVENTS_SORT_SECONDARY")
                .or_else(|| Some("liquidity".to_string())),
            events_sort_desc: env_bool("GAMMA_EVENTS_SORT_DESC", true)?,
            related_tags: env_bool("GAMMA_RELATED_TAGS", false)?,
            request_interval_ms: env_parse("GAMMA_REQUEST_INTERVAL_MS", 0)?,
            tags_cache_sec: env_parse("GAMMA_TAGS_CACHE_SEC", 600)?,
            retry_max_attempts: env_parse("GAMMA_RETRY_MAX_ATTEMPTS", 5)?,
        };

        let ping_interval_sec: u64 = env_parse("CLOB_PING_INTERVAL_SEC", 10)?;
        let clob = ClobConfig {
            ws_url: env_string(
                "CLOB_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),
            channel: env_string("CLOB_CHANNEL", "market"),
            custom_feature_enabled: env_bool("CLOB_CUSTOM_FEATURE_ENABLED", true)?,
            initial_dump: env_bool("CLOB_INITIAL_DUMP", true)?,
            max_frame_bytes: env_parse("CLOB_MAX_FRAME_BYTES", 100_000)?,
            ping_interval_sec: (ping_interval_sec > 0).then_some(ping_interval_sec),
            ping_message: env_string("CLOB_PING_MESSAGE", "PING"),
            pong_message: env_string("CLOB_PONG_MESSAGE", "pong"),
            reconnect_backoff_sec: env_parse("CLOB_RECONNECT_BACKOFF_SEC", 5)?,
            reconnect_max_sec: env_parse("CLOB_RECONNECT_MAX_SEC", 60)?,
            resync_on_gap: env_bool("CLOB_RESYNC_ON_GAP", true)?,
            resync_min_interval_sec: env_parse("CLOB_RESYNC_MIN_INTERVAL_SEC", 30)?,
        };

        let major_change_source: String = env_string("SIGNALS_MAJOR_CHANGE_SOURCE", "trade");
        let signals = SignalConfig {
            big_trade_usd: env_parse("SIGNALS_BIG_TRADE_USD", Decimal::from(10_000))?,
            big_volume_1m_usd: env_parse("SIGNALS_BIG_VOLUME_1M_USD", Decimal::from(25_000))?,
            big_wall_size: env_opt_parse("SIGNALS_BIG_WALL_SIZE")?,
            cooldown_sec: env_parse("SIGNALS_COOLDOWN_SEC", 120)?,
            major_change_pct: env_parse("SIGNALS_MAJOR_CHANGE_PCT", Decimal::from(5))?,
            major_change_window_sec: env_parse("SIGNALS_MAJOR_CHANGE_WINDOW_SEC", 60)?,
            major_change_min_notional: env_parse(
                "SIGNALS_MAJOR_CHANGE_MIN_NOTIONAL",
                Decimal::ZERO,
            )?,
            major_change_source: major_change_source.parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "SIGNALS_MAJOR_CHANGE_SOURCE".to_string(),
                    value: major_change_source,
                }
            })?,
            major_change_low_price_max: env_parse(
                "SIGNALS_MAJOR_CHANGE_LOW_PRICE_MAX",
                Decimal::ZERO,
            )?,
            major_change_low_price_abs: env_parse(
                "SIGNALS_MAJOR_CHANGE_LOW_PRICE_ABS",
                Decimal::ZERO,
            )?,
            major_change_spread_gate_k: env_parse(
                "SIGNALS_MAJOR_CHANGE_SPREAD_GATE_K",
                Decimal::ZERO,
            )?,
            high_confidence_threshold: env_parse(
                "SIGNALS_HIGH_CONFIDENCE_THRESHOLD",
                Decimal::ZERO,
            )?,
            reverse_allow_threshold: env_parse("SIGNALS_REVERSE_ALLOW_THRESHOLD", Decimal::ZERO)?,
            merge_window_sec: env_parse("SIGNALS_MERGE_WINDOW_SEC", 0.0)?,
            drop_expired_markets: env_bool("SIGNALS_DROP_EXPIRED_MARKETS", true)?,
        };

        let mode: String = env_string("SINKS_MODE", "best_effort");
        let transform: String = env_string("SINKS_TRANSFORM", "full");
        let sinks = SinkConfig {
            mode: mode.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SINKS_MODE".to_string(),
                value: mode,
            })?,
            required_sinks: env_list("SINKS_REQUIRED_SINKS", &[]),
            routes: match env_opt_string("SINKS_ROUTES") {
                Some(value) => parse_routes(&value)?,
                None => HashMap::new(),
            },
            transform: transform.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SINKS_TRANSFORM".to_string(),
                value: transform,
            })?,
            stdout: StdoutSinkConfig {
                enabled: env_bool("SINKS_STDOUT_ENABLED", true)?,
            },
            webhook: WebhookSinkConfig {
                enabled: env_bool("SINKS_WEBHOOK_ENABLED", false)?,
                url: env_opt_string("SINKS_WEBHOOK_URL"),
                max_retries: env_parse("SINKS_WEBHOOK_MAX_RETRIES", 5)?,
                timeout_sec: env_parse("SINKS_WEBHOOK_TIMEOUT_SEC", 10.0)?,
                aggregate_multi_outcome: env_bool("SINKS_WEBHOOK_AGGREGATE_MULTI_OUTCOME", true)?,
                aggregate_window_sec: env_parse("SINKS_WEBHOOK_AGGREGATE_WINDOW_SEC", 2.0)?,
                aggregate_max_items: env_parse("SINKS_WEBHOOK_AGGREGATE_MAX_ITEMS", 5)?,
            },
        };

        Ok(Self {
            app,
            filters,
            rolling,
            top,
            gamma,
            clob,
            signals,
            sinks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        let keys: Vec<String> = env::vars().map(|(key, _)| key).collect();
        for key in keys {
            if key.starts_with("APP_")
                || key.starts_with("FILTERS_")
                || key.starts_with("ROLLING_")
                || key.starts_with("TOP_")
                || key.starts_with("GAMMA_")
                || key.starts_with("CLOB_")
                || key.starts_with("SIGNALS_")
                || key.starts_with("SINKS_")
            {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_load_without_env() {
        clear_env();
        let config = Config::from_env_only().unwrap();
        assert_eq!(config.app.categories, vec!["finance", "geopolitics"]);
        assert_eq!(config.app.refresh_interval_sec, 60);
        assert_eq!(config.filters.top_k_per_category, 10);
        assert_eq!(config.gamma.base_url, "https://gamma-api.polymarket.com");
        assert_eq!(config.clob.channel, "market");
        assert_eq!(config.clob.ping_interval_sec, Some(10));
        assert_eq!(config.signals.big_trade_usd, Decimal::from(10_000));
        assert_eq!(config.signals.major_change_source, MajorChangeSource::Trade);
        assert_eq!(config.sinks.mode, SinkMode::BestEffort);
        assert_eq!(config.sinks.transform, TransformMode::Full);
        assert!(config.sinks.stdout.enabled);
        assert!(!config.sinks.webhook.enabled);
    }

    #[test]
    #[serial]
    fn csv_lists_and_routes_parse() {
        clear_env();
        env::set_var("APP_CATEGORIES", "crypto, elections ,sports");
        env::set_var("SINKS_ROUTES", "TradeSignal=webhook|stdout,HealthEvent=stdout");
        env::set_var("SINKS_REQUIRED_SINKS", "webhook");
        let config = Config::from_env_only().unwrap();
        assert_eq!(
            config.app.categories,
            vec!["crypto", "elections", "sports"]
        );
        assert_eq!(
            config.sinks.routes.get("TradeSignal").unwrap(),
            &vec!["webhook".to_string(), "stdout".to_string()]
        );
        assert_eq!(
            config.sinks.routes.get("HealthEvent").unwrap(),
            &vec!["stdout".to_string()]
        );
        assert_eq!(config.sinks.required_sinks, vec!["webhook"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_enum_is_fatal() {
        clear_env();
        env::set_var("SIGNALS_MAJOR_CHANGE_SOURCE", "sideways");
        let result = Config::from_env_only();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "SIGNALS_MAJOR_CHANGE_SOURCE"
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn ping_interval_zero_disables_heartbeat() {
        clear_env();
        env::set_var("CLOB_PING_INTERVAL_SEC", "0");
        let config = Config::from_env_only().unwrap();
        assert_eq!(config.clob.ping_interval_sec, None);
        clear_env();
    }
}
