//! Gamma API client for discovering Polymarket markets.
//!
//! Fetches tags, tag-scoped markets (via `/markets` or `/events`), and the
//! cross-category top list. Every outbound request passes a single-permit
//! rate gate and a retry wrapper; payload parsing tolerates the catalog's
//! many field spellings.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::DateTime;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GammaConfig;
use crate::models::{Market, OutcomeToken, Tag};

#[derive(Debug, Error)]
pub enum GammaError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned status {0}")]
    Status(u16),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl GammaError {
    fn is_retryable(&self) -> bool {
        match self {
            GammaError::Transport(_) => true,
            GammaError::Status(status) => *status == 429 || (500..600).contains(status),
            GammaError::Parse(_) => false,
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = 0.5 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::random::<f64>() * 0.25;
    Duration::from_secs_f64((base + jitter).min(5.0))
}

/// Gamma API client.
pub struct GammaClient {
    client: Client,
    base_url: String,
    cfg: GammaConfig,
    tags_cache: Mutex<Option<(Instant, Vec<Tag>)>>,
    rate_gate: tokio::sync::Mutex<Option<Instant>>,
}

impl GammaClient {
    pub fn new(cfg: &GammaConfig) -> Result<Self, GammaError> {
        let base = Url::parse(&cfg.base_url)
            .map_err(|error| GammaError::Parse(format!("bad base_url: {error}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_sec))
            .build()?;
        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            cfg: cfg.clone(),
            tags_cache: Mutex::new(None),
            rate_gate: tokio::sync::Mutex::new(None),
        })
    }

    /// All catalog tags, cached for `tags_cache_sec`.
    pub async fn list_tags(&self) -> Result<Vec<Tag>, GammaError> {
        let ttl = Duration::from_secs(self.cfg.tags_cache_sec.max(1));
        {
            let cache = self.tags_cache.lock().expect("tags cache poisoned");
            if let Some((fetched_at, tags)) = cache.as_ref() {
                if fetched_at.elapsed() < ttl {
                    return Ok(tags.clone());
                }
            }
        }

        let items = self.paginate("/tags", Vec::new(), None).await?;
        let tags: Vec<Tag> = items.iter().filter_map(parse_tag).collect();

        let mut cache = self.tags_cache.lock().expect("tags cache poisoned");
        *cache = Some((Instant::now(), tags.clone()));
        Ok(tags)
    }

    /// Markets under one tag. The `/events` strategy flattens nested
    /// markets, enriching them with event-level fields where missing.
    pub async fn list_markets(
        &self,
        tag_id: &str,
        active: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError> {
        if self.cfg.use_events_endpoint {
            return self.list_markets_via_events(tag_id, active, closed).await;
        }

        let params = vec![
            ("tag_id".to_string(), tag_id.to_string()),
            ("active".to_string(), active.to_string()),
            ("closed".to_string(), closed.to_string()),
        ];
        let items = self.paginate("/markets", params, None).await?;
        Ok(items
            .iter()
            .map(parse_market)
            .filter(|market| !market.market_id.is_empty())
            .collect())
    }

    async fn list_markets_via_events(
        &self,
        tag_id: &str,
        active: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError> {
        let mut params = vec![
            ("tag_id".to_string(), tag_id.to_string()),
            ("closed".to_string(), closed.to_string()),
        ];
        if self.cfg.related_tags {
            params.push(("related_tags".to_string(), "true".to_string()));
        }
        if let Some(primary) = &self.cfg.events_sort_primary {
            params.push(("order".to_string(), primary.clone()));
            params.push((
                "ascending".to_string(),
                (!self.cfg.events_sort_desc).to_string(),
            ));
        }

        let mut events = self.paginate("/events", params, None).await?;
        let now_ms = crate::clock::now_ms();
        events.retain(|event| event_is_active(event, now_ms));
        self.sort_events(&mut events);
        if let Some(cap) = self.cfg.events_limit_per_category {
            events.truncate(cap);
        }

        let mut markets = Vec::new();
        for event in &events {
            markets.extend(extract_markets_from_event(event));
        }
        Ok(markets
            .into_iter()
            .filter(|market| {
                !market.market_id.is_empty()
                    && (!active || market.active)
                    && (closed || !market.closed)
                    && !market.resolved
            })
            .collect())
    }

    /// Cross-category top events by the requested sort, flattened to
    /// their live markets.
    pub async fn list_top_markets(
        &self,
        limit: usize,
        order: Option<&str>,
        ascending: bool,
        featured_only: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError> {
        let mut params = vec![
            ("closed".to_string(), closed.to_string()),
            ("limit".to_string(), limit.max(1).to_string()),
            ("offset".to_string(), "0".to_string()),
        ];
        if featured_only {
            params.push(("featured".to_string(), "true".to_string()));
        }
        if let Some(order) = order {
            params.push(("order".to_string(), order.to_string()));
            params.push(("ascending".to_string(), ascending.to_string()));
        }

        let payload = self.request_json("/events", &params).await?;
        let mut events = extract_items(&payload);
        if limit > 0 {
            events.truncate(limit);
        }

        let mut markets = Vec::new();
        for event in &events {
            markets.extend(extract_markets_from_event(event));
        }
        Ok(markets
            .into_iter()
            .filter(|market| !market.market_id.is_empty() && market.is_live())
            .collect())
    }

    async fn paginate(
        &self,
        path: &str,
        params: Vec<(String, String)>,
        max_items: Option<usize>,
    ) -> Result<Vec<Value>, GammaError> {
        let mut collected: Vec<Value> = Vec::new();
        let mut offset = 0usize;
        let limit = self.cfg.page_size.max(1);

        loop {
            let mut page_limit = limit;
            if let Some(max) = max_items {
                let remaining = max.saturating_sub(collected.len());
                if remaining == 0 {
                    break;
                }
                page_limit = page_limit.min(remaining);
            }

            let mut query = params.clone();
            query.push(("limit".to_string(), page_limit.to_string()));
            query.push(("offset".to_string(), offset.to_string()));

            let payload = self.request_json(path, &query).await?;
            let items = extract_items(&payload);
            let count = items.len();
            collected.extend(items);

            if count == 0 || count < page_limit {
                break;
            }
            offset += page_limit;
        }

        if let Some(max) = max_items {
            collected.truncate(max);
        }
        debug!(path, count = collected.len(), "gamma pagination complete");
        Ok(collected)
    }

    /// Single rate-limited, retrying GET.
    async fn request_json(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, GammaError> {
        let url = format!("{}{}", self.base_url, path);
        let max_attempts = self.cfg.retry_max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            self.pace().await;
            let error = match self.client.get(&url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.map_err(GammaError::Transport);
                    }
                    let error = GammaError::Status(status.as_u16());
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    error
                }
                Err(error) => GammaError::Transport(error),
            };

            attempt += 1;
            if attempt >= max_attempts {
                return Err(error);
            }
            let delay = retry_delay(attempt);
            warn!(%error, attempt, delay_ms = delay.as_millis() as u64, "gamma request retry");
            tokio::time::sleep(delay).await;
        }
    }

    async fn pace(&self) {
        if self.cfg.request_interval_ms == 0 {
            return;
        }
        let period = Duration::from_millis(self.cfg.request_interval_ms);
        let mut gate = self.rate_gate.lock().await;
        if let Some(last) = *gate {
            let elapsed = last.elapsed();
            if elapsed < period {
                tokio::time::sleep(period - elapsed).await;
            }
        }
        *gate = Some(Instant::now());
    }

    fn sort_events(&self, events: &mut [Value]) {
        let Some(primary) = self.cfg.events_sort_primary.as_deref() else {
            return;
        };
        let secondary = self.cfg.events_sort_secondary.as_deref();
        let desc = self.cfg.events_sort_desc;

        events.sort_by(|a, b| {
            let key_a = (event_metric(a, Some(primary)), event_metric(a, secondary));
            let key_b = (event_metric(b, Some(primary)), event_metric(b, secondary));
            let ordering = key_a
                .partial_cmp(&key_b)
                .unwrap_or(std::cmp::Ordering::Equal);
            if desc {
                ordering.reverse()
            } else {
                ordering
            }
        });
        info!(
            primary,
            secondary = secondary.unwrap_or(""),
            desc,
            count = events.len(),
            "gamma events sorted"
        );
    }
}

/// Payloads arrive as a bare array or wrapped in `{data|results: [...]}`.
fn extract_items(payload: &Value) -> Vec<Value> {
    let items = if let Some(items) = payload.as_array() {
        items
    } else if let Some(items) = payload
        .get("data")
        .or_else(|| payload.get("results"))
        .and_then(|v| v.as_array())
    {
        items
    } else {
        return Vec::new();
    };
    items.iter().filter(|item| item.is_object()).cloned().collect()
}

fn string_of(value: &Value) -> Option<String> {
    if let Some(text) = value.as_str() {
        let trimmed = text.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    if value.is_number() {
        return Some(value.to_string());
    }
    None
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| raw.get(*key).and_then(string_of))
}

fn to_bool(value: Option<&Value>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    if let Some(flag) = value.as_bool() {
        return flag;
    }
    if let Some(num) = value.as_f64() {
        return num != 0.0;
    }
    if let Some(text) = value.as_str() {
        return match text.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        };
    }
    default
}

fn to_f64(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    if let Some(num) = value.as_f64() {
        return Some(num);
    }
    value.as_str()?.trim().parse().ok()
}

/// End timestamp in ms from an integer or an ISO-8601 string.
fn parse_end_ts(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(num) = value.as_i64() {
        return Some(num);
    }
    let text = value.as_str()?.trim();
    if let Ok(num) = text.parse::<i64>() {
        return Some(num);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn parse_tag(raw: &Value) -> Option<Tag> {
    let tag_id = first_string(raw, &["id", "tag_id"])?;
    Some(Tag {
        tag_id,
        slug: raw.get("slug").and_then(string_of),
        name: raw.get("name").and_then(string_of),
    })
}

/// `clobTokenIds` may be a list, a JSON-encoded list, a CSV string, or a
/// single id.
fn parse_clob_token_ids(value: Option<&Value>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    if let Some(items) = value.as_array() {
        return items.iter().filter_map(string_of).collect();
    }
    let Some(text) = value.as_str() else {
        return Vec::new();
    };
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
            return items.iter().filter_map(string_of).collect();
        }
    }
    if text.contains(',') {
        return text
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
    }
    vec![text.to_string()]
}

fn coerce_token_id(raw: &Value) -> Option<String> {
    first_string(
        raw,
        &["token_id", "tokenId", "clobTokenId", "asset_id", "assetId", "id"],
    )
}

fn outcome_from_dict(token_raw: &Value) -> Option<OutcomeToken> {
    let token_id = coerce_token_id(token_raw)?;
    let side = first_string(token_raw, &["side", "name", "title"]);
    Some(OutcomeToken { token_id, side })
}

fn extract_outcomes(raw: &Value) -> Vec<OutcomeToken> {
    let mut outcomes: Vec<OutcomeToken> = Vec::new();

    let outcomes_raw = raw.get("outcomes").cloned().map(|value| match value {
        // outcomes themselves may arrive JSON-encoded
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::Array(
                text.split(',')
                    .map(|item| Value::String(item.trim().to_string()))
                    .filter(|item| item.as_str().map_or(false, |s| !s.is_empty()))
                    .collect(),
            ),
        },
        other => other,
    });

    if let Some(Value::Array(items)) = outcomes_raw {
        for item in &items {
            if item.is_object() {
                if let Some(outcome) = outcome_from_dict(item) {
                    outcomes.push(outcome);
                }
            } else if let Some(name) = item.as_str() {
                outcomes.push(OutcomeToken {
                    token_id: String::new(),
                    side: Some(name.to_string()),
                });
            }
        }
    }

    if let Some(tokens) = raw.get("tokens").and_then(|v| v.as_array()) {
        for token in tokens {
            if let Some(outcome) = outcome_from_dict(token) {
                outcomes.push(outcome);
            }
        }
    }

    outcomes
}

/// Pair bare outcome names with `clobTokenIds` positionally when the
/// lengths line up.
fn attach_outcome_token_ids(outcomes: Vec<OutcomeToken>, clob_ids: &[String]) -> Vec<OutcomeToken> {
    if outcomes.is_empty() || clob_ids.is_empty() || outcomes.len() != clob_ids.len() {
        return outcomes;
    }
    outcomes
        .into_iter()
        .enumerate()
        .map(|(idx, outcome)| OutcomeToken {
            token_id: if outcome.token_id.is_empty() {
                clob_ids[idx].clone()
            } else {
                outcome.token_id
            },
            side: outcome.side,
        })
        .collect()
}

/// Parse one raw catalog market into the typed model.
pub fn parse_market(raw: &Value) -> Market {
    let market_id = first_string(
        raw,
        &["conditionId", "condition_id", "id", "market_id", "marketId"],
    )
    .unwrap_or_default();
    let question = first_string(raw, &["question", "title", "description"]).unwrap_or_default();
    let event_id = first_string(raw, &["event_id", "eventId"]);
    let active = to_bool(raw.get("active"), true);
    let closed = to_bool(raw.get("closed"), false);
    let resolved = to_bool(raw.get("resolved"), false);
    let enable_orderbook = raw
        .get("enableOrderBook")
        .or_else(|| raw.get("enable_orderbook"))
        .filter(|v| !v.is_null())
        .map(|v| to_bool(Some(v), true));
    let end_ts_ms = parse_end_ts(
        raw.get("end_ts")
            .or_else(|| raw.get("endDate"))
            .or_else(|| raw.get("endDateIso")),
    );
    let liquidity = to_f64(
        raw.get("liquidity")
            .or_else(|| raw.get("liquidityUSD"))
            .or_else(|| raw.get("liquidityNum")),
    );
    let volume_24h = to_f64(
        raw.get("volume_24h")
            .or_else(|| raw.get("volume24h"))
            .or_else(|| raw.get("volume24hr"))
            .or_else(|| raw.get("volume24hrClob")),
    );

    let clob_token_ids = parse_clob_token_ids(raw.get("clobTokenIds"));
    let outcomes = attach_outcome_token_ids(extract_outcomes(raw), &clob_token_ids);

    let mut token_ids: Vec<String> = Vec::new();
    for token_id in clob_token_ids
        .iter()
        .chain(outcomes.iter().map(|outcome| &outcome.token_id))
    {
        if !token_id.is_empty() && !token_ids.contains(token_id) {
            token_ids.push(token_id.clone());
        }
    }

    Market {
        market_id,
        question,
        event_id,
        category: None,
        enable_orderbook,
        active,
        closed,
        resolved,
        end_ts_ms,
        liquidity,
        volume_24h,
        token_ids,
        outcomes,
        topic_key: None,
    }
}

/// Event-level liveness: active, not closed/archived, not deploying, and
/// not past its end date.
fn event_is_active(event: &Value, now_ms: i64) -> bool {
    if !to_bool(event.get("active"), true)
        || to_bool(event.get("closed"), false)
        || to_bool(event.get("archived"), false)
        || to_bool(event.get("pendingDeployment"), false)
        || to_bool(event.get("deploying"), false)
    {
        return false;
    }
    match parse_end_ts(
        event
            .get("end_ts")
            .or_else(|| event.get("endDate"))
            .or_else(|| event.get("endDateIso")),
    ) {
        Some(end) => end > now_ms,
        None => true,
    }
}

fn event_metric(event: &Value, key: Option<&str>) -> f64 {
    let Some(key) = key else {
        return 0.0;
    };
    match key.trim().to_lowercase().as_str() {
        "volume24hr" | "volume24h" | "volume_24h" | "volume24hrclob" => event_volume_24h(event),
        "liquidity" | "liquidityusd" | "liquiditynum" => event_liquidity(event),
        _ => 0.0,
    }
}

fn event_volume_24h(event: &Value) -> f64 {
    for key in ["volume_24h", "volume24h", "volume24hr", "volume24hrClob"] {
        if let Some(value) = to_f64(event.get(key)) {
            return value;
        }
    }
    sum_market_metric(event, |market| {
        to_f64(
            market
                .get("volume_24h")
                .or_else(|| market.get("volume24h"))
                .or_else(|| market.get("volume24hr"))
                .or_else(|| market.get("volume24hrClob")),
        )
    })
}

fn event_liquidity(event: &Value) -> f64 {
    for key in ["liquidity", "liquidityUSD", "liquidityNum"] {
        if let Some(value) = to_f64(event.get(key)) {
            return value;
        }
    }
    sum_market_metric(event, |market| {
        to_f64(
            market
                .get("liquidity")
                .or_else(|| market.get("liquidityUSD"))
                .or_else(|| market.get("liquidityNum")),
        )
    })
}

fn sum_market_metric<F>(event: &Value, metric: F) -> f64
where
    F: Fn(&Value) -> Option<f64>,
{
    event
        .get("markets")
        .and_then(|v| v.as_array())
        .map(|markets| markets.iter().filter_map(|market| metric(market)).sum())
        .unwrap_or(0.0)
}

/// Flatten an event's nested markets, filling in event-level fields where
/// the market lacks them.
fn extract_markets_from_event(event: &Value) -> Vec<Market> {
    let Some(markets_raw) = event.get("markets").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let event_id = first_string(event, &["id", "event_id", "eventId"]);
    let event_title = first_string(event, &["title", "slug"]);
    let event_end = parse_end_ts(
        event
            .get("end_ts")
            .or_else(|| event.get("endDate"))
            .or_else(|| event.get("endDateIso")),
    );
    let event_enable_ob = event
        .get("enableOrderBook")
        .filter(|v| !v.is_null())
        .map(|v| to_bool(Some(v), true));

    markets_raw
        .iter()
        .filter(|item| item.is_object())
        .map(|item| {
            let mut market = parse_market(item);
            if market.event_id.is_none() {
                market.event_id = event_id.clone();
            }
            if market.end_ts_ms.is_none() {
                market.end_ts_ms = event_end;
            }
            if market.enable_orderbook.is_none() {
                market.enable_orderbook = event_enable_ob;
            }
            if market.question.is_empty() {
                market.question = event_title.clone().unwrap_or_default();
            }
            market
        })
        .collect()
}
