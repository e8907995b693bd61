//! CLOB WebSocket feed client.
//!
//! A spawned task owns the socket; callers interact through a [`FeedHandle`]
//! (commands in, classified messages out). The task reconnects with capped
//! exponential backoff, re-sends the full desired subscription on reconnect,
//! answers application-layer pings, and splits oversized subscribe payloads
//! into balanced chunks.

use std::collections::HashSet;
use std::time::Duration;

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::config::ClobConfig;
use crate::models::{BookLevel, BookSnapshot, TradeTick};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One classified inbound feed message; the payload keeps the raw JSON so
/// downstream parsers stay forgiving.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Trade(Value),
    Book(Value),
    PriceChange(Value),
    BestBidAsk(Value),
    MarketLifecycle(Value),
    Unknown(Value),
}

/// Classify a decoded JSON object by its `event_type`/`type` hint.
pub fn classify(value: Value) -> FeedMessage {
    let hint = value
        .get("event_type")
        .or_else(|| value.get("type"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match hint.as_str() {
        "last_trade_price" | "trade" | "last_trade" | "fill" => FeedMessage::Trade(value),
        "book" | "orderbook" => FeedMessage::Book(value),
        "price_change" => FeedMessage::PriceChange(value),
        "best_bid_ask" => FeedMessage::BestBidAsk(value),
        "new_market" | "market_resolved" => FeedMessage::MarketLifecycle(value),
        _ => {
            if ["bids", "asks", "buys", "sells"]
                .iter()
                .any(|key| value.get(key).is_some())
            {
                FeedMessage::Book(value)
            } else {
                FeedMessage::Unknown(value)
            }
        }
    }
}

/// Token id from the first present of the known key spellings.
pub fn extract_token_id(payload: &Value) -> Option<String> {
    for key in ["asset_id", "assetId", "token_id", "tokenId", "clobTokenId"] {
        if let Some(value) = payload.get(key) {
            if let Some(text) = value.as_str() {
                return Some(text.to_string());
            }
            if value.is_number() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Sequence number from `sequence|seq|sequence_number|seqNum`.
pub fn extract_sequence(payload: &Value) -> Option<u64> {
    for key in ["sequence", "seq", "sequence_number", "seqNum"] {
        let Some(value) = payload.get(key) else {
            continue;
        };
        if let Some(num) = value.as_u64() {
            return Some(num);
        }
        if let Some(text) = value.as_str() {
            return text.trim().parse().ok();
        }
        return None;
    }
    None
}

fn parse_ts_value(value: &Value) -> Option<i64> {
    if let Some(num) = value.as_i64() {
        // bare second counts are promoted to milliseconds
        return Some(if num < 10_000_000_000 { num * 1000 } else { num });
    }
    if let Some(num) = value.as_f64() {
        let num = num as i64;
        return Some(if num < 10_000_000_000 { num * 1000 } else { num });
    }
    let text = value.as_str()?.trim();
    if let Ok(num) = text.parse::<i64>() {
        return Some(if num < 10_000_000_000 { num * 1000 } else { num });
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Timestamp in ms from `ts_ms|timestamp|ts`; accepts integer ms, integer
/// seconds, or ISO-8601.
pub fn extract_ts_ms(payload: &Value) -> Option<i64> {
    for key in ["ts_ms", "timestamp", "ts"] {
        if let Some(value) = payload.get(key) {
            if let Some(ts) = parse_ts_value(value) {
                return Some(ts);
            }
        }
    }
    None
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    if let Some(text) = value.as_str() {
        return text.trim().parse().ok();
    }
    if let Some(num) = value.as_i64() {
        return Some(Decimal::from(num));
    }
    value.as_f64().and_then(Decimal::from_f64)
}

fn first_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| payload.get(*key).filter(|v| !v.is_null()))
}

/// Levels as `[price, size, …]` arrays or `{price, size|qty}` objects.
pub fn parse_levels(raw: &Value) -> Vec<BookLevel> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let (price, size) = if let Some(pair) = item.as_array() {
                if pair.len() < 2 {
                    return None;
                }
                (to_decimal(&pair[0])?, to_decimal(&pair[1])?)
            } else if item.is_object() {
                let price = to_decimal(item.get("price")?)?;
                let size = to_decimal(first_field(item, &["size", "qty"])?)?;
                (price, size)
            } else {
                return None;
            };
            Some(BookLevel { price, size })
        })
        .collect()
}

/// Parse a trade message. Returns `None` when a required field is missing.
pub fn parse_trade(payload: &Value) -> Option<TradeTick> {
    let token_id = extract_token_id(payload)?;
    let price = to_decimal(first_field(
        payload,
        &["price", "p", "last_trade_price", "trade_price"],
    )?)?;
    let size = to_decimal(first_field(
        payload,
        &["size", "quantity", "qty", "last_trade_size", "trade_size"],
    )?)?;
    let ts_ms = extract_ts_ms(payload)?;
    let side = payload
        .get("side")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let market_id = first_field(payload, &["market", "market_id", "marketId"])
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(TradeTick {
        token_id,
        market_id,
        side,
        price,
        size,
        ts_ms,
    })
}

/// Parse a book snapshot message; the timestamp falls back to now.
pub fn parse_book(payload: &Value) -> Option<BookSnapshot> {
    let token_id = extract_token_id(payload)?;
    let bids = first_field(payload, &["bids", "bid", "buys"])
        .map(parse_levels)
        .unwrap_or_default();
    let asks = first_field(payload, &["asks", "ask", "sells"])
        .map(parse_levels)
        .unwrap_or_default();
    let ts_ms = extract_ts_ms(payload).unwrap_or_else(now_ms);
    Some(BookSnapshot {
        token_id,
        bids,
        asks,
        ts_ms,
    })
}

/// One side/price/size delta from a price-change message.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChangeLevel {
    pub side: String,
    pub price: Decimal,
    pub size: Decimal,
}

/// Deltas from `price_changes|changes`: `{side|type, price|p,
/// size|s|quantity}` objects or positional `[price, size, side]` arrays.
/// Entries whose side is not BUY/SELL are skipped.
pub fn parse_price_changes(payload: &Value) -> Vec<PriceChangeLevel> {
    let Some(items) = first_field(payload, &["price_changes", "changes"]).and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let (side, price, size) = if item.is_object() {
                let side = first_field(item, &["side", "type"])
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_uppercase();
                let price = to_decimal(first_field(item, &["price", "p"])?)?;
                let size = to_decimal(first_field(item, &["size", "s", "quantity"])?)?;
                (side, price, size)
            } else if let Some(triple) = item.as_array() {
                if triple.len() < 3 {
                    return None;
                }
                let side = triple[2].as_str().unwrap_or_default().to_uppercase();
                (side, to_decimal(&triple[0])?, to_decimal(&triple[1])?)
            } else {
                return None;
            };

            if side != "BUY" && side != "SELL" {
                return None;
            }
            Some(PriceChangeLevel { side, price, size })
        })
        .collect()
}

fn build_initial_frame(cfg: &ClobConfig, ids: &[String]) -> String {
    json!({
        "type": cfg.channel,
        "assets_ids": ids,
        "custom_feature_enabled": cfg.custom_feature_enabled,
        "initial_dump": cfg.initial_dump,
    })
    .to_string()
}

fn build_operation_frame(cfg: &ClobConfig, ids: &[String], operation: &str) -> String {
    json!({
        "assets_ids": ids,
        "operation": operation,
        "custom_feature_enabled": cfg.custom_feature_enabled,
    })
    .to_string()
}

/// Split ids into the smallest number of balanced chunks whose serialized
/// frames all fit `max_bytes`. The union of chunks always equals the input;
/// a single id that cannot fit is still sent alone.
pub fn chunk_ids<F>(ids: &[String], max_bytes: usize, build: F) -> Vec<Vec<String>>
where
    F: Fn(&[String]) -> String,
{
    if ids.is_empty() {
        return Vec::new();
    }
    for parts in 1..=ids.len() {
        let chunk_size = ids.len().div_ceil(parts);
        let chunks: Vec<Vec<String>> = ids.chunks(chunk_size).map(|c| c.to_vec()).collect();
        if chunks.iter().all(|chunk| build(chunk).len() <= max_bytes) {
            return chunks;
        }
    }
    warn!("subscription ids exceed frame limit even one per frame");
    ids.iter().map(|id| vec![id.clone()]).collect()
}

/// Commands accepted by the feed task.
#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Replace the desired token set.
    Subscribe(Vec<String>),
    /// Re-send the full desired set (post sequence gap).
    Resubscribe,
    Close,
}

/// Cloneable command side of the feed; subscription changes and shutdown
/// all funnel through the single task that owns the socket.
#[derive(Clone)]
pub struct FeedController {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedController {
    pub fn subscribe(&self, token_ids: Vec<String>) {
        let _ = self.cmd_tx.send(FeedCommand::Subscribe(token_ids));
    }

    pub fn resubscribe(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Resubscribe);
    }

    /// Idempotent; the task closes the socket and stops.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Close);
    }
}

/// Caller-side handle to the spawned feed task.
pub struct FeedHandle {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
    messages: mpsc::UnboundedReceiver<FeedMessage>,
}

impl FeedHandle {
    pub fn controller(&self) -> FeedController {
        FeedController {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn subscribe(&self, token_ids: Vec<String>) {
        let _ = self.cmd_tx.send(FeedCommand::Subscribe(token_ids));
    }

    pub fn resubscribe(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Resubscribe);
    }

    /// Idempotent; the task closes the socket and stops.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Close);
    }

    /// Next classified message; `None` once the task has stopped.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.messages.recv().await
    }
}

/// CLOB websocket feed client.
pub struct ClobFeed;

impl ClobFeed {
    /// Spawn the feed task and return its handle.
    pub fn spawn(cfg: ClobConfig) -> FeedHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, messages) = mpsc::unbounded_channel();
        tokio::spawn(feed_task(cfg, cmd_rx, msg_tx));
        FeedHandle { cmd_tx, messages }
    }
}

/// Append `/ws/<channel>` unless the URL already carries a `/ws/` path.
fn resolve_ws_url(ws_url: &str, channel: &str) -> String {
    if ws_url.contains("/ws/") {
        ws_url.to_string()
    } else {
        format!("{}/ws/{}", ws_url.trim_end_matches('/'), channel)
    }
}

async fn send_frames(ws: &mut WsStream, frames: Vec<String>) -> Result<(), WsError> {
    for frame in frames {
        ws.send(Message::Text(frame.into())).await?;
    }
    Ok(())
}

async fn send_initial(ws: &mut WsStream, cfg: &ClobConfig, ids: &[String]) -> Result<(), WsError> {
    let chunks = chunk_ids(ids, cfg.max_frame_bytes, |chunk| {
        build_initial_frame(cfg, chunk)
    });
    let frames: Vec<String> = chunks
        .iter()
        .map(|chunk| build_initial_frame(cfg, chunk))
        .collect();
    info!(tokens = ids.len(), frames = frames.len(), "feed subscribe");
    send_frames(ws, frames).await
}

async fn send_diff(
    ws: &mut WsStream,
    cfg: &ClobConfig,
    current: &[String],
    next: &[String],
) -> Result<(), WsError> {
    let current_set: HashSet<&String> = current.iter().collect();
    let next_set: HashSet<&String> = next.iter().collect();
    let added: Vec<String> = next
        .iter()
        .filter(|id| !current_set.contains(id))
        .cloned()
        .collect();
    let removed: Vec<String> = current
        .iter()
        .filter(|id| !next_set.contains(id))
        .cloned()
        .collect();

    for (ids, operation) in [(added, "subscribe"), (removed, "unsubscribe")] {
        if ids.is_empty() {
            continue;
        }
        let chunks = chunk_ids(&ids, cfg.max_frame_bytes, |chunk| {
            build_operation_frame(cfg, chunk, operation)
        });
        let frames: Vec<String> = chunks
            .iter()
            .map(|chunk| build_operation_frame(cfg, chunk, operation))
            .collect();
        debug!(count = ids.len(), operation, "feed subscription diff");
        send_frames(ws, frames).await?;
    }
    Ok(())
}

fn ping_pong_hint(value: &Value) -> Option<&'static str> {
    let hint = value
        .get("type")
        .or_else(|| value.get("event_type"))?
        .as_str()?
        .to_lowercase();
    match hint.as_str() {
        "ping" => Some("ping"),
        "pong" => Some("pong"),
        _ => None,
    }
}

async fn dispatch_value(
    value: Value,
    cfg: &ClobConfig,
    ws: &mut WsStream,
    msg_tx: &mpsc::UnboundedSender<FeedMessage>,
) -> Result<(), WsError> {
    match ping_pong_hint(&value) {
        Some("ping") => {
            ws.send(Message::Text(cfg.pong_message.clone().into()))
                .await?;
            return Ok(());
        }
        Some(_) => return Ok(()),
        None => {}
    }
    let _ = msg_tx.send(classify(value));
    Ok(())
}

async fn handle_text(
    text: &str,
    cfg: &ClobConfig,
    ws: &mut WsStream,
    msg_tx: &mpsc::UnboundedSender<FeedMessage>,
) -> Result<(), WsError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") {
        ws.send(Message::Text(cfg.pong_message.clone().into()))
            .await?;
        return Ok(());
    }
    if trimmed.eq_ignore_ascii_case("pong") || trimmed.is_empty() {
        return Ok(());
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "feed message decode failed, dropped");
            return Ok(());
        }
    };

    match value {
        Value::Array(items) => {
            for item in items {
                dispatch_value(item, cfg, ws, msg_tx).await?;
            }
        }
        other => dispatch_value(other, cfg, ws, msg_tx).await?,
    }
    Ok(())
}

/// Handle one socket frame; `Err` means the connection should be rebuilt.
async fn handle_frame(
    message: Message,
    cfg: &ClobConfig,
    ws: &mut WsStream,
    msg_tx: &mpsc::UnboundedSender<FeedMessage>,
) -> Result<(), WsError> {
    match message {
        Message::Text(text) => handle_text(text.as_str(), cfg, ws, msg_tx).await,
        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => {
                let owned = text.to_string();
                handle_text(&owned, cfg, ws, msg_tx).await
            }
            Err(_) => {
                debug!("non-utf8 binary feed frame dropped");
                Ok(())
            }
        },
        Message::Ping(data) => ws.send(Message::Pong(data)).await,
        Message::Close(_) => Err(WsError::ConnectionClosed),
        _ => Ok(()),
    }
}

/// Sleep out the reconnect backoff while still applying commands.
/// Returns `false` when a close was requested.
async fn wait_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
    desired: &mut Vec<String>,
    secs: u64,
) -> bool {
    let sleep = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(FeedCommand::Close) => return false,
                Some(FeedCommand::Subscribe(ids)) => *desired = ids,
                Some(FeedCommand::Resubscribe) => {}
            },
        }
    }
}

async fn feed_task(
    cfg: ClobConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    msg_tx: mpsc::UnboundedSender<FeedMessage>,
) {
    let url = resolve_ws_url(&cfg.ws_url, &cfg.channel);
    let mut desired: Vec<String> = Vec::new();
    let initial_backoff = cfg.reconnect_backoff_sec.max(1);
    let max_backoff = cfg.reconnect_max_sec.max(initial_backoff);
    let mut backoff = initial_backoff;

    loop {
        let mut ws = match connect_async(&url).await {
            Ok((ws, _)) => {
                info!(url = %url, "feed connected");
                ws
            }
            Err(error) => {
                warn!(%error, "feed connect failed");
                if !wait_backoff(&mut cmd_rx, &mut desired, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        if !desired.is_empty() && send_initial(&mut ws, &cfg, &desired).await.is_err() {
            if !wait_backoff(&mut cmd_rx, &mut desired, backoff).await {
                return;
            }
            backoff = (backoff * 2).min(max_backoff);
            continue;
        }

        let mut ping = tokio::time::interval(
            cfg.ping_interval_sec
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(3600)),
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(FeedCommand::Close) => {
                        let _ = ws.close(None).await;
                        info!("feed closed");
                        return;
                    }
                    Some(FeedCommand::Subscribe(ids)) => {
                        let result = send_diff(&mut ws, &cfg, &desired, &ids).await;
                        desired = ids;
                        if result.is_err() {
                            break;
                        }
                    }
                    Some(FeedCommand::Resubscribe) => {
                        if !desired.is_empty()
                            && send_initial(&mut ws, &cfg, &desired).await.is_err()
                        {
                            break;
                        }
                    }
                },
                _ = ping.tick() => {
                    if cfg.ping_interval_sec.is_some()
                        && ws.send(Message::Text(cfg.ping_message.clone().into())).await.is_err()
                    {
                        break;
                    }
                },
                frame = ws.next() => match frame {
                    None => break,
                    Some(Err(error)) => {
                        warn!(%error, "feed socket error");
                        break;
                    }
                    Some(Ok(message)) => {
                        backoff = initial_backoff;
                        if handle_frame(message, &cfg, &mut ws, &msg_tx).await.is_err() {
                            break;
                        }
                    }
                },
            }
        }

        warn!(backoff_sec = backoff, "feed reconnecting");
        if !wait_backoff(&mut cmd_rx, &mut desired, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn test_cfg() -> ClobConfig {
        ClobConfig {
            ws_url: "wss://example.test".to_string(),
            channel: "market".to_string(),
            custom_feature_enabled: true,
            initial_dump: true,
            max_frame_bytes: 100_000,
            ping_interval_sec: Some(10),
            ping_message: "PING".to_string(),
            pong_message: "pong".to_string(),
            reconnect_backoff_sec: 5,
            reconnect_max_sec: 60,
            resync_on_gap: true,
            resync_min_interval_sec: 30,
        }
    }

    #[test]
    fn classify_by_event_type_hint() {
        assert!(matches!(
            classify(json!({"event_type": "last_trade_price"})),
            FeedMessage::Trade(_)
        ));
        assert!(matches!(
            classify(json!({"type": "Fill"})),
            FeedMessage::Trade(_)
        ));
        assert!(matches!(
            classify(json!({"event_type": "book"})),
            FeedMessage::Book(_)
        ));
        assert!(matches!(
            classify(json!({"event_type": "price_change"})),
            FeedMessage::PriceChange(_)
        ));
        assert!(matches!(
            classify(json!({"event_type": "best_bid_ask"})),
            FeedMessage::BestBidAsk(_)
        ));
        assert!(matches!(
            classify(json!({"event_type": "market_resolved"})),
            FeedMessage::MarketLifecycle(_)
        ));
        assert!(matches!(
            classify(json!({"something": 1})),
            FeedMessage::Unknown(_)
        ));
    }

    #[test]
    fn classify_bare_book_by_level_keys() {
        assert!(matches!(
            classify(json!({"asset_id": "t", "bids": [], "asks": []})),
            FeedMessage::Book(_)
        ));
        assert!(matches!(
            classify(json!({"asset_id": "t", "buys": []})),
            FeedMessage::Book(_)
        ));
    }

    #[test]
    fn parse_trade_with_aliases() {
        let trade = parse_trade(&json!({
            "assetId": "t1",
            "p": "0.52",
            "qty": 100,
            "ts": 1_700_000_000,
            "side": "BUY",
        }))
        .unwrap();
        assert_eq!(trade.token_id, "t1");
        assert_eq!(trade.price, dec!(0.52));
        assert_eq!(trade.size, dec!(100));
        // seconds promoted to ms
        assert_eq!(trade.ts_ms, 1_700_000_000_000);

        assert!(parse_trade(&json!({"price": "0.5", "size": "1"})).is_none());
    }

    #[test]
    fn parse_trade_iso_timestamp() {
        let trade = parse_trade(&json!({
            "asset_id": "t1",
            "price": 0.4,
            "size": 2,
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(trade.ts_ms, 1_704_067_200_000);
    }

    #[test]
    fn parse_book_level_forms() {
        let book = parse_book(&json!({
            "asset_id": "t1",
            "bids": [["0.5", "10"], {"price": "0.49", "size": "5"}],
            "asks": [{"price": "0.55", "qty": 3}],
            "timestamp": 1_700_000_000_000i64,
        }))
        .unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.asks[0].size, dec!(3));
        assert_eq!(book.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn parse_price_changes_forms() {
        let changes = parse_price_changes(&json!({
            "price_changes": [
                {"side": "BUY", "price": "0.5", "size": "2"},
                {"type": "SELL", "p": "0.6", "quantity": "1"},
                ["0.7", "4", "sell"],
                {"side": "HOLD", "price": "0.1", "size": "1"},
            ],
        }));
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].side, "BUY");
        assert_eq!(changes[1].price, dec!(0.6));
        assert_eq!(changes[2].side, "SELL");
        assert_eq!(changes[2].size, dec!(4));
    }

    #[test]
    fn sequence_extraction_spellings() {
        assert_eq!(extract_sequence(&json!({"sequence": 7})), Some(7));
        assert_eq!(extract_sequence(&json!({"seq": "8"})), Some(8));
        assert_eq!(extract_sequence(&json!({"seqNum": 9})), Some(9));
        assert_eq!(extract_sequence(&json!({"other": 1})), None);
    }

    #[test]
    fn chunked_subscribe_union_and_size() {
        let cfg = ClobConfig {
            max_frame_bytes: 200,
            ..test_cfg()
        };
        let ids: Vec<String> = (0..60).map(|i| format!("token-{i:04}")).collect();
        let chunks = chunk_ids(&ids, cfg.max_frame_bytes, |chunk| {
            build_initial_frame(&cfg, chunk)
        });

        assert!(chunks.len() >= 2);
        let union: Vec<String> = chunks.iter().flatten().cloned().collect();
        assert_eq!(union, ids);
        for chunk in &chunks {
            let frame = build_initial_frame(&cfg, chunk);
            assert!(frame.len() <= 200, "frame too large: {}", frame.len());
            let parsed: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(parsed["type"], "market");
        }
    }

    #[test]
    fn small_set_fits_one_frame() {
        let cfg = test_cfg();
        let ids = vec!["a".to_string(), "b".to_string()];
        let chunks = chunk_ids(&ids, cfg.max_frame_bytes, |chunk| {
            build_initial_frame(&cfg, chunk)
        });
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], ids);
    }

    #[test]
    fn operation_frame_shape() {
        let cfg = test_cfg();
        let frame = build_operation_frame(&cfg, &["t1".to_string()], "unsubscribe");
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["operation"], "unsubscribe");
        assert_eq!(parsed["assets_ids"][0], "t1");
        assert_eq!(parsed["custom_feature_enabled"], true);
    }

    #[test]
    fn ws_url_resolution() {
        assert_eq!(
            resolve_ws_url("wss://host.test", "market"),
            "wss://host.test/ws/market"
        );
        assert_eq!(
            resolve_ws_url("wss://host.test/ws/market", "market"),
            "wss://host.test/ws/market"
        );
    }

    #[test]
    fn ping_pong_hints() {
        assert_eq!(ping_pong_hint(&json!({"type": "PING"})), Some("ping"));
        assert_eq!(ping_pong_hint(&json!({"event_type": "pong"})), Some("pong"));
        assert_eq!(ping_pong_hint(&json!({"event_type": "book"})), None);
    }
}
