//! Pure market-selection functions: topic normalization, primary-per-topic
//! picking, and hot-list filtering.

use std::collections::BTreeMap;

use crate::models::Market;

/// Canonical topic key: lowercase, runs of non-alphanumerics collapsed to a
/// single space, trimmed. Idempotent.
pub fn normalize_topic(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Fill in missing topic keys from the market question.
pub fn assign_topic_keys(markets: &mut [Market]) {
    for market in markets.iter_mut() {
        if market.topic_key.is_none() {
            market.topic_key = Some(normalize_topic(&market.question));
        }
    }
}

/// Sort key for one priority component. Larger liquidity/volume sort first
/// (null treated as 0); sooner end times sort first (null last).
fn priority_value(market: &Market, key: &str) -> f64 {
    match key {
        "liquidity" => -market.liquidity.unwrap_or(0.0),
        "volume_24h" => -market.volume_24h.unwrap_or(0.0),
        "end_ts" => market.end_ts_ms.map(|ts| ts as f64).unwrap_or(f64::INFINITY),
        _ => 0.0,
    }
}

fn priority_key(market: &Market, keys: &[String]) -> Vec<f64> {
    keys.iter()
        .map(|key| priority_value(market, key))
        .collect()
}

fn sort_by_priority(markets: &mut [Market], keys: &[String]) {
    markets.sort_by(|a, b| {
        priority_key(a, keys)
            .partial_cmp(&priority_key(b, keys))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Group markets by topic key (falling back to the market id) and keep the
/// best `max_per_topic` of each group by `priority`.
pub fn select_primary_markets(
    mut markets: Vec<Market>,
    priority: &[String],
    max_per_topic: usize,
) -> Vec<Market> {
    assign_topic_keys(&mut markets);

    let mut grouped: BTreeMap<String, Vec<Market>> = BTreeMap::new();
    for market in markets {
        let key = market
            .topic_key
            .clone()
            .unwrap_or_else(|| market.market_id.clone());
        grouped.entry(key).or_default().push(market);
    }

    let mut selected = Vec::new();
    for (_, mut group) in grouped {
        sort_by_priority(&mut group, priority);
        group.truncate(max_per_topic);
        selected.extend(group);
    }
    selected
}

/// Filter by liquidity and keyword lists, sort by `hot_sort`, and truncate
/// to `top_k`. `top_k <= 0` disables truncation.
pub fn select_top_markets(
    markets: Vec<Market>,
    top_k: i64,
    hot_sort: &[String],
    min_liquidity: Option<f64>,
    keyword_allow: &[String],
    keyword_block: &[String],
) -> Vec<Market> {
    let allow: Vec<String> = keyword_allow.iter().map(|kw| kw.to_lowercase()).collect();
    let block: Vec<String> = keyword_block.iter().map(|kw| kw.to_lowercase()).collect();

    let mut filtered: Vec<Market> = markets
        .into_iter()
        .filter(|market| {
            if let Some(min) = min_liquidity {
                if market.liquidity.unwrap_or(0.0) < min {
                    return false;
                }
            }
            let question = market.question.to_lowercase();
            if !allow.is_empty() && !allow.iter().any(|kw| question.contains(kw)) {
                return false;
            }
            if block.iter().any(|kw| question.contains(kw)) {
                return false;
            }
            true
        })
        .collect();

    sort_by_priority(&mut filtered, hot_sort);
    if top_k > 0 {
        filtered.truncate(top_k as usize);
    }
    filtered
}
