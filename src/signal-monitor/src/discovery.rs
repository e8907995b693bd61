//! Market discovery: resolve configured categories to catalog tags, pull
//! and filter their markets, split off untradeable ones, and merge in the
//! cross-category top list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use common::clock::now_ms;
use common::config::{FilterConfig, RollingConfig, TopConfig};
use common::gamma::{GammaClient, GammaError};
use common::models::{Market, Tag};
use common::selection::{select_primary_markets, select_top_markets};

/// What discovery needs from the catalog API.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_tags(&self) -> Result<Vec<Tag>, GammaError>;

    async fn list_markets(
        &self,
        tag_id: &str,
        active: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError>;

    async fn list_top_markets(
        &self,
        limit: usize,
        order: Option<&str>,
        ascending: bool,
        featured_only: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError>;
}

#[async_trait]
impl Catalog for GammaClient {
    async fn list_tags(&self) -> Result<Vec<Tag>, GammaError> {
        GammaClient::list_tags(self).await
    }

    async fn list_markets(
        &self,
        tag_id: &str,
        active: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError> {
        GammaClient::list_markets(self, tag_id, active, closed).await
    }

    async fn list_top_markets(
        &self,
        limit: usize,
        order: Option<&str>,
        ascending: bool,
        featured_only: bool,
        closed: bool,
    ) -> Result<Vec<Market>, GammaError> {
        GammaClient::list_top_markets(self, limit, order, ascending, featured_only, closed).await
    }
}

/// One refresh worth of universe.
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    pub markets_by_category: HashMap<String, Vec<Market>>,
    /// Live markets without a streamed order book; observed by polling.
    pub untradeable: Vec<Market>,
}

pub struct Discovery {
    catalog: Arc<dyn Catalog>,
    filters: FilterConfig,
    rolling: RollingConfig,
    top: TopConfig,
    drop_expired: bool,
}

impl Discovery {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        filters: FilterConfig,
        rolling: RollingConfig,
        top: TopConfig,
        drop_expired: bool,
    ) -> Self {
        Self {
            catalog,
            filters,
            rolling,
            top,
            drop_expired,
        }
    }

    pub async fn refresh(&self, categories: &[String]) -> Result<DiscoveryResult, GammaError> {
        let tags = self.catalog.list_tags().await?;
        let tag_map = resolve_tag_ids(&tags, categories);
        let now = now_ms();

        let mut result = DiscoveryResult::default();
        let mut selected_ids: HashSet<String> = HashSet::new();

        for category in categories {
            let Some(tag_id) = tag_map.get(category) else {
                warn!(category, "no catalog tag for category");
                result.markets_by_category.insert(category.clone(), Vec::new());
                continue;
            };

            let markets = self.catalog.list_markets(tag_id, true, false).await?;
            let (active, untradeable) = self.prepare(markets, category, now);

            selected_ids.extend(untradeable.iter().map(|m| m.market_id.clone()));
            result.untradeable.extend(untradeable);

            let selected = self.select(active);
            selected_ids.extend(selected.iter().map(|m| m.market_id.clone()));
            info!(category, count = selected.len(), "category refreshed");
            result.markets_by_category.insert(category.clone(), selected);
        }

        if self.top.enabled {
            let markets = self
                .catalog
                .list_top_markets(
                    self.top.limit,
                    Some(self.top.order.as_str()),
                    self.top.ascending,
                    self.top.featured_only,
                    false,
                )
                .await?;
            let (active, untradeable) = self.prepare(markets, &self.top.category_name, now);

            for market in untradeable {
                if selected_ids.insert(market.market_id.clone()) {
                    result.untradeable.push(market);
                }
            }

            let selected: Vec<Market> = select_top_markets(
                active,
                0,
                &self.filters.hot_sort,
                self.filters.min_liquidity,
                &self.filters.keyword_allow,
                &self.filters.keyword_block,
            )
            .into_iter()
            .filter(|market| selected_ids.insert(market.market_id.clone()))
            .collect();
            info!(count = selected.len(), "top list refreshed");
            result
                .markets_by_category
                .insert(self.top.category_name.clone(), selected);
        }

        Ok(result)
    }

    /// Keep live, focus-matched, unexpired markets tagged with the
    /// category; split out the untradeable ones.
    fn prepare(
        &self,
        markets: Vec<Market>,
        category: &str,
        now_ms: i64,
    ) -> (Vec<Market>, Vec<Market>) {
        let mut active = Vec::new();
        let mut untradeable = Vec::new();
        for mut market in markets {
            if !market.is_live() {
                continue;
            }
            if !matches_focus(&market, &self.filters.focus_keywords) {
                continue;
            }
            if self.drop_expired && market.is_expired(now_ms) {
                continue;
            }
            market.category = Some(category.to_string());
            if market.is_untradeable() {
                untradeable.push(market);
            } else {
                active.push(market);
            }
        }
        (active, untradeable)
    }

    fn select(&self, active: Vec<Market>) -> Vec<Market> {
        let active = if self.rolling.enabled {
            select_primary_markets(
                active,
                &self.rolling.primary_selection_priority,
                self.rolling.max_markets_per_topic,
            )
        } else {
            active
        };
        select_top_markets(
            active,
            self.filters.top_k_per_category,
            &self.filters.hot_sort,
            self.filters.min_liquidity,
            &self.filters.keyword_allow,
            &self.filters.keyword_block,
        )
    }
}

fn matches_focus(market: &Market, focus_keywords: &[String]) -> bool {
    if focus_keywords.is_empty() {
        return true;
    }
    let question = market.question.to_lowercase();
    focus_keywords
        .iter()
        .any(|keyword| question.contains(&keyword.to_lowercase()))
}

/// Resolve each category to a tag id: exact slug/name match first,
/// substring fallback second.
pub fn resolve_tag_ids(tags: &[Tag], categories: &[String]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for category in categories {
        let category_lower = category.to_lowercase();
        let mut exact: Option<&Tag> = None;
        let mut fuzzy: Option<&Tag> = None;
        for tag in tags {
            let slug = tag.slug.as_deref().unwrap_or("").to_lowercase();
            let name = tag.name.as_deref().unwrap_or("").to_lowercase();
            if slug == category_lower || name == category_lower {
                exact = Some(tag);
                break;
            }
            if fuzzy.is_none()
                && ((!slug.is_empty() && slug.contains(&category_lower))
                    || (!name.is_empty() && name.contains(&category_lower)))
            {
                fuzzy = Some(tag);
            }
        }
        if let Some(tag) = exact.or(fuzzy) {
            mapping.insert(category.clone(), tag.tag_id.clone());
        }
    }
    mapping
}
