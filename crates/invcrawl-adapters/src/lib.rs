//! Discovery strategy contracts, the production discoverer, and detail extraction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invcrawl_core::{dedupe_discovered, DiscoveredItem, DiscoveryStrategy, SiteProfile, PROBE_ORDER};
use invcrawl_storage::{FetchError, FetchOptions, Fetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod extract;

pub use extract::{Extractor, HtmlMetaExtractor};

pub const CRATE_NAME: &str = "invcrawl-adapters";

/// Run-scoped inputs handed to a discovery implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryContext {
    pub run_id: Uuid,
    pub data_source_id: Uuid,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub max_html_bytes: usize,
}

impl DiscoveryContext {
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions::new(self.timeout_ms, self.max_html_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub items: Vec<DiscoveredItem>,
    /// Free-form diagnostics (pages walked, sitemap count, ...).
    #[serde(default)]
    pub meta: JsonValue,
}

impl DiscoveryResult {
    pub fn new(items: Vec<DiscoveredItem>) -> Self {
        Self {
            items,
            meta: JsonValue::Null,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("site profile has no resolved discovery strategy")]
    UnresolvedStrategy,
    #[error("no discovery implementation registered for {0}")]
    StrategyUnavailable(DiscoveryStrategy),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One discovery technique (sitemap, HTML links, ...). Implementations are
/// plugged in through a [`StrategyRegistry`].
#[async_trait]
pub trait StrategyDiscoverer: Send + Sync {
    fn strategy(&self) -> DiscoveryStrategy;

    async fn discover(
        &self,
        driver: &dyn Fetcher,
        profile: &SiteProfile,
        ctx: &DiscoveryContext,
    ) -> Result<DiscoveryResult, AdapterError>;
}

/// Lookup table of strategy implementations. Iteration always follows
/// [`PROBE_ORDER`], never registration order.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    by_strategy: HashMap<DiscoveryStrategy, Arc<dyn StrategyDiscoverer>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, discoverer: Arc<dyn StrategyDiscoverer>) -> Self {
        self.by_strategy.insert(discoverer.strategy(), discoverer);
        self
    }

    pub fn get(&self, strategy: DiscoveryStrategy) -> Option<Arc<dyn StrategyDiscoverer>> {
        self.by_strategy.get(&strategy).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.by_strategy.is_empty()
    }

    pub fn registered(&self) -> Vec<DiscoveryStrategy> {
        PROBE_ORDER
            .iter()
            .copied()
            .filter(|s| self.by_strategy.contains_key(s))
            .collect()
    }

    pub fn in_probe_order(
        &self,
    ) -> impl Iterator<Item = (DiscoveryStrategy, Option<Arc<dyn StrategyDiscoverer>>)> + '_ {
        PROBE_ORDER.iter().map(|s| (*s, self.get(*s)))
    }
}

/// Production discovery: enumerates the current items of a site using its
/// persisted profile.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(
        &self,
        driver: &dyn Fetcher,
        profile: &SiteProfile,
        ctx: &DiscoveryContext,
    ) -> Result<DiscoveryResult, AdapterError>;
}

/// Drops `fraction` of `items` from the tail. Returns the number dropped.
pub fn simulate_removals(items: &mut Vec<DiscoveredItem>, fraction: f64) -> usize {
    if !fraction.is_finite() || fraction <= 0.0 {
        return 0;
    }
    let fraction = fraction.min(1.0);
    let drop = ((items.len() as f64) * fraction).floor() as usize;
    items.truncate(items.len() - drop);
    drop
}

/// Dispatches to the registered implementation of the profile's strategy.
#[derive(Clone)]
pub struct ProfileDiscoverer {
    registry: StrategyRegistry,
    simulate_removals_fraction: Option<f64>,
}

impl ProfileDiscoverer {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self {
            registry,
            simulate_removals_fraction: None,
        }
    }

    pub fn with_simulated_removals(mut self, fraction: Option<f64>) -> Self {
        self.simulate_removals_fraction = fraction;
        self
    }
}

#[async_trait]
impl Discoverer for ProfileDiscoverer {
    async fn discover(
        &self,
        driver: &dyn Fetcher,
        profile: &SiteProfile,
        ctx: &DiscoveryContext,
    ) -> Result<DiscoveryResult, AdapterError> {
        let strategy = profile.discovery.strategy;
        if strategy.is_unknown() {
            return Err(AdapterError::UnresolvedStrategy);
        }
        let implementation = self
            .registry
            .get(strategy)
            .ok_or(AdapterError::StrategyUnavailable(strategy))?;

        let result = implementation.discover(driver, profile, ctx).await?;
        let raw_count = result.items.len();
        let mut items = dedupe_discovered(result.items);
        let deduped_count = items.len();

        let simulated = self
            .simulate_removals_fraction
            .map(|fraction| simulate_removals(&mut items, fraction))
            .unwrap_or(0);

        debug!(
            strategy = %strategy,
            raw_count,
            deduped_count,
            simulated,
            "discovery finished"
        );

        let mut meta = match result.meta {
            JsonValue::Object(map) => map,
            JsonValue::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("strategyMeta".to_string(), other);
                map
            }
        };
        meta.insert("strategy".to_string(), json!(strategy.as_str()));
        meta.insert("rawCount".to_string(), json!(raw_count));
        if simulated > 0 {
            meta.insert("simulatedRemovals".to_string(), json!(simulated));
        }

        Ok(DiscoveryResult {
            items,
            meta: JsonValue::Object(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invcrawl_core::FetchDriverKind;
    use invcrawl_storage::{FetchResult, FetchTrace};

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        fn driver(&self) -> FetchDriverKind {
            FetchDriverKind::Http
        }

        async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResult, FetchError> {
            Ok(FetchResult {
                status: 404,
                final_url: url.to_string(),
                body: String::new(),
                trace: FetchTrace::default(),
            })
        }
    }

    struct FixedStrategy {
        strategy: DiscoveryStrategy,
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl StrategyDiscoverer for FixedStrategy {
        fn strategy(&self) -> DiscoveryStrategy {
            self.strategy
        }

        async fn discover(
            &self,
            _driver: &dyn Fetcher,
            _profile: &SiteProfile,
            _ctx: &DiscoveryContext,
        ) -> Result<DiscoveryResult, AdapterError> {
            Ok(DiscoveryResult::new(
                self.ids
                    .iter()
                    .map(|id| DiscoveredItem::new(*id, format!("https://dealer.example/cars/{id}")))
                    .collect(),
            ))
        }
    }

    fn ctx() -> DiscoveryContext {
        DiscoveryContext {
            run_id: Uuid::new_v4(),
            data_source_id: Uuid::new_v4(),
            base_url: "https://dealer.example".to_string(),
            started_at: Utc::now(),
            timeout_ms: 1_000,
            max_html_bytes: 0,
        }
    }

    fn profile(strategy: DiscoveryStrategy) -> SiteProfile {
        let mut profile = SiteProfile::draft("https://dealer.example", Utc::now());
        profile.discovery.strategy = strategy;
        profile
    }

    #[test]
    fn registry_iterates_in_probe_order() {
        let registry = StrategyRegistry::new()
            .register(Arc::new(FixedStrategy {
                strategy: DiscoveryStrategy::HeadlessListing,
                ids: vec![],
            }))
            .register(Arc::new(FixedStrategy {
                strategy: DiscoveryStrategy::Sitemap,
                ids: vec![],
            }));

        let order: Vec<_> = registry.in_probe_order().map(|(s, imp)| (s, imp.is_some())).collect();
        assert_eq!(
            order,
            vec![
                (DiscoveryStrategy::Sitemap, true),
                (DiscoveryStrategy::HtmlLinks, false),
                (DiscoveryStrategy::EndpointSniff, false),
                (DiscoveryStrategy::HeadlessListing, true),
            ]
        );
        assert_eq!(
            registry.registered(),
            vec![DiscoveryStrategy::Sitemap, DiscoveryStrategy::HeadlessListing]
        );
    }

    #[test]
    fn simulated_removals_drop_from_tail() {
        let mut items: Vec<_> = (0..10)
            .map(|i| DiscoveredItem::new(i.to_string(), format!("https://x.example/i/{i}")))
            .collect();
        assert_eq!(simulate_removals(&mut items, 0.25), 2);
        assert_eq!(items.len(), 8);
        assert_eq!(items.last().unwrap().source_item_id, "7");
        assert_eq!(simulate_removals(&mut items, 0.0), 0);
        assert_eq!(simulate_removals(&mut items, f64::NAN), 0);
        assert_eq!(simulate_removals(&mut items, 3.0), 8);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn profile_discoverer_dispatches_and_dedupes() {
        let registry = StrategyRegistry::new().register(Arc::new(FixedStrategy {
            strategy: DiscoveryStrategy::HtmlLinks,
            ids: vec!["a", "b", "a", "c"],
        }));
        let discoverer = ProfileDiscoverer::new(registry).with_simulated_removals(Some(0.34));

        let result = discoverer
            .discover(&NoFetch, &profile(DiscoveryStrategy::HtmlLinks), &ctx())
            .await
            .unwrap();
        let ids: Vec<_> = result.items.iter().map(|i| i.source_item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(result.meta["rawCount"], json!(4));
        assert_eq!(result.meta["simulatedRemovals"], json!(1));
    }

    #[tokio::test]
    async fn profile_discoverer_rejects_unknown_and_unregistered() {
        let discoverer = ProfileDiscoverer::new(StrategyRegistry::new());
        let err = discoverer
            .discover(&NoFetch, &profile(DiscoveryStrategy::Unknown), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnresolvedStrategy));

        let err = discoverer
            .discover(&NoFetch, &profile(DiscoveryStrategy::Sitemap), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::StrategyUnavailable(DiscoveryStrategy::Sitemap)));
    }
}
