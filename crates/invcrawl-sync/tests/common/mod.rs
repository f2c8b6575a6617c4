#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use invcrawl_adapters::{
    AdapterError, DiscoveryContext, DiscoveryResult, HtmlMetaExtractor, ProfileDiscoverer,
    StrategyDiscoverer, StrategyRegistry,
};
use invcrawl_core::{
    CrawlLimits, DataSource, DiscoveredItem, DiscoveryStrategy, FetchDriverKind, SiteProfile,
};
use invcrawl_storage::{
    CrawlStore, FetchError, FetchOptions, FetchResult, FetchTrace, Fetcher, FetcherSet,
    MemoryCrawlStore,
};
use invcrawl_sync::{EngineConfig, MemoryEventSink, ProbeEngine, ProductionEngine};
use serde_json::json;
use uuid::Uuid;

pub const BASE_URL: &str = "https://dealer.example";

/// Serves canned pages; anything unknown is a 404 with an empty body.
pub struct StubFetcher {
    driver: FetchDriverKind,
    pages: Mutex<HashMap<String, (u16, String)>>,
    unreachable: Mutex<HashSet<String>>,
    requests: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::with_driver(FetchDriverKind::Http)
    }

    pub fn headless() -> Self {
        Self::with_driver(FetchDriverKind::Headless)
    }

    fn with_driver(driver: FetchDriverKind) -> Self {
        Self {
            driver,
            pages: Mutex::default(),
            unreachable: Mutex::default(),
            requests: Mutex::default(),
        }
    }

    /// Requests for `url` fail with a transport error.
    pub fn fail(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    pub fn serve(&self, url: &str, status: u16, body: impl Into<String>) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.into()));
    }

    pub fn serve_detail(&self, item: &DiscoveredItem) {
        self.serve(&item.url, 200, detail_html(&item.source_item_id));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    fn driver(&self) -> FetchDriverKind {
        self.driver
    }

    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResult, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.unreachable.lock().unwrap().contains(url) {
            let err = reqwest::Client::new()
                .get("http://[::1")
                .build()
                .unwrap_err();
            return Err(FetchError::Request(err));
        }
        let (status, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(FetchResult {
            status,
            final_url: url.to_string(),
            body,
            trace: FetchTrace::default(),
        })
    }
}

/// Returns whatever item list the test sets, or a configured error.
pub struct StubStrategy {
    strategy: DiscoveryStrategy,
    items: Mutex<Vec<DiscoveredItem>>,
    failure: Mutex<Option<String>>,
    drivers: Mutex<Vec<FetchDriverKind>>,
}

impl StubStrategy {
    pub fn new(strategy: DiscoveryStrategy, items: Vec<DiscoveredItem>) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            items: Mutex::new(items),
            failure: Mutex::new(None),
            drivers: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(strategy: DiscoveryStrategy, message: &str) -> Arc<Self> {
        let stub = Self::new(strategy, Vec::new());
        *stub.failure.lock().unwrap() = Some(message.to_string());
        stub
    }

    pub fn set_items(&self, items: Vec<DiscoveredItem>) {
        *self.items.lock().unwrap() = items;
    }

    /// Driver kind handed to each `discover` call.
    pub fn drivers_seen(&self) -> Vec<FetchDriverKind> {
        self.drivers.lock().unwrap().clone()
    }
}

#[async_trait]
impl StrategyDiscoverer for StubStrategy {
    fn strategy(&self) -> DiscoveryStrategy {
        self.strategy
    }

    async fn discover(
        &self,
        driver: &dyn Fetcher,
        _profile: &SiteProfile,
        _ctx: &DiscoveryContext,
    ) -> Result<DiscoveryResult, AdapterError> {
        self.drivers.lock().unwrap().push(driver.driver());
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(AdapterError::Message(message));
        }
        Ok(DiscoveryResult::new(self.items.lock().unwrap().clone()))
    }
}

pub fn detail_html(id: &str) -> String {
    format!(
        r#"<html><head>
<title>Vehicle {id} | Dealer</title>
<meta property="og:image" content="{BASE_URL}/img/{id}.jpg">
<meta property="product:price:amount" content="12990">
<meta property="product:price:currency" content="EUR">
</head><body>
<h1>Vehicle {id}</h1>
<dl><dt>Mileage</dt><dd>120 000 km</dd><dt>Fuel</dt><dd>Diesel</dd><dt>Year</dt><dd>2016</dd></dl>
</body></html>"#
    )
}

pub fn items(prefix: &str, count: usize) -> Vec<DiscoveredItem> {
    (1..=count)
        .map(|n| {
            let id = format!("{prefix}-{n}");
            DiscoveredItem::new(id.clone(), format!("{BASE_URL}/cars/{id}"))
        })
        .collect()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        limits: CrawlLimits {
            politeness_delay_ms: 0,
            removal_threshold: 5,
            ..CrawlLimits::default()
        },
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryCrawlStore>,
    pub fetcher: Arc<StubFetcher>,
    pub headless: Arc<StubFetcher>,
    pub events: Arc<MemoryEventSink>,
    pub customer_id: Uuid,
    pub data_source_id: Uuid,
    registry: StrategyRegistry,
    config: EngineConfig,
    headless_enabled: bool,
}

impl Harness {
    pub async fn new(strategies: Vec<Arc<StubStrategy>>) -> Self {
        Self::with_config(strategies, test_config()).await
    }

    /// Harness whose fetcher set also carries a headless driver.
    pub async fn with_headless(strategies: Vec<Arc<StubStrategy>>) -> Self {
        let mut harness = Self::new(strategies).await;
        harness.headless_enabled = true;
        harness
    }

    pub async fn with_config(strategies: Vec<Arc<StubStrategy>>, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryCrawlStore::new());
        let customer_id = Uuid::new_v4();
        let data_source_id = Uuid::new_v4();
        store
            .insert_data_source(&DataSource {
                id: data_source_id,
                customer_id,
                base_url: BASE_URL.to_string(),
                config: json!({}),
            })
            .await
            .unwrap();

        let registry = strategies
            .into_iter()
            .fold(StrategyRegistry::new(), |registry, stub| registry.register(stub));

        Self {
            store,
            fetcher: Arc::new(StubFetcher::new()),
            headless: Arc::new(StubFetcher::headless()),
            events: Arc::new(MemoryEventSink::new()),
            customer_id,
            data_source_id,
            registry,
            config,
            headless_enabled: false,
        }
    }

    pub fn fetchers(&self) -> FetcherSet {
        let fetchers = FetcherSet::new(self.fetcher.clone());
        if self.headless_enabled {
            fetchers.with_headless(self.headless.clone())
        } else {
            fetchers
        }
    }

    pub fn probe_engine(&self) -> ProbeEngine {
        ProbeEngine::new(
            self.store.clone(),
            self.fetchers(),
            self.registry.clone(),
            Arc::new(HtmlMetaExtractor),
            self.events.clone(),
            self.config.clone(),
        )
    }

    pub fn production_engine(&self) -> ProductionEngine {
        ProductionEngine::new(
            self.store.clone(),
            self.fetchers(),
            Arc::new(ProfileDiscoverer::new(self.registry.clone())),
            Arc::new(HtmlMetaExtractor),
            self.events.clone(),
            self.config.clone(),
        )
    }

    pub fn serve_details(&self, items: &[DiscoveredItem]) {
        for item in items {
            self.fetcher.serve_detail(item);
        }
    }

    pub async fn profile(&self) -> Option<SiteProfile> {
        self.store
            .get_data_source(self.customer_id, self.data_source_id)
            .await
            .unwrap()
            .and_then(|ds| ds.site_profile().unwrap())
    }

    /// Stores a resolved profile without probing.
    pub async fn install_profile(&self, strategy: DiscoveryStrategy) {
        let mut profile = SiteProfile::draft(BASE_URL, chrono::Utc::now());
        profile.discovery.strategy = strategy;
        if strategy.requires_headless() {
            profile.fetch.driver = FetchDriverKind::Headless;
            profile.fetch.headless.enabled = true;
        }
        profile.probe.confidence = 0.9;
        assert!(self
            .store
            .save_site_profile(self.customer_id, self.data_source_id, &profile)
            .await
            .unwrap());
    }
}
