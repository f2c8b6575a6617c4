//! Persistence contract for crawl state, plus an in-memory implementation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invcrawl_core::{
    dedupe_discovered, DataSource, DetailUpdate, DiscoveredItem, Item, PendingDetail, RunFinish,
    RunStatus, ScrapeRun, SiteProfile, SITE_PROFILE_KEY,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of marking a batch of discovered items as seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Subset of `updated` that was inactive before this run.
    pub reactivated: usize,
}

/// Storage operations used by the probe and production engines.
///
/// Items are unique per `(customer_id, data_source_id, source_item_id)`, and
/// `is_active` is false exactly when `removed_at` is set. Runs are only ever
/// finalized once.
#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn insert_data_source(&self, source: &DataSource) -> Result<()>;

    async fn get_data_source(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
    ) -> Result<Option<DataSource>>;

    /// Writes `config.siteProfile`, leaving the rest of the config untouched.
    /// Returns false when the data source does not exist.
    async fn save_site_profile(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        profile: &SiteProfile,
    ) -> Result<bool>;

    async fn create_run(&self, run: &ScrapeRun) -> Result<()>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>>;

    /// queued -> running. Returns false when the run is not queued.
    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool>;

    /// Finalizes a run that is not already terminal. Returns false otherwise.
    async fn finish_run(
        &self,
        run_id: Uuid,
        finish: &RunFinish,
        finished_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn upsert_seen_items(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        items: &[DiscoveredItem],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertSummary>;

    /// Deactivates every active item of the data source not seen in `run_id`.
    async fn mark_unseen_removed(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        removed_at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn count_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
    ) -> Result<usize>;

    /// Seen in `run_id` and never detail-fetched, oldest first.
    async fn list_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingDetail>>;

    async fn save_item_detail(
        &self,
        item_id: Uuid,
        run_id: Uuid,
        update: &DetailUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_items(&self, customer_id: Uuid, data_source_id: Uuid) -> Result<Vec<Item>>;
}

pub(crate) fn config_with_profile(config: &JsonValue, profile: JsonValue) -> JsonValue {
    let mut config = match config {
        JsonValue::Object(map) => JsonValue::Object(map.clone()),
        _ => json!({}),
    };
    if let Some(map) = config.as_object_mut() {
        map.insert(SITE_PROFILE_KEY.to_string(), profile);
    }
    config
}

type ItemKey = (Uuid, Uuid, String);

#[derive(Debug, Default)]
struct MemoryState {
    data_sources: HashMap<Uuid, DataSource>,
    runs: HashMap<Uuid, ScrapeRun>,
    items: HashMap<ItemKey, Item>,
}

/// In-process store with the same semantics as the Postgres store. Used by
/// tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCrawlStore {
    state: Mutex<MemoryState>,
}

impl MemoryCrawlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_items<'a>(items: impl Iterator<Item = &'a Item>) -> Vec<&'a Item> {
    let mut out: Vec<&Item> = items.collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    out
}

#[async_trait]
impl CrawlStore for MemoryCrawlStore {
    async fn insert_data_source(&self, source: &DataSource) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.data_sources.contains_key(&source.id) {
            anyhow::bail!("data source {} already exists", source.id);
        }
        state.data_sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn get_data_source(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
    ) -> Result<Option<DataSource>> {
        let state = self.state.lock().await;
        Ok(state
            .data_sources
            .get(&data_source_id)
            .filter(|ds| ds.customer_id == customer_id)
            .cloned())
    }

    async fn save_site_profile(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        profile: &SiteProfile,
    ) -> Result<bool> {
        let profile = serde_json::to_value(profile)?;
        let mut state = self.state.lock().await;
        match state
            .data_sources
            .get_mut(&data_source_id)
            .filter(|ds| ds.customer_id == customer_id)
        {
            Some(source) => {
                source.config = config_with_profile(&source.config, profile);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_run(&self, run: &ScrapeRun) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            anyhow::bail!("run {} already exists", run.id);
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.can_transition_to(RunStatus::Running) => {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        finish: &RunFinish,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = finish.status();
        run.finished_at = Some(finished_at);
        match finish {
            RunFinish::Success(counts) => {
                run.items_seen = counts.items_seen;
                run.items_new = counts.items_new;
                run.items_removed = counts.items_removed;
            }
            RunFinish::Failed { code, message } => {
                run.error_code = Some(code.as_str().to_string());
                run.error_message = Some(message.clone());
            }
        }
        Ok(true)
    }

    async fn upsert_seen_items(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        items: &[DiscoveredItem],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let items = dedupe_discovered(items.to_vec());
        let mut state = self.state.lock().await;
        let mut summary = UpsertSummary::default();

        for discovered in items {
            let key = (customer_id, data_source_id, discovered.source_item_id.clone());
            match state.items.entry(key) {
                Entry::Occupied(mut entry) => {
                    let item = entry.get_mut();
                    summary.updated += 1;
                    if !item.is_active {
                        summary.reactivated += 1;
                    }
                    item.url = discovered.url;
                    item.is_active = true;
                    item.removed_at = None;
                    item.last_seen_at = Some(seen_at);
                    item.last_seen_run_id = Some(run_id);
                }
                Entry::Vacant(entry) => {
                    summary.inserted += 1;
                    entry.insert(Item {
                        id: Uuid::new_v4(),
                        customer_id,
                        data_source_id,
                        source_item_id: discovered.source_item_id,
                        url: discovered.url,
                        title: None,
                        description_text: None,
                        price_amount: None,
                        price_currency: None,
                        primary_image_url: None,
                        image_urls_json: json!([]),
                        attributes_json: json!({}),
                        content_hash: None,
                        is_active: true,
                        removed_at: None,
                        last_seen_at: Some(seen_at),
                        last_seen_run_id: Some(run_id),
                        detail_fetched_at: None,
                        last_detail_run_id: None,
                        created_at: seen_at,
                    });
                }
            }
        }

        Ok(summary)
    }

    async fn mark_unseen_removed(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        removed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for item in state.items.values_mut() {
            if item.customer_id == customer_id
                && item.data_source_id == data_source_id
                && item.is_active
                && !item.is_seen_in(run_id)
            {
                item.is_active = false;
                item.removed_at = Some(removed_at);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
    ) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|i| {
                i.customer_id == customer_id
                    && i.data_source_id == data_source_id
                    && i.is_pending_detail(run_id)
            })
            .count())
    }

    async fn list_pending_detail(
        &self,
        customer_id: Uuid,
        data_source_id: Uuid,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingDetail>> {
        let state = self.state.lock().await;
        let pending = state.items.values().filter(|i| {
            i.customer_id == customer_id
                && i.data_source_id == data_source_id
                && i.is_pending_detail(run_id)
        });
        Ok(sorted_items(pending)
            .into_iter()
            .take(limit)
            .map(|i| PendingDetail {
                item_id: i.id,
                source_item_id: i.source_item_id.clone(),
                url: i.url.clone(),
            })
            .collect())
    }

    async fn save_item_detail(
        &self,
        item_id: Uuid,
        run_id: Uuid,
        update: &DetailUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .values_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| anyhow::anyhow!("item {item_id} not found"))?;
        let base = &update.fields.base_fields;
        item.title = base.title.clone();
        item.description_text = base.description_text.clone();
        item.price_amount = base.price_amount;
        item.price_currency = base.price_currency.clone();
        item.primary_image_url = base.primary_image_url.clone();
        item.image_urls_json = json!(update.fields.image_urls);
        item.attributes_json = JsonValue::Object(update.fields.attributes_json.clone());
        item.content_hash = Some(update.content_hash.clone());
        item.detail_fetched_at = Some(fetched_at);
        item.last_detail_run_id = Some(run_id);
        Ok(())
    }

    async fn list_items(&self, customer_id: Uuid, data_source_id: Uuid) -> Result<Vec<Item>> {
        let state = self.state.lock().await;
        let items = state
            .items
            .values()
            .filter(|i| i.customer_id == customer_id && i.data_source_id == data_source_id);
        Ok(sorted_items(items).into_iter().cloned().collect())
    }
}
