//! Incremental production crawl: discover, diff, guard removals, fetch details.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use invcrawl_adapters::{AdapterError, Discoverer, DiscoveryContext, Extractor};
use invcrawl_core::{
    dedupe_discovered, should_run_removals, DetailUpdate, PendingDetail, RunCounts, RunFinish,
    RunStage, RunType,
};
use invcrawl_storage::{CrawlStore, FetchError, FetchOptions, Fetcher, FetcherSet};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::CrawlError;
use crate::events::{
    EventLevel, EventScope, EventSink, DETAIL_BATCH_DEFERRED, DETAIL_FETCH_FAILED,
    REMOVALS_SKIPPED, RUN_COMPLETED,
};
use crate::jobs::{
    acknowledge, begin_run, fail_run, owned_run_id, DetailStats, JobCorrelation, JobHandle,
    JobOutcome, RunStart,
};

/// Why a single item's detail fetch was abandoned. Never fails the run.
#[derive(Debug, Error)]
pub enum DetailFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("http status {0}")]
    Status(u16),
    #[error("empty body")]
    EmptyBody,
    #[error("extraction failed: {0}")]
    Extract(#[from] AdapterError),
}

impl DetailFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Status(_) => "status",
            Self::EmptyBody => "empty_body",
            Self::Extract(_) => "extract",
        }
    }
}

pub struct ProductionEngine {
    store: Arc<dyn CrawlStore>,
    fetchers: FetcherSet,
    discoverer: Arc<dyn Discoverer>,
    extractor: Arc<dyn Extractor>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
    concurrency_warned: AtomicBool,
}

impl ProductionEngine {
    pub fn new(
        store: Arc<dyn CrawlStore>,
        fetchers: FetcherSet,
        discoverer: Arc<dyn Discoverer>,
        extractor: Arc<dyn Extractor>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            fetchers,
            discoverer,
            extractor,
            events,
            config,
            concurrency_warned: AtomicBool::new(false),
        }
    }

    fn warn_sequential_once(&self, detail_concurrency: usize) {
        if detail_concurrency > 1 && !self.concurrency_warned.swap(true, Ordering::Relaxed) {
            warn!(
                detail_concurrency,
                "detailConcurrency is configured but detail fetching runs sequentially"
            );
        }
    }

    /// Production job for one data source. Idempotent per run id.
    pub async fn run(&self, correlation: &JobCorrelation, handle: &dyn JobHandle) -> JobOutcome {
        let mut scope = EventScope {
            customer_id: correlation.customer_id,
            job_type: RunType::Prod,
            job_id: correlation.job_id.clone(),
            run_id: correlation.run_id,
            data_source_id: Some(correlation.data_source_id),
        };

        let run_id = match begin_run(self.store.as_ref(), correlation, RunType::Prod).await {
            Ok(RunStart::Started(run_id)) => run_id,
            Ok(RunStart::AlreadyFinished(run)) => {
                info!(run_id = %run.id, status = run.status.as_str(), "production run already finished");
                acknowledge(handle, run.id).await;
                return JobOutcome::AlreadyFinished {
                    run_id: run.id,
                    status: run.status,
                };
            }
            Err(err) => {
                scope.run_id = owned_run_id(correlation, &err);
                return fail_run(
                    self.store.as_ref(),
                    self.events.as_ref(),
                    handle,
                    &scope,
                    RunStage::Queued,
                    scope.run_id,
                    err,
                )
                .await;
            }
        };
        scope.run_id = Some(run_id);

        let mut stage = RunStage::Queued;
        match self.execute(run_id, correlation, &scope, &mut stage).await {
            Ok((counts, detail)) => {
                acknowledge(handle, run_id).await;
                JobOutcome::Crawled {
                    run_id,
                    counts,
                    detail,
                }
            }
            Err(err) => {
                warn!(run_id = %run_id, stage = stage.as_str(), error = %err, "production run failed");
                fail_run(
                    self.store.as_ref(),
                    self.events.as_ref(),
                    handle,
                    &scope,
                    stage,
                    Some(run_id),
                    err,
                )
                .await
            }
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        correlation: &JobCorrelation,
        scope: &EventScope,
        stage: &mut RunStage,
    ) -> Result<(RunCounts, DetailStats), CrawlError> {
        let (customer_id, data_source_id) = (correlation.customer_id, correlation.data_source_id);

        let source = self
            .store
            .get_data_source(customer_id, data_source_id)
            .await
            .context("loading data source")?
            .ok_or(CrawlError::NotFound {
                customer_id,
                data_source_id,
            })?;
        let profile = source
            .site_profile()
            .context("decoding site profile")?
            .filter(|p| p.is_resolved())
            .ok_or(CrawlError::ProfileMissing(data_source_id))?;

        let limits = profile.limits(self.config.limits);
        self.warn_sequential_once(limits.detail_concurrency);
        info!(
            run_id = %run_id,
            data_source_id = %data_source_id,
            strategy = %profile.discovery.strategy,
            driver = profile.fetch.driver.as_str(),
            max_new_per_run = limits.max_new_per_run,
            removal_threshold = limits.removal_threshold,
            detail_concurrency = limits.detail_concurrency,
            "production run started"
        );

        *stage = RunStage::Discovery;
        let driver = self
            .fetchers
            .select(profile.fetch.driver)
            .context("selecting fetch driver")?;
        let ctx = DiscoveryContext {
            run_id,
            data_source_id,
            base_url: source.base_url.clone(),
            started_at: Utc::now(),
            timeout_ms: profile.fetch.timeout_ms(),
            max_html_bytes: limits.max_html_bytes,
        };
        let discovery = self
            .discoverer
            .discover(driver.as_ref(), &profile, &ctx)
            .await
            .context("discovering items")?;
        let items = dedupe_discovered(discovery.items);
        let discovered_count = items.len();

        *stage = RunStage::Diff;
        let upsert = self
            .store
            .upsert_seen_items(customer_id, data_source_id, run_id, &items, Utc::now())
            .await?;

        *stage = RunStage::RemovalGuard;
        let items_removed = if should_run_removals(discovered_count, limits.removal_threshold) {
            self.store
                .mark_unseen_removed(customer_id, data_source_id, run_id, Utc::now())
                .await?
        } else {
            self.events.emit(
                scope
                    .event(
                        EventLevel::Warn,
                        RunStage::RemovalGuard,
                        REMOVALS_SKIPPED,
                        format!(
                            "discovered {discovered_count} items, below removal threshold {}",
                            limits.removal_threshold
                        ),
                    )
                    .with_meta(json!({
                        "discoveredCount": discovered_count,
                        "removalThreshold": limits.removal_threshold,
                    })),
            );
            0
        };

        *stage = RunStage::DetailFetch;
        let total_new = self
            .store
            .count_pending_detail(customer_id, data_source_id, run_id)
            .await?;
        let batch = self
            .store
            .list_pending_detail(customer_id, data_source_id, run_id, limits.max_new_per_run)
            .await?;
        let mut detail = DetailStats {
            skipped: total_new.saturating_sub(batch.len()),
            ..Default::default()
        };
        if detail.skipped > 0 {
            self.events.emit(
                scope
                    .event(
                        EventLevel::Info,
                        RunStage::DetailFetch,
                        DETAIL_BATCH_DEFERRED,
                        format!("{} new items deferred to a later run", detail.skipped),
                    )
                    .with_meta(json!({
                        "totalNew": total_new,
                        "batchSize": batch.len(),
                        "skipped": detail.skipped,
                    })),
            );
        }

        let options = FetchOptions::new(profile.fetch.timeout_ms(), limits.max_html_bytes);
        let delay = Duration::from_millis(limits.politeness_delay_ms);
        for (index, pending) in batch.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.fetch_detail(driver.as_ref(), pending, &options).await {
                Ok(update) => {
                    self.store
                        .save_item_detail(pending.item_id, run_id, &update, Utc::now())
                        .await?;
                    detail.fetched += 1;
                }
                Err(failure) => {
                    detail.failed += 1;
                    self.events.emit(
                        scope
                            .event(
                                EventLevel::Warn,
                                RunStage::DetailFetch,
                                DETAIL_FETCH_FAILED,
                                format!("detail fetch failed for {}: {failure}", pending.url),
                            )
                            .with_meta(json!({
                                "itemId": pending.item_id,
                                "sourceItemId": pending.source_item_id,
                                "url": pending.url,
                                "reason": failure.kind(),
                            })),
                    );
                }
            }
        }

        *stage = RunStage::Finalize;
        let counts = RunCounts {
            items_seen: discovered_count,
            items_new: total_new,
            items_removed,
        };
        let finalized = self
            .store
            .finish_run(run_id, &RunFinish::Success(counts), Utc::now())
            .await
            .context("finalizing production run")?;
        if !finalized {
            warn!(run_id = %run_id, "run was already terminal at finalize");
        }

        self.events.emit(
            scope
                .event(
                    EventLevel::Info,
                    RunStage::Finalize,
                    RUN_COMPLETED,
                    format!(
                        "seen {discovered_count}, new {total_new}, removed {items_removed}"
                    ),
                )
                .with_meta(json!({
                    "itemsSeen": counts.items_seen,
                    "itemsNew": counts.items_new,
                    "itemsRemoved": counts.items_removed,
                    "inserted": upsert.inserted,
                    "reactivated": upsert.reactivated,
                    "fetched": detail.fetched,
                    "failed": detail.failed,
                    "skipped": detail.skipped,
                    "discovery": discovery.meta,
                })),
        );

        Ok((counts, detail))
    }

    async fn fetch_detail(
        &self,
        driver: &dyn Fetcher,
        pending: &PendingDetail,
        options: &FetchOptions,
    ) -> Result<DetailUpdate, DetailFailure> {
        let page = driver.fetch(&pending.url, options).await?;
        if page.status != 200 {
            return Err(DetailFailure::Status(page.status));
        }
        if page.body.trim().is_empty() {
            return Err(DetailFailure::EmptyBody);
        }
        let fields = self.extractor.extract(&page)?;
        Ok(DetailUpdate::from_fields(fields))
    }
}
