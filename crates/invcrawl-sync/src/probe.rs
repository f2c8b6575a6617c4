//! Strategy cascade that learns a site profile for one website.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use invcrawl_adapters::{DiscoveryContext, Extractor, StrategyRegistry};
use invcrawl_core::{
    classify_vertical, learn_detail_url_patterns, score_confidence, DiscoveredItem,
    DiscoveryStrategy, ExtractedFields, FetchDriverKind, RunCounts, RunFinish, RunStage, RunType,
    SiteProfile, Vertical, EARLY_EXIT_ITEM_COUNT, PROBE_SAMPLE_SIZE,
};
use invcrawl_storage::{CrawlStore, FetchOptions, Fetcher, FetcherSet};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::CrawlError;
use crate::events::{
    EventLevel, EventScope, EventSink, HEADLESS_USED, PROBE_STRATEGY_FAILED,
    PROBE_STRATEGY_SELECTED,
};
use crate::jobs::{
    acknowledge, begin_run, fail_run, owned_run_id, JobCorrelation, JobHandle, JobOutcome,
    RunStart,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyStatus {
    Skipped(String),
    Failed(String),
    Discovered { count: usize, validated: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub strategy: DiscoveryStrategy,
    pub status: StrategyStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub profile: SiteProfile,
    pub found_count: usize,
    pub outcomes: Vec<StrategyOutcome>,
}

struct Candidate {
    strategy: DiscoveryStrategy,
    items: Vec<DiscoveredItem>,
}

struct Validated {
    candidate: Candidate,
    sample_url: String,
    fields: ExtractedFields,
}

pub struct ProbeEngine {
    store: Arc<dyn CrawlStore>,
    fetchers: FetcherSet,
    registry: StrategyRegistry,
    extractor: Arc<dyn Extractor>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl ProbeEngine {
    pub fn new(
        store: Arc<dyn CrawlStore>,
        fetchers: FetcherSet,
        registry: StrategyRegistry,
        extractor: Arc<dyn Extractor>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        if registry.is_empty() {
            warn!("no discovery strategies registered; every probe will resolve to unknown");
        }
        Self {
            store,
            fetchers,
            registry,
            extractor,
            events,
            config,
        }
    }

    fn strategy_driver(
        &self,
        strategy: DiscoveryStrategy,
    ) -> Option<(Arc<dyn Fetcher>, u64)> {
        if strategy.requires_headless() {
            self.fetchers
                .select(FetchDriverKind::Headless)
                .ok()
                .map(|d| (d, self.config.headless_timeout_ms))
        } else {
            self.fetchers
                .select(FetchDriverKind::Http)
                .ok()
                .map(|d| (d, self.config.http_timeout_ms))
        }
    }

    /// First sample (in discovery order) that fetches as a 200 page and
    /// extracts to something detail-like.
    async fn validate_samples(
        &self,
        driver: &dyn Fetcher,
        items: &[DiscoveredItem],
        options: &FetchOptions,
    ) -> Option<(String, ExtractedFields)> {
        for item in items.iter().take(PROBE_SAMPLE_SIZE) {
            let page = match driver.fetch(&item.url, options).await {
                Ok(page) if page.is_usable_page() => page,
                Ok(page) => {
                    debug!(url = %item.url, status = page.status, "probe sample not usable");
                    continue;
                }
                Err(e) => {
                    debug!(url = %item.url, error = %e, "probe sample fetch failed");
                    continue;
                }
            };
            match self.extractor.extract(&page) {
                Ok(fields) if fields.looks_like_detail() => return Some((item.url.clone(), fields)),
                Ok(_) => debug!(url = %item.url, "probe sample has no title or image"),
                Err(e) => debug!(url = %item.url, error = %e, "probe sample extraction failed"),
            }
        }
        None
    }

    /// Runs the strategy cascade against `ctx.base_url` and assembles a profile.
    /// Strategy failures are recorded in the report, never returned.
    pub async fn probe(&self, ctx: &DiscoveryContext) -> ProbeReport {
        let draft = SiteProfile::draft(&ctx.base_url, ctx.started_at);
        let mut notes = Vec::new();
        let mut outcomes = Vec::new();
        let mut fallback: Option<Candidate> = None;
        let mut winner: Option<Validated> = None;

        for (strategy, implementation) in self.registry.in_probe_order() {
            let Some(implementation) = implementation else {
                notes.push(format!("{strategy}: skipped, no implementation registered"));
                outcomes.push(StrategyOutcome {
                    strategy,
                    status: StrategyStatus::Skipped("not registered".to_string()),
                });
                continue;
            };
            let Some((driver, timeout_ms)) = self.strategy_driver(strategy) else {
                notes.push(format!("{strategy}: skipped, headless driver not configured"));
                outcomes.push(StrategyOutcome {
                    strategy,
                    status: StrategyStatus::Skipped("headless driver not configured".to_string()),
                });
                continue;
            };

            let mut candidate_profile = draft.clone();
            candidate_profile.discovery.strategy = strategy;
            if strategy.requires_headless() {
                candidate_profile.fetch.driver = FetchDriverKind::Headless;
                candidate_profile.fetch.headless.enabled = true;
            }
            let strategy_ctx = DiscoveryContext {
                timeout_ms,
                ..ctx.clone()
            };

            let items = match implementation
                .discover(driver.as_ref(), &candidate_profile, &strategy_ctx)
                .await
            {
                Ok(result) => result.items,
                Err(e) => {
                    warn!(strategy = %strategy, error = %e, "probe strategy failed");
                    notes.push(format!("{strategy}: failed: {e}"));
                    outcomes.push(StrategyOutcome {
                        strategy,
                        status: StrategyStatus::Failed(e.to_string()),
                    });
                    continue;
                }
            };

            let count = items.len();
            let best_so_far = fallback.as_ref().map(|c| c.items.len()).unwrap_or(0);
            if count > best_so_far {
                fallback = Some(Candidate {
                    strategy,
                    items: items.clone(),
                });
            }

            let validated = if count > 0 {
                self.validate_samples(driver.as_ref(), &items, &strategy_ctx.fetch_options())
                    .await
            } else {
                None
            };
            outcomes.push(StrategyOutcome {
                strategy,
                status: StrategyStatus::Discovered {
                    count,
                    validated: validated.is_some(),
                },
            });

            match validated {
                Some((sample_url, fields)) => {
                    notes.push(format!("{strategy}: {count} items, sample validated"));
                    winner = Some(Validated {
                        candidate: Candidate { strategy, items },
                        sample_url,
                        fields,
                    });
                    if count >= EARLY_EXIT_ITEM_COUNT {
                        break;
                    }
                }
                None if count == 0 => notes.push(format!("{strategy}: 0 items")),
                None => notes.push(format!("{strategy}: {count} items, no sample validated")),
            }
        }

        let (chosen, sample_url, vertical) = match winner {
            Some(validated) => {
                let vertical = classify_vertical(&validated.fields.attributes_json);
                (Some(validated.candidate), Some(validated.sample_url), vertical)
            }
            None => {
                if let Some(candidate) = &fallback {
                    notes.push(format!(
                        "no strategy validated; falling back to {} with {} unvalidated items",
                        candidate.strategy,
                        candidate.items.len()
                    ));
                }
                (fallback, None, Vertical::Generic)
            }
        };

        let strategy = chosen
            .as_ref()
            .map(|c| c.strategy)
            .unwrap_or(DiscoveryStrategy::Unknown);
        let found_count = chosen.as_ref().map(|c| c.items.len()).unwrap_or(0);
        let confidence = score_confidence(strategy, found_count);
        notes.extend(confidence.note);

        // Unvalidated discoveries may be listing or news pages; learn from validated URLs only.
        let pattern_samples: Vec<&str> = sample_url.iter().map(String::as_str).collect();

        let mut profile = draft;
        profile.probe.confidence = confidence.confidence;
        profile.probe.notes = notes;
        profile.discovery.strategy = strategy;
        profile.discovery.detail_url_patterns = learn_detail_url_patterns(&pattern_samples);
        profile.extract.vertical = vertical;
        if strategy.requires_headless() {
            profile.fetch.driver = FetchDriverKind::Headless;
            profile.fetch.headless.enabled = true;
        }

        ProbeReport {
            profile,
            found_count,
            outcomes,
        }
    }

    /// Probe job: runs the cascade for one data source and persists the profile.
    pub async fn run(&self, correlation: &JobCorrelation, handle: &dyn JobHandle) -> JobOutcome {
        let mut scope = EventScope {
            customer_id: correlation.customer_id,
            job_type: RunType::Probe,
            job_id: correlation.job_id.clone(),
            run_id: correlation.run_id,
            data_source_id: Some(correlation.data_source_id),
        };

        let run_id = match begin_run(self.store.as_ref(), correlation, RunType::Probe).await {
            Ok(RunStart::Started(run_id)) => run_id,
            Ok(RunStart::AlreadyFinished(run)) => {
                info!(run_id = %run.id, status = run.status.as_str(), "probe run already finished");
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

        match self.execute(run_id, correlation, &scope).await {
            Ok(report) => {
                acknowledge(handle, run_id).await;
                JobOutcome::Probed {
                    run_id,
                    found_count: report.found_count,
                    profile: report.profile,
                }
            }
            Err(err) => {
                fail_run(
                    self.store.as_ref(),
                    self.events.as_ref(),
                    handle,
                    &scope,
                    RunStage::Probe,
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
    ) -> Result<ProbeReport, CrawlError> {
        let not_found = || CrawlError::NotFound {
            customer_id: correlation.customer_id,
            data_source_id: correlation.data_source_id,
        };
        let source = self
            .store
            .get_data_source(correlation.customer_id, correlation.data_source_id)
            .await
            .context("loading data source")?
            .ok_or_else(not_found)?;

        info!(run_id = %run_id, data_source_id = %source.id, base_url = %source.base_url, "probe started");

        let ctx = DiscoveryContext {
            run_id,
            data_source_id: source.id,
            base_url: source.base_url.clone(),
            started_at: Utc::now(),
            timeout_ms: self.config.http_timeout_ms,
            max_html_bytes: self.config.limits.max_html_bytes,
        };
        let report = self.probe(&ctx).await;

        for outcome in &report.outcomes {
            if let StrategyStatus::Failed(error) = &outcome.status {
                self.events.emit(
                    scope
                        .event(
                            EventLevel::Warn,
                            RunStage::Probe,
                            PROBE_STRATEGY_FAILED,
                            format!("{} discovery failed", outcome.strategy),
                        )
                        .with_meta(json!({ "strategy": outcome.strategy.as_str(), "error": error })),
                );
            }
        }

        let saved = self
            .store
            .save_site_profile(source.customer_id, source.id, &report.profile)
            .await
            .context("saving site profile")?;
        if !saved {
            return Err(not_found());
        }

        let profile = &report.profile;
        let strategy = profile.discovery.strategy;
        self.events.emit(
            scope
                .event(
                    EventLevel::Info,
                    RunStage::Probe,
                    PROBE_STRATEGY_SELECTED,
                    format!("selected {strategy} with {} items", report.found_count),
                )
                .with_meta(json!({
                    "strategy": strategy.as_str(),
                    "confidence": profile.probe.confidence,
                    "foundCount": report.found_count,
                    "detailUrlPatterns": profile.discovery.detail_url_patterns,
                    "vertical": profile.extract.vertical.as_str(),
                })),
        );
        if strategy.requires_headless() {
            self.events.emit(scope.event(
                EventLevel::Info,
                RunStage::Probe,
                HEADLESS_USED,
                "headless discovery selected",
            ));
        }

        let counts = RunCounts {
            items_seen: report.found_count,
            ..Default::default()
        };
        self.store
            .finish_run(run_id, &RunFinish::Success(counts), Utc::now())
            .await
            .context("finalizing probe run")?;

        info!(
            run_id = %run_id,
            strategy = %strategy,
            confidence = profile.probe.confidence,
            found_count = report.found_count,
            "probe finished"
        );
        Ok(report)
    }
}
