//! Core domain model for the inventory crawl engine: site profiles, run and
//! item row shapes, and the pure decisions shared by the probe and production
//! engines.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

mod hash;
mod pattern;
mod vertical;

pub use hash::{canonical_payload, content_hash, normalize_text};
pub use pattern::{
    learn_detail_url_patterns, looks_detail_like, select_pattern_samples, DetailUrlMatcher,
    CATCH_ALL_PATTERN, DEFAULT_DETAIL_TOKENS,
};
pub use vertical::{classify_vertical, VEHICLE_ATTRIBUTE_KEYS};

pub const CRATE_NAME: &str = "invcrawl-core";

/// Current `profileVersion` written by the probe.
pub const PROFILE_VERSION: u32 = 1;

/// Key under which the site profile lives inside a data source's `config`.
pub const SITE_PROFILE_KEY: &str = "siteProfile";

/// Samples fetched per strategy while validating probe candidates.
pub const PROBE_SAMPLE_SIZE: usize = 8;

/// A validated strategy with at least this many items ends the cascade.
pub const EARLY_EXIT_ITEM_COUNT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    Sitemap,
    HtmlLinks,
    EndpointSniff,
    HeadlessListing,
    Unknown,
}

/// Probe priority, cheapest and most reliable first.
pub const PROBE_ORDER: [DiscoveryStrategy; 4] = [
    DiscoveryStrategy::Sitemap,
    DiscoveryStrategy::HtmlLinks,
    DiscoveryStrategy::EndpointSniff,
    DiscoveryStrategy::HeadlessListing,
];

impl DiscoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sitemap => "sitemap",
            Self::HtmlLinks => "html_links",
            Self::EndpointSniff => "endpoint_sniff",
            Self::HeadlessListing => "headless_listing",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub fn requires_headless(&self) -> bool {
        matches!(self, Self::HeadlessListing)
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchDriverKind {
    #[default]
    Http,
    Headless,
}

impl FetchDriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Headless => "headless",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Vertical {
    Vehicle,
    #[default]
    Generic,
}

impl Vertical {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdFromUrlMode {
    #[default]
    LastSegment,
    Path,
    Regex,
}

/// How a stable `sourceItemId` is derived from a detail URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IdFromUrl {
    #[serde(default)]
    pub mode: IdFromUrlMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl IdFromUrl {
    pub fn derive(&self, raw_url: &str) -> Option<String> {
        let parsed = url::Url::parse(raw_url).ok()?;
        let id = match self.mode {
            IdFromUrlMode::LastSegment => parsed
                .path_segments()?
                .filter(|s| !s.is_empty())
                .last()
                .map(ToString::to_string),
            IdFromUrlMode::Path => Some(parsed.path().trim_matches('/').to_string()),
            IdFromUrlMode::Regex => {
                let re = regex::Regex::new(self.pattern.as_deref()?).ok()?;
                let caps = re.captures(raw_url)?;
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
            }
        };
        id.filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeInfo {
    pub tested_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub strategy: DiscoveryStrategy,
    #[serde(default)]
    pub seed_urls: Vec<String>,
    #[serde(default)]
    pub sitemap_urls: Vec<String>,
    #[serde(default)]
    pub detail_url_patterns: Vec<String>,
    #[serde(default)]
    pub id_from_url: IdFromUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpFetchConfig {
    pub timeout_ms: u64,
}

impl Default for HttpFetchConfig {
    fn default() -> Self {
        Self { timeout_ms: 20_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadlessFetchConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
}

impl Default for HeadlessFetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default)]
    pub driver: FetchDriverKind,
    #[serde(default)]
    pub http: HttpFetchConfig,
    #[serde(default)]
    pub headless: HeadlessFetchConfig,
}

impl FetchConfig {
    /// Request timeout for the configured driver.
    pub fn timeout_ms(&self) -> u64 {
        match self.driver {
            FetchDriverKind::Http => self.http.timeout_ms,
            FetchDriverKind::Headless => self.headless.timeout_ms,
        }
    }
}

pub const DEFAULT_EXTRACT_STRATEGY: &str = "html_meta";

fn default_extract_strategy() -> String {
    DEFAULT_EXTRACT_STRATEGY.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    #[serde(default)]
    pub vertical: Vertical,
    #[serde(default = "default_extract_strategy")]
    pub strategy: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            vertical: Vertical::Generic,
            strategy: default_extract_strategy(),
        }
    }
}

/// Per-site overrides. Anything left unset falls back to [`CrawlLimits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_per_run: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub politeness_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removal_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_html_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_concurrency: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ProfileLimits {
    pub fn merged_with(&self, defaults: CrawlLimits) -> CrawlLimits {
        CrawlLimits {
            max_new_per_run: self.max_new_per_run.unwrap_or(defaults.max_new_per_run),
            politeness_delay_ms: self
                .politeness_delay_ms
                .unwrap_or(defaults.politeness_delay_ms),
            removal_threshold: self.removal_threshold.unwrap_or(defaults.removal_threshold),
            max_html_bytes: self.max_html_bytes.unwrap_or(defaults.max_html_bytes),
            detail_concurrency: self.detail_concurrency.unwrap_or(defaults.detail_concurrency),
        }
    }
}

/// Effective limits for one run after merging profile overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlLimits {
    pub max_new_per_run: usize,
    pub politeness_delay_ms: u64,
    pub removal_threshold: usize,
    pub max_html_bytes: usize,
    /// Recorded for parity with the site configuration; the detail loop is sequential.
    pub detail_concurrency: usize,
}

impl Default for CrawlLimits {
    fn default() -> Self {
        Self {
            max_new_per_run: 50,
            politeness_delay_ms: 500,
            removal_threshold: 10,
            max_html_bytes: 2_000_000,
            detail_concurrency: 6,
        }
    }
}

/// Versioned crawl configuration for one website, written only by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
    pub profile_version: u32,
    pub probe: ProbeInfo,
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub limits: ProfileLimits,
}

impl SiteProfile {
    /// Unresolved starting point handed to strategies during a probe.
    pub fn draft(base_url: &str, tested_at: DateTime<Utc>) -> Self {
        Self {
            profile_version: PROFILE_VERSION,
            probe: ProbeInfo {
                tested_at,
                confidence: 0.0,
                notes: Vec::new(),
            },
            discovery: DiscoveryConfig {
                strategy: DiscoveryStrategy::Unknown,
                seed_urls: vec![base_url.to_string()],
                sitemap_urls: Vec::new(),
                detail_url_patterns: Vec::new(),
                id_from_url: IdFromUrl::default(),
            },
            fetch: FetchConfig::default(),
            extract: ExtractConfig::default(),
            limits: ProfileLimits::default(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.discovery.strategy.is_unknown()
    }

    pub fn limits(&self, defaults: CrawlLimits) -> CrawlLimits {
        self.limits.merged_with(defaults)
    }

    pub fn detail_url_matcher(&self) -> DetailUrlMatcher {
        DetailUrlMatcher::new(&self.discovery.detail_url_patterns)
    }

    /// Reads the profile stored in a data source `config` document.
    pub fn from_config(config: &JsonValue) -> Result<Option<Self>, serde_json::Error> {
        match config.get(SITE_PROFILE_KEY) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }
}

/// Customer website registered for crawling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub base_url: String,
    #[serde(default)]
    pub config: JsonValue,
}

impl DataSource {
    pub fn site_profile(&self) -> Result<Option<SiteProfile>, serde_json::Error> {
        SiteProfile::from_config(&self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Probe,
    Prod,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Prod => "prod",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "probe" => Some(Self::Probe),
            "prod" => Some(Self::Prod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// queued -> running -> (success | failed); a queued run may also fail directly.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Stage label carried on run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Queued,
    Probe,
    Discovery,
    Diff,
    RemovalGuard,
    DetailFetch,
    Finalize,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Probe => "probe",
            Self::Discovery => "discovery",
            Self::Diff => "diff",
            Self::RemovalGuard => "removal_guard",
            Self::DetailFetch => "detail_fetch",
            Self::Finalize => "finalize",
        }
    }
}

/// Run-level failure taxonomy recorded on `scrape_runs.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    ProfileMissing,
    ScrapeCrash,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::ProfileMissing => "PROFILE_MISSING",
            Self::ScrapeCrash => "SCRAPE_CRASH",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub items_seen: usize,
    pub items_new: usize,
    pub items_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFinish {
    Success(RunCounts),
    Failed { code: ErrorCode, message: String },
}

impl RunFinish {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success(_) => RunStatus::Success,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRun {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub data_source_id: Uuid,
    pub run_type: RunType,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items_seen: usize,
    pub items_new: usize,
    pub items_removed: usize,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ScrapeRun {
    pub fn queued(customer_id: Uuid, data_source_id: Uuid, run_type: RunType) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            data_source_id,
            run_type,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            items_seen: 0,
            items_new: 0,
            items_removed: 0,
            error_code: None,
            error_message: None,
        }
    }
}

/// Candidate produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredItem {
    pub source_item_id: String,
    pub url: String,
}

impl DiscoveredItem {
    pub fn new(source_item_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_item_id: source_item_id.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BaseFields {
    pub title: Option<String>,
    pub description_text: Option<String>,
    pub price_amount: Option<f64>,
    pub price_currency: Option<String>,
    pub primary_image_url: Option<String>,
}

/// Structured fields extracted from one detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    pub base_fields: BaseFields,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub attributes_json: JsonMap<String, JsonValue>,
}

impl ExtractedFields {
    /// A probe sample counts as valid when it yields a title or at least one image.
    pub fn looks_like_detail(&self) -> bool {
        let has_title = self
            .base_fields
            .title
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        has_title || !self.image_urls.is_empty()
    }
}

/// Content written by the detail fetch step.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailUpdate {
    pub fields: ExtractedFields,
    pub content_hash: String,
}

impl DetailUpdate {
    pub fn from_fields(fields: ExtractedFields) -> Self {
        let content_hash = content_hash(&fields);
        Self {
            fields,
            content_hash,
        }
    }
}

/// Item selected for detail fetching in the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDetail {
    pub item_id: Uuid,
    pub source_item_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub data_source_id: Uuid,
    pub source_item_id: String,
    pub url: String,
    pub title: Option<String>,
    pub description_text: Option<String>,
    pub price_amount: Option<f64>,
    pub price_currency: Option<String>,
    pub primary_image_url: Option<String>,
    pub image_urls_json: JsonValue,
    pub attributes_json: JsonValue,
    pub content_hash: Option<String>,
    pub is_active: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_seen_run_id: Option<Uuid>,
    pub detail_fetched_at: Option<DateTime<Utc>>,
    pub last_detail_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn is_seen_in(&self, run_id: Uuid) -> bool {
        self.last_seen_run_id == Some(run_id)
    }

    pub fn is_pending_detail(&self, run_id: Uuid) -> bool {
        self.detail_fetched_at.is_none() && self.is_seen_in(run_id)
    }

    /// `is_active == false` exactly when `removed_at` is set.
    pub fn lifecycle_consistent(&self) -> bool {
        self.is_active == self.removed_at.is_none()
    }
}

/// Drops repeated `source_item_id`s, keeping the first occurrence in order.
pub fn dedupe_discovered(items: Vec<DiscoveredItem>) -> Vec<DiscoveredItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.source_item_id.clone()))
        .collect()
}

/// Removals only run when discovery looked complete enough to trust.
pub fn should_run_removals(discovered_count: usize, threshold: usize) -> bool {
    discovered_count > 0 && discovered_count >= threshold
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfidence {
    pub confidence: f64,
    pub note: Option<String>,
}

pub fn score_confidence(strategy: DiscoveryStrategy, found_count: usize) -> ProbeConfidence {
    if strategy.is_unknown() || found_count == 0 {
        return ProbeConfidence {
            confidence: 0.1,
            note: Some("no detail-like items discovered".to_string()),
        };
    }
    if found_count >= EARLY_EXIT_ITEM_COUNT {
        return ProbeConfidence {
            confidence: 0.9,
            note: None,
        };
    }
    if found_count >= 3 {
        return ProbeConfidence {
            confidence: 0.5,
            note: Some(format!(
                "only {found_count} items discovered; consider seedUrls/headless"
            )),
        };
    }
    ProbeConfidence {
        confidence: 0.1,
        note: Some(format!(
            "only {found_count} items discovered; discovery is likely incomplete, configure seedUrls or enable headless"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn tested_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn removal_guard_requires_nonzero_discovery_at_threshold() {
        assert!(!should_run_removals(0, 0));
        assert!(!should_run_removals(0, 5));
        assert!(!should_run_removals(1, 5));
        assert!(!should_run_removals(4, 5));
        assert!(should_run_removals(5, 5));
        assert!(should_run_removals(6, 5));
        assert!(should_run_removals(1, 0));
    }

    #[test]
    fn removal_guard_is_monotonic_in_discovered_count() {
        for threshold in 0..12 {
            let mut passed = false;
            for count in 0..40 {
                let now = should_run_removals(count, threshold);
                assert!(!(passed && !now), "guard flipped back at {count}/{threshold}");
                passed = now;
            }
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let items = dedupe_discovered(vec![
            DiscoveredItem::new("a", "https://x.example/cars/a"),
            DiscoveredItem::new("b", "https://x.example/cars/b"),
            DiscoveredItem::new("a", "https://x.example/cars/a?ref=2"),
        ]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://x.example/cars/a");
        assert_eq!(items[1].source_item_id, "b");
    }

    #[test]
    fn confidence_thresholds() {
        let at_twenty = score_confidence(DiscoveryStrategy::Sitemap, 20);
        assert_eq!(at_twenty.confidence, 0.9);
        assert!(at_twenty.note.is_none());

        let at_nineteen = score_confidence(DiscoveryStrategy::Sitemap, 19);
        assert_eq!(at_nineteen.confidence, 0.5);
        assert_eq!(
            at_nineteen.note.as_deref(),
            Some("only 19 items discovered; consider seedUrls/headless")
        );

        let at_three = score_confidence(DiscoveryStrategy::HtmlLinks, 3);
        assert_eq!(at_three.confidence, 0.5);

        let at_two = score_confidence(DiscoveryStrategy::HtmlLinks, 2);
        assert_eq!(at_two.confidence, 0.1);
        assert!(at_two.note.unwrap().contains("only 2 items discovered"));

        let unknown = score_confidence(DiscoveryStrategy::Unknown, 0);
        assert_eq!(unknown.confidence, 0.1);
        assert_eq!(unknown.note.as_deref(), Some("no detail-like items discovered"));
    }

    #[test]
    fn run_status_lifecycle() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Failed.is_terminal());
        assert_eq!(RunStatus::parse("running"), Some(RunStatus::Running));
        assert_eq!(RunType::parse("prod"), Some(RunType::Prod));
    }

    #[test]
    fn profile_serializes_with_camel_case_keys_and_keeps_unknown_limits() {
        let mut profile = SiteProfile::draft("https://dealer.example", tested_at());
        profile.discovery.strategy = DiscoveryStrategy::HtmlLinks;
        profile.limits.max_new_per_run = Some(25);
        profile
            .limits
            .extra
            .insert("maxPagesPerRun".to_string(), json!(40));

        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["profileVersion"], json!(1));
        assert_eq!(value["discovery"]["strategy"], json!("html_links"));
        assert_eq!(value["discovery"]["seedUrls"], json!(["https://dealer.example"]));
        assert_eq!(value["fetch"]["http"]["timeoutMs"], json!(20_000));
        assert_eq!(value["limits"]["maxNewPerRun"], json!(25));
        assert_eq!(value["limits"]["maxPagesPerRun"], json!(40));

        let back: SiteProfile = serde_json::from_value(value).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn limits_merge_profile_overrides_onto_defaults() {
        let limits = ProfileLimits {
            max_new_per_run: Some(10),
            politeness_delay_ms: Some(0),
            ..Default::default()
        };
        let merged = limits.merged_with(CrawlLimits::default());
        assert_eq!(merged.max_new_per_run, 10);
        assert_eq!(merged.politeness_delay_ms, 0);
        assert_eq!(merged.removal_threshold, CrawlLimits::default().removal_threshold);
        assert_eq!(merged.detail_concurrency, 6);
    }

    #[test]
    fn profile_is_read_from_data_source_config() {
        let mut profile = SiteProfile::draft("https://dealer.example", tested_at());
        profile.discovery.strategy = DiscoveryStrategy::Sitemap;
        let source = DataSource {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            base_url: "https://dealer.example".to_string(),
            config: json!({ "siteProfile": profile, "other": true }),
        };
        let loaded = source.site_profile().unwrap().unwrap();
        assert!(loaded.is_resolved());

        let empty = DataSource {
            config: json!({ "siteProfile": null }),
            ..source
        };
        assert!(empty.site_profile().unwrap().is_none());
    }

    #[test]
    fn id_from_url_modes() {
        let url = "https://dealer.example/cars/volvo-v70-1234/";
        assert_eq!(
            IdFromUrl::default().derive(url).as_deref(),
            Some("volvo-v70-1234")
        );
        let path = IdFromUrl {
            mode: IdFromUrlMode::Path,
            pattern: None,
        };
        assert_eq!(path.derive(url).as_deref(), Some("cars/volvo-v70-1234"));
        let regex = IdFromUrl {
            mode: IdFromUrlMode::Regex,
            pattern: Some(r"-(\d+)/?$".to_string()),
        };
        assert_eq!(regex.derive(url).as_deref(), Some("1234"));
        assert_eq!(IdFromUrl::default().derive("https://dealer.example/"), None);
        assert_eq!(IdFromUrl::default().derive("not a url"), None);
    }

    #[test]
    fn item_lifecycle_helpers() {
        let run_id = Uuid::new_v4();
        let item = Item {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            data_source_id: Uuid::new_v4(),
            source_item_id: "a1".to_string(),
            url: "https://dealer.example/cars/a1".to_string(),
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
            last_seen_at: Some(tested_at()),
            last_seen_run_id: Some(run_id),
            detail_fetched_at: None,
            last_detail_run_id: None,
            created_at: tested_at(),
        };
        assert!(item.is_pending_detail(run_id));
        assert!(!item.is_pending_detail(Uuid::new_v4()));
        assert!(item.lifecycle_consistent());
    }
}
