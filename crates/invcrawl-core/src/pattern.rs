//! Detail URL pattern learning.

use regex::Regex;
use url::Url;

/// Path fragments that usually mark a listing's own page.
pub const DEFAULT_DETAIL_TOKENS: &[&str] = &[
    "/listing/",
    "/listings/",
    "/item/",
    "/items/",
    "/product/",
    "/products/",
    "/vehicle/",
    "/vehicles/",
    "/car/",
    "/cars/",
    "/ad/",
    "/ads/",
    "/detail/",
    "/details/",
    "/inventory/",
];

pub const CATCH_ALL_PATTERN: &str = ".*";

const MAX_PATTERN_SAMPLES: usize = 3;

pub fn looks_detail_like(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    DEFAULT_DETAIL_TOKENS.iter().any(|token| lower.contains(token))
}

/// Up to three samples, detail-like URLs first, original order otherwise.
pub fn select_pattern_samples<S: AsRef<str>>(sample_urls: &[S]) -> Vec<&str> {
    let (mut detail_like, rest): (Vec<&str>, Vec<&str>) = sample_urls
        .iter()
        .map(AsRef::as_ref)
        .partition(|url| looks_detail_like(url));
    detail_like.extend(rest);
    detail_like.truncate(MAX_PATTERN_SAMPLES);
    detail_like
}

/// Learns an anchored regex for detail pages from the first preferred sample.
///
/// `https://x.example/cars/used/volvo-123` yields
/// `^https?://[^/]+/cars/used/[^/]+/?$`. Anything that cannot produce a
/// prefix of at least one segment falls back to `[".*"]`.
pub fn learn_detail_url_patterns<S: AsRef<str>>(sample_urls: &[S]) -> Vec<String> {
    select_pattern_samples(sample_urls)
        .first()
        .and_then(|first| pattern_for(first))
        .map(|pattern| vec![pattern])
        .unwrap_or_else(|| vec![CATCH_ALL_PATTERN.to_string()])
}

fn pattern_for(raw_url: &str) -> Option<String> {
    let parsed = Url::parse(raw_url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let prefix = segments[..segments.len() - 1]
        .iter()
        .map(|segment| regex::escape(segment))
        .collect::<Vec<_>>()
        .join("/");
    Some(format!("^https?://[^/]+/{prefix}/[^/]+/?$"))
}

/// Compiled form of a profile's `detailUrlPatterns`.
///
/// Advisory only: strategy implementations use it to prune candidates. Invalid
/// patterns are dropped and an empty matcher accepts every URL.
#[derive(Debug, Clone, Default)]
pub struct DetailUrlMatcher {
    patterns: Vec<Regex>,
}

impl DetailUrlMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| Regex::new(p.as_ref()).ok())
                .collect(),
        }
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(url))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}
