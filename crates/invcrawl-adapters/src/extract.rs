use invcrawl_core::{BaseFields, ExtractedFields};
use invcrawl_storage::FetchResult;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map as JsonMap, Value as JsonValue};
use url::Url;

use crate::AdapterError;

const MAX_IMAGES: usize = 30;

/// Turns one fetched detail page into structured fields. Pure over the page.
pub trait Extractor: Send + Sync {
    fn extract(&self, page: &FetchResult) -> Result<ExtractedFields, AdapterError>;
}

/// Generic extractor over OpenGraph/product meta tags, schema.org `itemprop`
/// markup, and `dl`/table attribute lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlMetaExtractor;

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(
        element
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).find_map(element_text))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string())))
}

fn first_of(
    document: &Html,
    candidates: &[(&str, Option<&str>)],
) -> Result<Option<String>, AdapterError> {
    for (css, attr) in candidates {
        let found = match attr {
            Some(attr) => select_first_attr(document, css, attr)?,
            None => select_first_text(document, css)?,
        };
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Reads a price like `12 990 €`, `12,990.50` or `1.299,00`.
pub(crate) fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ',') || c.is_whitespace())
        .filter(|c| !c.is_whitespace())
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ',']);
    if cleaned.is_empty() {
        return None;
    }
    // The last separator is the decimal point only when one or two digits follow it.
    let decimal_at = cleaned
        .rfind(['.', ','])
        .filter(|pos| (1..=2).contains(&(cleaned.len() - pos - 1)));
    let mut normalized = String::with_capacity(cleaned.len());
    for (i, ch) in cleaned.char_indices() {
        if ch.is_ascii_digit() {
            normalized.push(ch);
        } else if Some(i) == decimal_at {
            normalized.push('.');
        }
    }
    normalized.parse().ok()
}

fn resolve_url(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    match base {
        Some(base) => base.join(raw).ok().map(|u| u.to_string()),
        None => Url::parse(raw).ok().map(|u| u.to_string()),
    }
}

fn collect_images(document: &Html, base: Option<&Url>) -> Result<Vec<String>, AdapterError> {
    let mut images: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        if let Some(url) = resolve_url(base, raw) {
            if !images.contains(&url) && images.len() < MAX_IMAGES {
                images.push(url);
            }
        }
    };

    let og = selector("meta[property='og:image']")?;
    for node in document.select(&og) {
        if let Some(content) = node.value().attr("content") {
            push(content);
        }
    }
    let imgs = selector("img")?;
    for node in document.select(&imgs) {
        let src = node
            .value()
            .attr("data-src")
            .or_else(|| node.value().attr("src"));
        if let Some(src) = src {
            push(src);
        }
    }
    Ok(images)
}

fn collect_attributes(document: &Html) -> Result<JsonMap<String, JsonValue>, AdapterError> {
    let mut attributes = JsonMap::new();

    let dl = selector("dl")?;
    let dt = selector("dt")?;
    let dd = selector("dd")?;
    for list in document.select(&dl) {
        let keys = list.select(&dt).filter_map(element_text);
        let values = list.select(&dd).filter_map(element_text);
        for (key, value) in keys.zip(values) {
            attributes.entry(key).or_insert(JsonValue::String(value));
        }
    }

    let tr = selector("tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    for row in document.select(&tr) {
        let key = row.select(&th).next().and_then(element_text);
        let value = row.select(&td).next().and_then(element_text);
        if let (Some(key), Some(value)) = (key, value) {
            attributes.entry(key).or_insert(JsonValue::String(value));
        }
    }

    Ok(attributes)
}

impl Extractor for HtmlMetaExtractor {
    fn extract(&self, page: &FetchResult) -> Result<ExtractedFields, AdapterError> {
        if page.body.trim().is_empty() {
            return Err(AdapterError::Message(format!(
                "empty body for {}",
                page.final_url
            )));
        }
        let document = Html::parse_document(&page.body);
        let base = Url::parse(&page.final_url).ok();

        let title = first_of(
            &document,
            &[
                ("meta[property='og:title']", Some("content")),
                ("h1", None),
                ("title", None),
            ],
        )?;
        let description_text = first_of(
            &document,
            &[
                ("meta[property='og:description']", Some("content")),
                ("meta[name='description']", Some("content")),
                ("[itemprop='description']", None),
            ],
        )?;
        let price_amount = first_of(
            &document,
            &[
                ("meta[property='product:price:amount']", Some("content")),
                ("[itemprop='price']", Some("content")),
                ("[itemprop='price']", None),
            ],
        )?
        .as_deref()
        .and_then(parse_price);
        let price_currency = first_of(
            &document,
            &[
                ("meta[property='product:price:currency']", Some("content")),
                ("[itemprop='priceCurrency']", Some("content")),
                ("[itemprop='priceCurrency']", None),
            ],
        )?;

        let image_urls = collect_images(&document, base.as_ref())?;
        let attributes_json = collect_attributes(&document)?;

        Ok(ExtractedFields {
            base_fields: BaseFields {
                title,
                description_text,
                price_amount,
                price_currency,
                primary_image_url: image_urls.first().cloned(),
            },
            image_urls,
            attributes_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invcrawl_core::{classify_vertical, Vertical};
    use invcrawl_storage::FetchTrace;
    use serde_json::json;

    fn page(body: &str) -> FetchResult {
        FetchResult {
            status: 200,
            final_url: "https://dealer.example/cars/used/volvo-123".to_string(),
            body: body.to_string(),
            trace: FetchTrace::default(),
        }
    }

    const DETAIL_HTML: &str = r#"
        <html><head>
          <title>Volvo V70 | Dealer</title>
          <meta property="og:title" content="Volvo V70 2.4 D5">
          <meta name="description" content="Well kept estate, one owner.">
          <meta property="product:price:amount" content="12 990">
          <meta property="product:price:currency" content="EUR">
          <meta property="og:image" content="/img/volvo-1.jpg">
        </head><body>
          <h1>Volvo V70</h1>
          <img src="/img/volvo-1.jpg"><img src="https://cdn.example/volvo-2.jpg">
          <dl><dt>Mileage</dt><dd>210 000 km</dd><dt>Fuel type</dt><dd>Diesel</dd></dl>
          <table><tr><th>Color</th><td>Silver</td></tr></table>
        </body></html>
    "#;

    #[test]
    fn extracts_meta_images_and_attribute_lists() {
        let fields = HtmlMetaExtractor.extract(&page(DETAIL_HTML)).unwrap();
        let base = &fields.base_fields;
        assert_eq!(base.title.as_deref(), Some("Volvo V70 2.4 D5"));
        assert_eq!(base.description_text.as_deref(), Some("Well kept estate, one owner."));
        assert_eq!(base.price_amount, Some(12990.0));
        assert_eq!(base.price_currency.as_deref(), Some("EUR"));
        assert_eq!(
            fields.image_urls,
            vec![
                "https://dealer.example/img/volvo-1.jpg".to_string(),
                "https://cdn.example/volvo-2.jpg".to_string(),
            ]
        );
        assert_eq!(
            base.primary_image_url.as_deref(),
            Some("https://dealer.example/img/volvo-1.jpg")
        );
        assert_eq!(fields.attributes_json["Mileage"], json!("210 000 km"));
        assert_eq!(fields.attributes_json["Color"], json!("Silver"));
        assert_eq!(classify_vertical(&fields.attributes_json), Vertical::Vehicle);
        assert!(fields.looks_like_detail());
    }

    #[test]
    fn falls_back_to_h1_and_title() {
        let fields = HtmlMetaExtractor
            .extract(&page("<html><head><title>Sofa</title></head><body><p>x</p></body></html>"))
            .unwrap();
        assert_eq!(fields.base_fields.title.as_deref(), Some("Sofa"));
        assert!(fields.image_urls.is_empty());
        assert_eq!(classify_vertical(&fields.attributes_json), Vertical::Generic);
    }

    #[test]
    fn empty_body_is_an_error() {
        assert!(HtmlMetaExtractor.extract(&page("   ")).is_err());
    }

    #[test]
    fn price_parsing_handles_common_formats() {
        assert_eq!(parse_price("12 990 €"), Some(12990.0));
        assert_eq!(parse_price("€12,990.50"), Some(12990.5));
        assert_eq!(parse_price("1.299,00 EUR"), Some(1299.0));
        assert_eq!(parse_price("8990"), Some(8990.0));
        assert_eq!(parse_price("19,95"), Some(19.95));
        assert_eq!(parse_price("12.990"), Some(12990.0));
        assert_eq!(parse_price("price on request"), None);
    }
}
