//! Parsing and validation of model output into candidate listings.
//!
//! Model output is untrusted. Before any value reaches the catalog it goes
//! through these passes, in order:
//!
//! 1. Reject responses above the size ceiling
//! 2. Strip invisible Unicode and outer code fences
//! 3. Locate the JSON payload (object or bare array) and deserialize it
//! 4. Reject payloads with more listings than the per-page ceiling
//! 5. Validate each listing: name, price range, dates, confidence
//!
//! A listing that fails step 5 is dropped on its own. If every listing is
//! dropped the whole response is rejected, which gives the caller a chance to
//! retry with a stricter prompt.

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::model::CandidateListing;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

const MAX_NAME_CHARS: usize = 200;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%d.%m.%Y", "%d/%m/%Y"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Wrapped { listings: Vec<Value> },
    Bare(Vec<Value>),
}

const NAME_KEYS: &[&str] = &["name", "product", "product_name", "title"];

/// One listing as the model wrote it. Fields of the wrong JSON type read as
/// absent, so a bad field costs at most its own listing.
#[derive(Debug)]
struct RawListing {
    name: Option<String>,
    price: Option<Value>,
    unit: Option<String>,
    valid_from: Option<String>,
    valid_to: Option<String>,
    confidence: Option<f64>,
}

impl RawListing {
    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err(format!("expected an object, got {}", json_kind(&value)));
        };
        let mut text = |key: &str| match fields.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let name = NAME_KEYS.iter().find_map(|key| text(*key));
        let unit = text("unit");
        let valid_from = text("valid_from");
        let valid_to = text("valid_to");
        Ok(Self {
            name,
            unit,
            valid_from,
            valid_to,
            price: fields.remove("price").filter(|v| !v.is_null()),
            confidence: fields.get("confidence").and_then(Value::as_f64),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse one model response for page `page_index`.
///
/// `observed_on` anchors the plausibility window for offer dates.
pub fn parse_listings(
    raw: &str,
    page_index: usize,
    observed_on: NaiveDate,
    config: &ExtractionConfig,
) -> Result<Vec<CandidateListing>, ExtractionError> {
    if raw.len() > config.max_response_bytes {
        return Err(invalid(format!(
            "response is {} bytes, above the {} byte limit",
            raw.len(),
            config.max_response_bytes
        )));
    }

    let cleaned = strip_code_fences(&remove_invisible_chars(raw));
    let json = locate_json(&cleaned).ok_or_else(|| invalid("no JSON payload in response"))?;
    let payload: RawPayload =
        serde_json::from_str(json).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
    let raw_listings = match payload {
        RawPayload::Wrapped { listings } | RawPayload::Bare(listings) => listings,
    };

    if raw_listings.len() > config.max_listings_per_page {
        return Err(invalid(format!(
            "{} listings exceed the per-page limit of {}",
            raw_listings.len(),
            config.max_listings_per_page
        )));
    }

    let total = raw_listings.len();
    let listings: Vec<CandidateListing> = raw_listings
        .into_iter()
        .enumerate()
        .filter_map(|(listing_index, item)| {
            let checked = RawListing::from_value(item)
                .and_then(|item| validate(item, page_index, listing_index, observed_on, config));
            match checked {
                Ok(listing) => Some(listing),
                Err(reason) => {
                    debug!("Page {}: dropped listing {}: {}", page_index, listing_index, reason);
                    None
                }
            }
        })
        .collect();

    if total > 0 && listings.is_empty() {
        return Err(invalid(format!("none of the {total} listings passed validation")));
    }
    Ok(listings)
}

fn invalid(detail: impl Into<String>) -> ExtractionError {
    ExtractionError::InvalidResponse {
        detail: detail.into(),
    }
}

fn validate(
    item: RawListing,
    page_index: usize,
    listing_index: usize,
    observed_on: NaiveDate,
    config: &ExtractionConfig,
) -> Result<CandidateListing, String> {
    let name = item
        .name
        .as_deref()
        .map(collapse_whitespace)
        .filter(|n| !n.is_empty())
        .ok_or("missing name")?;
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(format!("name longer than {MAX_NAME_CHARS} characters"));
    }

    let price = item
        .price
        .as_ref()
        .and_then(parse_price)
        .ok_or("missing or unreadable price")?;
    if price <= Decimal::ZERO {
        return Err(format!("price {price} is not positive"));
    }
    if price > config.max_price {
        return Err(format!("price {price} above {}", config.max_price));
    }

    let date = |field: Option<&str>| {
        field
            .and_then(parse_date)
            .filter(|d| (*d - observed_on).num_days().abs() <= config.date_window_days)
    };

    Ok(CandidateListing {
        name,
        price,
        unit: item
            .unit
            .as_deref()
            .map(collapse_whitespace)
            .filter(|u| !u.is_empty()),
        valid_from: date(item.valid_from.as_deref()),
        valid_to: date(item.valid_to.as_deref()),
        page_index,
        listing_index,
        confidence: item
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0) as f32),
    })
}

// ── Cleanup ──────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*\n(.*)\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

/// Slice from the first `{` or `[` to its matching last closer.
fn locate_json(input: &str) -> Option<&str> {
    let start = input.find(['{', '['])?;
    let closer = if input[start..].starts_with('{') { '}' } else { ']' };
    let end = input.rfind(closer)?;
    (end > start).then(|| &input[start..=end])
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Field parsers ────────────────────────────────────────────────────────

/// Read a price from a JSON number or a printed string such as `"1,29 €"`.
fn parse_price(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => normalise_price_text(s)?,
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .map(|d| d.normalize())
}

/// Keep digits and separators; the last separator is the decimal point.
fn normalise_price_text(s: &str) -> Option<String> {
    let kept: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.' || *c == '-')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let text = match kept.rfind([',', '.']) {
        Some(pos) => {
            let (int_part, frac_part) = kept.split_at(pos);
            let int_part: String = int_part.chars().filter(|c| *c != ',' && *c != '.').collect();
            format!("{}.{}", int_part, &frac_part[1..])
        }
        None => kept,
    };
    Some(text)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn parse(raw: &str) -> Result<Vec<CandidateListing>, ExtractionError> {
        parse_listings(raw, 2, today(), &ExtractionConfig::default())
    }

    #[test]
    fn wrapped_object() {
        let raw = r#"{"listings": [
            {"name": "Pienas  1L", "price": 1.29, "unit": "1 L", "valid_from": "2024-03-04", "valid_to": "2024-03-10", "confidence": 0.9},
            {"name": "Duona", "price": "0,99 €"}
        ]}"#;
        let listings = parse(raw).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].name, "Pienas 1L");
        assert_eq!(listings[0].price, Decimal::new(129, 2));
        assert_eq!(listings[0].valid_to, NaiveDate::from_ymd_opt(2024, 3, 10));
        assert_eq!(listings[0].page_index, 2);
        assert_eq!(listings[1].price, Decimal::new(99, 2));
        assert_eq!(listings[1].listing_index, 1);
    }

    #[test]
    fn fenced_bare_array() {
        let raw = "```json\n[{\"name\": \"Milk\", \"price\": 1.19}]\n```";
        let listings = parse(raw).unwrap();
        assert_eq!(listings[0].name, "Milk");
    }

    #[test]
    fn prose_around_json_is_ignored() {
        let raw = "Here you go:\n{\"listings\": [{\"name\": \"Milk\", \"price\": 2}]}\nThanks!";
        assert_eq!(parse(raw).unwrap().len(), 1);
    }

    #[test]
    fn empty_page_is_valid() {
        assert!(parse(r#"{"listings": []}"#).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            parse("I cannot read this page."),
            Err(ExtractionError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse("{\"listings\": [{\"name\": "),
            Err(ExtractionError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn bad_listings_are_dropped_individually() {
        let raw = r#"[
            {"name": "Free sample", "price": 0},
            {"name": "Yacht", "price": 250000},
            {"name": "", "price": 1},
            {"name": "Cheese", "price": "3.49"}
        ]"#;
        let listings = parse(raw).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].name, "Cheese");
        assert_eq!(listings[0].listing_index, 3);
    }

    #[test]
    fn all_listings_invalid_rejects_response() {
        let raw = r#"[{"name": "Negative", "price": -1}]"#;
        assert!(matches!(
            parse(raw),
            Err(ExtractionError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn ceilings_enforced() {
        let config = ExtractionConfig {
            max_listings_per_page: 1,
            ..Default::default()
        };
        let raw = r#"[{"name": "a", "price": 1}, {"name": "b", "price": 1}]"#;
        assert!(parse_listings(raw, 0, today(), &config).is_err());

        let config = ExtractionConfig {
            max_response_bytes: 10,
            ..Default::default()
        };
        assert!(parse_listings(r#"{"listings": []}"#, 0, today(), &config).is_err());
    }

    #[test]
    fn implausible_dates_are_dropped() {
        let raw = r#"[{"name": "Milk", "price": 1, "valid_from": "1999-01-01", "valid_to": "10.03.2024"}]"#;
        let listing = &parse(raw).unwrap()[0];
        assert_eq!(listing.valid_from, None);
        assert_eq!(listing.valid_to, NaiveDate::from_ymd_opt(2024, 3, 10));
    }

    #[test]
    fn price_text_forms() {
        let p = |s: &str| parse_price(&Value::String(s.into()));
        assert_eq!(p("1,29"), Some(Decimal::new(129, 2)));
        assert_eq!(p("€ 1.299,00"), Some(Decimal::new(1299, 0)));
        assert_eq!(p("12"), Some(Decimal::new(12, 0)));
        assert_eq!(p("free"), None);
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"[{"name": "Milk", "price": 1, "confidence": 7.5}]"#;
        assert_eq!(parse(raw).unwrap()[0].confidence, Some(1.0));
    }

    #[test]
    fn mistyped_field_costs_only_its_listing() {
        let raw = r#"{"listings": [
            {"name": "Milk", "price": 1.19, "confidence": "high", "unit": 1},
            {"name": 123, "price": 2.49},
            "Bread 0.89",
            {"product_name": "Cheese", "price": "3,49", "valid_to": 20240310}
        ]}"#;
        let listings = parse(raw).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].name, "Milk");
        assert_eq!(listings[0].confidence, None);
        assert_eq!(listings[0].unit, None);
        assert_eq!(listings[1].name, "Cheese");
        assert_eq!(listings[1].listing_index, 3);
        assert_eq!(listings[1].valid_to, None);
    }

    #[test]
    fn payload_of_non_objects_is_rejected() {
        assert!(matches!(
            parse(r#"{"listings": [1, "two", null]}"#),
            Err(ExtractionError::InvalidResponse { .. })
        ));
    }
}
