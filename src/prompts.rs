//! Prompts for flyer-page listing extraction.
//!
//! Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::model::StoreLocale;

/// Default system prompt for extracting product listings from a flyer page.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You read retail store flyer pages and list every advertised product with its price.

Follow these rules precisely:

1. WHAT TO EXTRACT
   - One entry per advertised product offer
   - Use the product name exactly as printed, including brand and size
   - Use the final price the customer pays (the promotional price, not the crossed-out one)
   - Skip decorative text, store slogans, page numbers and legal notes

2. FIELDS
   - "name": product name as printed
   - "price": number with a dot as decimal separator, no currency symbol
   - "unit": quantity or unit text as printed (e.g. "1 L", "500 g", "per kg"), or null
   - "valid_from" / "valid_to": offer dates as YYYY-MM-DD, or null when not printed
   - "confidence": your confidence in this entry between 0 and 1

3. OUTPUT FORMAT
   - Output ONLY a JSON object: {"listings": [ ... ]}
   - Do NOT wrap the JSON in code fences
   - Do NOT add commentary
   - If the page has no products, output {"listings": []}"#;

/// Appended to the user message when the first response could not be parsed.
pub const STRICT_SCHEMA_HINT: &str = r#"Your previous answer could not be parsed. Answer again with exactly one JSON object matching this schema and nothing else:
{"listings": [{"name": string, "price": number, "unit": string | null, "valid_from": "YYYY-MM-DD" | null, "valid_to": "YYYY-MM-DD" | null, "confidence": number}]}"#;

/// Build the user message accompanying a page image.
pub fn page_context(locale: &StoreLocale, page_index: usize) -> String {
    let mut text = format!(
        "Flyer page {}. Store locale: {}. Prices are in {}.",
        page_index + 1,
        locale.locale,
        locale.currency
    );
    if !locale.categories.is_empty() {
        text.push_str(" Known product categories: ");
        text.push_str(&locale.categories.join(", "));
        text.push('.');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_mentions_locale_and_categories() {
        let locale = StoreLocale {
            locale: "lt-LT".into(),
            currency: "EUR".into(),
            categories: vec!["Dairy".into(), "Bakery".into()],
            boilerplate: vec![],
        };
        let text = page_context(&locale, 0);
        assert!(text.contains("page 1"));
        assert!(text.contains("lt-LT"));
        assert!(text.contains("EUR"));
        assert!(text.contains("Dairy, Bakery"));
    }

    #[test]
    fn system_prompt_demands_json_object() {
        assert!(EXTRACTION_SYSTEM_PROMPT.contains(r#"{"listings": [ ... ]}"#));
        assert!(STRICT_SCHEMA_HINT.contains("\"price\": number"));
    }
}
