//! Product name normalisation.
//!
//! Two listings of the same product rarely print the same string: case,
//! diacritics, promo badges and the spacing between a number and its unit all
//! vary from store to store and week to week. Normalised names are what the
//! similarity signals compare and what the catalog keys masters on.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalise a raw product name.
///
/// Steps, in order:
/// 1. Lowercase and NFKD, dropping combining marks (`ė` → `e`, `ﬁ` → `fi`)
/// 2. Remove the store's boilerplate phrases, folded the same way, and
///    promo percentages
/// 3. Decimal commas become points (`1,5` → `1.5`)
/// 4. Everything except letters, digits and decimal points becomes a space
/// 5. Numbers are joined to the unit that follows (`1 l` → `1l`)
/// 6. Whitespace is collapsed
pub fn normalize_name(raw: &str, boilerplate: &[String]) -> String {
    let mut s = fold(raw);

    for phrase in boilerplate {
        let phrase = fold(phrase.trim());
        if !phrase.is_empty() {
            s = s.replace(&phrase, " ");
        }
    }
    let s = RE_PERCENT.replace_all(&s, " ");
    let s = RE_DECIMAL_COMMA.replace_all(&s, "$1.$2");

    let s: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' { c } else { ' ' })
        .collect();
    let s = drop_stray_points(&s);
    let s = RE_NUMBER_UNIT.replace_all(&s, "$1$2");

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase, decompose and strip combining marks.
fn fold(s: &str) -> String {
    s.to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

static RE_PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+\s*%").unwrap());

static RE_DECIMAL_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d),(\d)").unwrap());

static RE_NUMBER_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d)\s+(l|ml|cl|dl|g|kg|mg|vnt|pcs|pc|pk|oz|lb|m|cm)\b").unwrap()
});

/// Keep a point only between two digits.
fn drop_stray_points(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let decimal = c == '.'
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if c == '.' && !decimal {
                ' '
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> String {
        normalize_name(s, &[])
    }

    #[test]
    fn case_spacing_and_units() {
        assert_eq!(norm("  Pienas   1 L "), "pienas 1l");
        assert_eq!(norm("PIENAS 1L"), "pienas 1l");
        assert_eq!(norm("Sūris 500 g"), "suris 500g");
    }

    #[test]
    fn decimal_comma_and_point_agree() {
        assert_eq!(norm("Kefyras 1,5 l"), norm("Kefyras 1.5 L"));
        assert_eq!(norm("Kefyras 1,5 l"), "kefyras 1.5l");
    }

    #[test]
    fn punctuation_is_dropped() {
        assert_eq!(norm("Coca-Cola, 2 l."), "coca cola 2l");
    }

    #[test]
    fn boilerplate_and_percentages_are_removed() {
        let boilerplate = vec!["Akcija!".to_string(), "tik šiandien".to_string()];
        assert_eq!(
            normalize_name("AKCIJA! Pienas 1L -30% tik šiandien", &boilerplate),
            "pienas 1l"
        );
    }

    #[test]
    fn boilerplate_matches_with_or_without_diacritics() {
        let accented = vec!["tik šiandien".to_string()];
        let plain = vec!["tik siandien".to_string()];
        assert_eq!(normalize_name("Pienas tik siandien 1L", &accented), "pienas 1l");
        assert_eq!(normalize_name("Pienas TIK ŠIANDIEN 1L", &plain), "pienas 1l");
        assert_eq!(normalize_name("Pienas tik šiandien 1L", &accented), "pienas 1l");
    }

    #[test]
    fn non_latin_letters_survive() {
        assert_eq!(norm("Молоко 1 л"), "молоко 1 л");
    }

    #[test]
    fn nothing_left() {
        assert_eq!(norm(" -- !! "), "");
    }
}
