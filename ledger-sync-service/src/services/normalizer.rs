//! Merchant name normalization.
//!
//! Raw merchant strings from bank feeds and card networks carry reference
//! numbers, store numbers, dates, and processor prefixes that differ between
//! sources describing the same purchase. Matching compares normalized token
//! sets, so normalization must be deterministic and side-effect free.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

/// Processor prefixes prepended by card networks and payment facilitators.
static PROCESSOR_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(sq|tst|pp|sp|py)\s*\*\s*").expect("valid regex"));

/// Long digit runs: transaction references, phone numbers, card fragments.
static REFERENCE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4,}\b").expect("valid regex"));

/// Store-number suffixes like `#1234` or `no. 42`.
static STORE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(#|\bno\.?\s*)\d+\b").expect("valid regex"));

/// Trailing dates in the forms 01/02, 01-02-25, 2025-01-02.
static TRAILING_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,4}[/-]\d{1,2}([/-]\d{1,4})?\b").expect("valid regex"));

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9 ]").expect("valid regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Known alias map from card-network merchant codes to stable brand names.
static BRAND_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("amzn", "amazon"),
        ("amzn mktp", "amazon"),
        ("amazon mktplace", "amazon"),
        ("amazon mktp", "amazon"),
        ("wm supercenter", "walmart"),
        ("wal-mart", "walmart"),
        ("mcdonald s", "mcdonalds"),
        ("uber trip", "uber"),
        ("uber eats", "uber eats"),
        ("googleplay", "google play"),
        ("apple com bill", "apple"),
        ("netflix com", "netflix"),
        ("spotify p", "spotify"),
        ("tfl travel ch", "tfl"),
    ])
});

/// Tokens too generic to carry matching signal.
static STOPWORDS: &[&str] = &[
    "ltd", "llc", "inc", "co", "corp", "plc", "the", "of", "and", "pos", "purchase", "payment",
    "card", "debit", "credit", "com", "www", "ref",
];

/// The stable output of merchant normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMerchant {
    /// Canonical key: tokens joined by a single space. Used for direct-debit
    /// mapping lookups and rule matching.
    pub key: String,
    /// Token set for similarity comparison.
    pub tokens: BTreeSet<String>,
    /// Human-facing display name (title-cased key).
    pub display: String,
}

/// Normalize a raw merchant string into a canonical token set.
///
/// Deterministic and pure: the same input always yields the same output.
pub fn normalize(raw: &str) -> NormalizedMerchant {
    let mut text = raw.to_lowercase();

    text = PROCESSOR_PREFIX.replace(&text, "").to_string();
    text = STORE_NUMBER.replace_all(&text, " ").to_string();
    text = TRAILING_DATE.replace_all(&text, " ").to_string();
    text = REFERENCE_NUMBER.replace_all(&text, " ").to_string();
    text = NON_ALNUM.replace_all(&text, " ").to_string();
    text = WHITESPACE.replace_all(&text, " ").trim().to_string();

    // Alias lookup: the longest alias key matching the whole string or a
    // leading prefix wins, and the suffix (location, order fragment) drops.
    let mut best_alias: Option<(&str, &str)> = None;
    for (&code, &brand) in BRAND_ALIASES.iter() {
        let matches = text == code
            || (text.starts_with(code) && text.as_bytes().get(code.len()) == Some(&b' '));
        if matches && best_alias.map_or(true, |(prev, _)| code.len() > prev.len()) {
            best_alias = Some((code, brand));
        }
    }
    if let Some((_, brand)) = best_alias {
        text = brand.to_string();
    }

    let tokens: BTreeSet<String> = text
        .split(' ')
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect();

    let key = tokens.iter().cloned().collect::<Vec<_>>().join(" ");
    let display = title_case(&key);

    NormalizedMerchant { key, tokens, display }
}

/// Jaccard similarity between two token sets, in [0, 1].
pub fn similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &str) -> BTreeSet<String> {
        normalize(raw).tokens
    }

    #[test]
    fn strips_reference_and_store_numbers() {
        let n = normalize("TESCO STORES #3027 REF 991823441");
        assert_eq!(n.key, "stores tesco");
        assert!(n.tokens.contains("tesco"));
        assert!(!n.tokens.iter().any(|t| t.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn strips_processor_prefix() {
        let n = normalize("SQ *BLUE BOTTLE COFFEE");
        assert!(n.tokens.contains("blue"));
        assert!(n.tokens.contains("coffee"));
        assert!(!n.key.contains("sq"));
    }

    #[test]
    fn maps_known_aliases_to_brand() {
        assert_eq!(normalize("AMZN MKTP US*RT4567").key, "amazon");
        assert_eq!(normalize("AMAZON MKTPLACE").key, "amazon");
    }

    #[test]
    fn strips_trailing_dates() {
        let n = normalize("COSTA COFFEE 03/15");
        assert_eq!(n.key, "coffee costa");
    }

    #[test]
    fn is_deterministic() {
        let raw = "Uber Trip HELP.UBER.COM 882231";
        assert_eq!(normalize(raw), normalize(raw));
    }

    #[test]
    fn similarity_of_identical_sets_is_one() {
        let a = tokens("TESCO STORES #1");
        let b = tokens("TESCO STORES #2");
        assert!((similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn similarity_of_disjoint_sets_is_zero() {
        let a = tokens("TESCO");
        let b = tokens("SAINSBURYS");
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn similarity_of_empty_set_is_zero() {
        let a = tokens("12345");
        let b = tokens("TESCO");
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn display_is_title_cased() {
        assert_eq!(normalize("blue bottle").display, "Blue Bottle");
    }
}
