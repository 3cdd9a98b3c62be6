use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

static EDGE_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[\s.,!?;:'"()]+|[\s.,!?;:'"()]+$"#).expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
];

const ORG_SUFFIXES: [&str; 9] = [
    "Inc.", "Inc", "LLC", "Ltd.", "Ltd", "Corp.", "Corp", "Co.", "Co",
];

const CURRENCIES: [(&str, &str); 8] = [
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("USD", "USD"),
    ("EUR", "EUR"),
    ("GBP", "GBP"),
    ("JPY", "JPY"),
];

/// Canonical form of an extracted value, chosen by entity type.
/// Case is preserved; deduplication compares case-insensitively.
pub struct EntityNormalizer;

impl EntityNormalizer {
    pub fn normalize(entity_type: &str, value: &str) -> String {
        let cleaned = Self::clean(value);
        match entity_type {
            "date" | "expiration_date" | "effective_date" => {
                Self::normalize_date(&cleaned).unwrap_or(cleaned)
            }
            "amount" | "monetary_amount" => Self::normalize_amount(&cleaned).unwrap_or(cleaned),
            "organization" | "party" | "vendor" | "customer" => {
                Self::normalize_organization(&cleaned)
            }
            _ => cleaned,
        }
    }

    /// Trim surrounding punctuation and collapse runs of whitespace.
    fn clean(value: &str) -> String {
        let trimmed = EDGE_PUNCTUATION.replace_all(value, "");
        WHITESPACE.replace_all(&trimmed, " ").to_string()
    }

    fn normalize_date(value: &str) -> Option<String> {
        DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
            .map(|date| date.format("%Y-%m-%d").to_string())
    }

    fn normalize_amount(value: &str) -> Option<String> {
        let currency = CURRENCIES
            .iter()
            .find(|(marker, _)| value.contains(marker))
            .map(|(_, code)| *code)
            .unwrap_or("USD");
        let digits = value.replace(',', "");
        let amount: f64 = NUMBER.find(&digits)?.as_str().parse().ok()?;
        Some(format!("{amount:.2} {currency}"))
    }

    fn normalize_organization(value: &str) -> String {
        let mut normalized = value.trim_end_matches(',').to_string();
        for suffix in ORG_SUFFIXES {
            if let Some(stripped) = normalized.strip_suffix(suffix) {
                if stripped.ends_with(' ') || stripped.ends_with(", ") {
                    normalized = stripped.trim_end().trim_end_matches(',').to_string();
                    break;
                }
            }
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(EntityNormalizer::normalize("term", "  GraphRAG!  "), "GraphRAG");
        assert_eq!(EntityNormalizer::normalize("person", "Alice   Smith."), "Alice Smith");
    }

    #[test]
    fn dates_become_iso() {
        assert_eq!(EntityNormalizer::normalize("date", "03/15/2024"), "2024-03-15");
        assert_eq!(EntityNormalizer::normalize("date", "March 5, 2024"), "2024-03-05");
        assert_eq!(EntityNormalizer::normalize("date", "next Tuesday"), "next Tuesday");
    }

    #[test]
    fn amounts_carry_currency() {
        assert_eq!(EntityNormalizer::normalize("monetary_amount", "$1,500"), "1500.00 USD");
        assert_eq!(EntityNormalizer::normalize("amount", "€20.5"), "20.50 EUR");
        assert_eq!(EntityNormalizer::normalize("amount", "a lot"), "a lot");
    }

    #[test]
    fn organizations_lose_legal_suffix() {
        assert_eq!(EntityNormalizer::normalize("organization", "Acme Inc."), "Acme");
        assert_eq!(EntityNormalizer::normalize("vendor", "Globex, LLC"), "Globex");
        assert_eq!(EntityNormalizer::normalize("organization", "Costco"), "Costco");
    }
}
