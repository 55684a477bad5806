//! Derives the numeric archive columns from the loosely typed listing fields.
//! Nothing here fails: whatever can't be read becomes `None`.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::Scalar;

static CURRENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3})\b").expect("currency pattern is valid"));

static AMOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)*").expect("amount pattern is valid"));

/// Split a price into `(amount, currency)`.
///
/// `"CHF 3'500.–"` gives `(Some(3500.0), Some("CHF"))`, a bare number gives
/// just the amount, and text without digits or a currency code yields `None`
/// for the missing part.
pub fn parse_price(price: Option<&Scalar>) -> (Option<f64>, Option<String>) {
    let text = match price {
        None => return (None, None),
        Some(Scalar::Number(n)) => return (Some(*n).filter(|n| n.is_finite()), None),
        Some(Scalar::Text(text)) if text.trim().is_empty() => return (None, None),
        Some(Scalar::Text(text)) => text,
    };

    let currency = CURRENCY
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    // spaces and apostrophes only ever group thousands
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '’' | '\u{a0}' | '\u{202f}'))
        .collect();
    let amount = AMOUNT
        .find(&cleaned)
        .and_then(|m| parse_amount(m.as_str()));

    (amount, currency)
}

/// Read a numeric token that may use `,` or `.` for decimals or grouping
fn parse_amount(token: &str) -> Option<f64> {
    let commas = token.matches(',').count();
    let dots = token.matches('.').count();

    let normalized = match (commas, dots) {
        (0, 0) => token.to_string(),
        (0, 1) => single_mark(token, '.'),
        (0, _) => token.replace('.', ""),
        (1, 0) => single_mark(token, ','),
        (_, 0) => token.replace(',', ""),
        _ => {
            // both present: whichever comes last is the decimal mark
            if token.rfind(',') > token.rfind('.') {
                token.replace('.', "").replace(',', ".")
            } else {
                token.replace(',', "")
            }
        }
    };

    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// One separator: exactly three digits after it means thousands grouping
fn single_mark(token: &str, mark: char) -> String {
    let fraction = token.split(mark).nth(1).unwrap_or("");
    if fraction.len() == 3 {
        token.replace(mark, "")
    } else {
        token.replace(mark, ".")
    }
}

/// Permissive numeric coercion for room counts ("4,5", "3.5", 4)
pub fn coerce_rooms(rooms: Option<&Scalar>) -> Option<f64> {
    match rooms? {
        Scalar::Number(n) => Some(*n),
        Scalar::Text(text) => text.trim().replace(',', ".").parse::<f64>().ok(),
    }
    .filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.to_string())
    }

    #[test]
    fn price_with_trailing_currency() {
        assert_eq!(
            parse_price(Some(&text("3500 CHF"))),
            (Some(3500.0), Some("CHF".to_string()))
        );
    }

    #[test]
    fn price_with_apostrophe_grouping() {
        assert_eq!(
            parse_price(Some(&text("CHF 3'500.–"))),
            (Some(3500.0), Some("CHF".to_string()))
        );
        assert_eq!(
            parse_price(Some(&text("CHF 2’150.50 / Monat"))),
            (Some(2150.5), Some("CHF".to_string()))
        );
    }

    #[test]
    fn price_without_data() {
        assert_eq!(parse_price(Some(&text("—"))), (None, None));
        assert_eq!(parse_price(None), (None, None));
        assert_eq!(parse_price(Some(&text("   "))), (None, None));
        assert_eq!(
            parse_price(Some(&text("Preis auf Anfrage EUR"))),
            (None, Some("EUR".to_string()))
        );
    }

    #[test]
    fn numeric_price_has_no_currency() {
        assert_eq!(parse_price(Some(&Scalar::Number(1890.0))), (Some(1890.0), None));
    }

    #[test]
    fn amount_separators() {
        assert_eq!(parse_amount("1,200"), Some(1200.0));
        assert_eq!(parse_amount("12,5"), Some(12.5));
        assert_eq!(parse_amount("1.234.567"), Some(1234567.0));
        assert_eq!(parse_amount("1.234,50"), Some(1234.5));
        assert_eq!(parse_amount("1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("1.200"), Some(1200.0));
        assert_eq!(parse_amount("2150.5"), Some(2150.5));
    }

    #[test]
    fn price_with_dot_grouping() {
        assert_eq!(
            parse_price(Some(&text("CHF 2.450.–"))),
            (Some(2450.0), Some("CHF".to_string()))
        );
        assert_eq!(
            parse_price(Some(&text("1.200 CHF"))),
            (Some(1200.0), Some("CHF".to_string()))
        );
    }

    #[test]
    fn rooms_coercion() {
        assert_eq!(coerce_rooms(Some(&Scalar::Number(4.0))), Some(4.0));
        assert_eq!(coerce_rooms(Some(&text("4,5"))), Some(4.5));
        assert_eq!(coerce_rooms(Some(&text(" 3.5 "))), Some(3.5));
        assert_eq!(coerce_rooms(Some(&text(""))), None);
        assert_eq!(coerce_rooms(Some(&text("viele"))), None);
        assert_eq!(coerce_rooms(Some(&text("NaN"))), None);
        assert_eq!(coerce_rooms(None), None);
    }
}
