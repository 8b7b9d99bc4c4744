use rust_decimal::Decimal;
use std::str::FromStr;

/// Canonicalises an upstream scalar into a fixed-point decimal string:
/// - scientific notation (`"3.2E5"`) becomes a plain decimal without
///   trailing zeros,
/// - null/empty/`"0"` becomes `"0"`,
/// - anything else that doesn't parse as a number passes through unchanged.
///
/// Idempotent: `normalize_scalar(&normalize_scalar(x)) == normalize_scalar(x)`.
pub fn normalize_scalar(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return "0".to_string();
    }

    match Decimal::from_scientific(trimmed).or_else(|_| Decimal::from_str(trimmed)) {
        Ok(decimal) => {
            if decimal.is_zero() {
                "0".to_string()
            } else {
                trim_trailing_zeros(decimal.normalize().to_string())
            }
        }
        Err(_) => trimmed.to_string(),
    }
}

fn trim_trailing_zeros(s: String) -> String {
    if !s.contains('.') {
        return s;
    }
    let trimmed = s.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scientific_notation_becomes_plain_decimal() {
        assert_eq!(normalize_scalar("3.2E5"), "320000");
        assert_eq!(normalize_scalar("1.5e-2"), "0.015");
    }

    #[test]
    fn null_empty_and_zero_collapse_to_zero() {
        assert_eq!(normalize_scalar(""), "0");
        assert_eq!(normalize_scalar("null"), "0");
        assert_eq!(normalize_scalar("0"), "0");
        assert_eq!(normalize_scalar("0.0"), "0");
    }

    #[test]
    fn non_numeric_passes_through() {
        assert_eq!(normalize_scalar("pending"), "pending");
    }

    #[test]
    fn normalisation_is_idempotent() {
        for input in ["3.2E5", "0", "", "12.340", "pending"] {
            let once = normalize_scalar(input);
            let twice = normalize_scalar(&once);
            assert_eq!(once, twice);
        }
    }
}
