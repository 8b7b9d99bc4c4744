use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Uniform error response shape returned by every handler.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), field: None, message: None, request_id: None }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Strict `YYYY-MM-DD`, must parse as a valid Gregorian date.
pub fn parse_strict_date(field: &str, raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::new("Invalid date").field(field).message(format!("expected YYYY-MM-DD, got {raw}")))
}

/// Clamps `hours` to `[min, max]`, defaulting to 24 when absent.
pub fn parse_hours(raw: Option<&str>, min: i64, max: i64) -> Result<i64, ApiError> {
    let Some(raw) = raw else {
        return Ok(24.clamp(min, max));
    };
    let parsed: i64 = raw
        .parse()
        .map_err(|_| ApiError::new("Invalid hours").field("hours").message(format!("not an integer: {raw}")))?;
    if parsed < min || parsed > max {
        return Err(ApiError::new("Invalid hours")
            .field("hours")
            .message(format!("must be between {min} and {max}")));
    }
    Ok(parsed)
}

/// Comma-separated list; empty items discarded.
pub fn parse_tokens(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(raw) => raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
        None => Vec::new(),
    }
}

static BASE58_ADDRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").unwrap());

pub fn is_valid_address(addr: &str) -> bool {
    BASE58_ADDRESS.is_match(addr)
}

pub fn parse_address(field: &str, raw: &str) -> Result<String, ApiError> {
    if is_valid_address(raw) {
        Ok(raw.to_string())
    } else {
        Err(ApiError::new("Invalid address").field(field).message("must be a base58 address, 32-44 characters"))
    }
}

/// Generic arbitrary-JSON query parameter, used by handlers that accept a
/// structured filter (e.g. a token->pool override map) rather than a scalar.
/// Parse failures carry the field name so the caller can pinpoint which
/// parameter was malformed.
pub fn parse_json_param<T: serde::de::DeserializeOwned>(field: &str, raw: &str) -> Result<T, ApiError> {
    serde_json::from_str(raw).map_err(|_| ApiError::new("Invalid JSON").field(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_date_rejects_malformed_input() {
        assert!(parse_strict_date("startDate", "2026-01-07").is_ok());
        assert!(parse_strict_date("startDate", "2026/01/07").is_err());
        assert!(parse_strict_date("startDate", "2026-02-30").is_err());
    }

    #[test]
    fn hours_defaults_and_clamps() {
        assert_eq!(parse_hours(None, 1, 168).unwrap(), 24);
        assert!(parse_hours(Some("0"), 1, 168).is_err());
        assert!(parse_hours(Some("169"), 1, 168).is_err());
        assert_eq!(parse_hours(Some("48"), 1, 168).unwrap(), 48);
    }

    #[test]
    fn tokens_discards_empty_items() {
        assert_eq!(parse_tokens(Some("a,,b, ,c")), vec!["a", "b", "c"]);
        assert_eq!(parse_tokens(None), Vec::<String>::new());
    }

    #[test]
    fn address_regex_excludes_ambiguous_chars() {
        assert!(is_valid_address("11111111111111111111111111111111"));
        assert!(!is_valid_address("short"));
        assert!(!is_valid_address("0oooooooooooooooooooooooooooooooo"));
    }

    #[test]
    fn json_param_reports_field_on_parse_failure() {
        let ok: Result<Vec<String>, ApiError> = parse_json_param("tokens", r#"["a","b"]"#);
        assert_eq!(ok.unwrap(), vec!["a", "b"]);

        let err: Result<Vec<String>, ApiError> = parse_json_param("tokens", "not json");
        let err = err.unwrap_err();
        assert_eq!(err.error, "Invalid JSON");
        assert_eq!(err.field.as_deref(), Some("tokens"));
    }
}
