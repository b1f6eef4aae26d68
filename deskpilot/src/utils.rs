use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

static UNSAFE_TAG_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("static regex"));

/// Current wall-clock time as fractional epoch seconds.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Local timestamp in the `YYYY-MM-DD HH:MM:SS` form used by the JSON logs.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Compact local timestamp used in file names (`YYYYMMDD_HHMMSS`).
pub fn file_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Parses the timestamp forms found in the JSONL logs into epoch seconds:
/// plain numbers, local `YYYY-MM-DD HH:MM:SS` and RFC 3339 strings.
pub fn parse_timestamp(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(epoch) = raw.parse::<f64>() {
        return Some(epoch);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis() as f64 / 1000.0);
    }
    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(raw, fmt).ok())?;
    naive
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

/// Lenient boolean parsing for env vars and loosely typed JSON.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Interprets a JSON value as a boolean the way hand-edited state files
/// tend to spell it (`true`, `"true"`, `" TRUE "`, `1`).
pub fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// Interprets a JSON value as a float, accepting numeric strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Last `max_chars` characters of `text`, cut on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Makes an arbitrary identifier safe for use inside a file name.
pub fn sanitize_tag(raw: &str) -> String {
    let cleaned = UNSAFE_TAG_CHARS.replace_all(raw.trim(), "_");
    cleaned.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_as_bool_accepts_string_forms() {
        assert!(value_as_bool(&json!(true)));
        assert!(value_as_bool(&json!(" True ")));
        assert!(value_as_bool(&json!(1)));
        assert!(!value_as_bool(&json!("yes please")));
        assert!(!value_as_bool(&json!(null)));
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("ünï", 10), "ünï");
        assert_eq!(tail_chars("✓✓✓✓", 2), "✓✓");
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag(" run 42/a:b "), "run_42_a_b");
        assert_eq!(sanitize_tag(&"x".repeat(300)).len(), 120);
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp(&json!(1700000000.5)), Some(1_700_000_000.5));
        assert_eq!(parse_timestamp(&json!("1700000000")), Some(1_700_000_000.0));
        assert_eq!(
            parse_timestamp(&json!("2024-01-01T00:00:00Z")),
            Some(1_704_067_200.0)
        );
        let local = parse_timestamp(&json!("2024-01-01 12:00:00")).unwrap();
        assert!((local - 1_704_110_400.0).abs() <= 14.0 * 3600.0);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool(" no "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
