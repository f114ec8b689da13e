//! Attribute coercion helpers.
//!
//! Graph and node attributes are free-form strings; the scheduler parses
//! ints, bools, durations (`"1s"`, `"200ms"`) and comma-separated lists at
//! the point of use instead of typing the data model.

use std::time::Duration;

pub fn parse_int(s: Option<&str>, default: i64) -> i64 {
    s.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(default)
}

pub fn parse_bool(s: Option<&str>, default: bool) -> bool {
    match s.map(str::trim) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

/// Parses `"200ms"`, `"1s"`, `"2m"`, `"1h"`; a bare number is seconds.
pub fn parse_duration(s: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = s.map(str::trim) else {
        return default;
    };
    let parsed = if let Some(ms) = raw.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(h) = raw.strip_suffix('h') {
        h.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 3600))
    } else if let Some(m) = raw.strip_suffix('m') {
        m.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 60))
    } else if let Some(sec) = raw.strip_suffix('s') {
        sec.trim().parse::<f64>().ok().map(Duration::from_secs_f64)
    } else {
        raw.parse::<f64>().ok().map(Duration::from_secs_f64)
    };
    parsed.unwrap_or(default)
}

/// Splits a comma-separated attribute into trimmed, non-empty entries.
pub fn parse_list(s: Option<&str>) -> Vec<String> {
    s.map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
