use chrono::{DateTime, NaiveDateTime, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parses a box timestamp into Unix seconds.
///
/// The box reports wall-clock times without a zone; they are read as UTC so
/// that the same frame always maps to the same dedup key.
pub fn parse_box_time(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || value == "null" {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.and_utc().timestamp())
}

/// Like [`parse_box_time`], falling back to the current time.
pub fn box_time_or_now(value: Option<&str>) -> i64 {
    match value.and_then(parse_box_time) {
        Some(ts) => ts,
        None => {
            if let Some(raw) = value {
                log::debug!(target: "Frame", "Unparseable box time {raw:?}, using receive time");
            }
            now_unix()
        }
    }
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_box_format() {
        assert_eq!(parse_box_time("1970-01-01 00:16:40"), Some(1000));
        assert_eq!(parse_box_time("2022-06-17 10:00:00.250"), Some(1655460000));
    }

    #[test]
    fn parses_rfc3339() {
        assert_eq!(parse_box_time("2022-06-17T12:00:00+02:00"), Some(1655460000));
        assert_eq!(parse_box_time("2022-06-17T10:00:00"), Some(1655460000));
    }

    #[test]
    fn invalid_times_fall_back_to_now() {
        assert_eq!(parse_box_time("yesterday"), None);
        assert_eq!(parse_box_time("null"), None);
        let before = now_unix();
        let ts = box_time_or_now(Some("garbage"));
        assert!(ts >= before);
        assert!(box_time_or_now(None) >= before);
    }
}
