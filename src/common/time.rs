use chrono::{DateTime, Local};

pub type Timestamp = DateTime<Local>;

pub fn now() -> Timestamp {
    Local::now()
}

/// ISO-8601 wall-clock form used on the wire, e.g. `2025-03-01T14:02:11.004512`.
pub fn iso(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// File-name stem with microsecond precision, e.g. `20250301_140211_004512`.
pub fn precise_stamp(ts: &Timestamp) -> String {
    ts.format("%Y%m%d_%H%M%S_%6f").to_string()
}

/// File-name stem with second precision, e.g. `20250301_140211`.
pub fn second_stamp(ts: &Timestamp) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}
