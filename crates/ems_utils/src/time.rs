//! Wall-clock helpers. All queue deadlines and message timestamps are
//! i64 nanoseconds since the UNIX epoch.

use chrono::Utc;

pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub fn ms_to_ns(ms: u64) -> i64 {
    (ms as i64).saturating_mul(1_000_000)
}

pub fn ns_to_ms(ns: i64) -> i64 {
    ns / 1_000_000
}
