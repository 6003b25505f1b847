use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in nanoseconds since the Unix epoch. This is the time base of sender
///  timestamps in packet headers and of frame capture timestamps.
pub fn now_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos().try_into().unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

pub fn nanos_to_millis(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000.0
}
