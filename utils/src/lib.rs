use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};

/// Microseconds since the Unix epoch. Store-side representation of every
/// window boundary and ledger timestamp.
pub fn to_epoch_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_epoch_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp out of range: {micros}us"))
}

/// The instant `horizon` before `now`, saturating at the epoch minimum.
pub fn horizon_start(now: DateTime<Utc>, horizon: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(horizon).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(delta)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Splits a delivery unit into its newline-delimited messages. The upstream
/// runtime may append several JSON documents into one event body.
pub fn split_delivery(body: &str) -> impl Iterator<Item = &str> {
    body.lines().map(str::trim).filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_epoch_micros_keeps_fractional_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap() +
            TimeDelta::microseconds(123_456);
        let micros = to_epoch_micros(&ts);
        assert_eq!(from_epoch_micros(micros).unwrap(), ts);
    }

    #[test]
    fn test_horizon_start() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let start = horizon_start(now, Duration::from_secs(300));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 9, 55, 0).unwrap());

        let start = horizon_start(now, Duration::MAX);
        assert_eq!(start, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_split_delivery_skips_blank_lines() {
        let body = "{\"a\":1}\r\n\r\n{\"a\":2}\n  \n";
        let messages: Vec<&str> = split_delivery(body).collect();
        assert_eq!(messages, vec!["{\"a\":1}", "{\"a\":2}"]);
    }
}
