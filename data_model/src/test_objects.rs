pub mod tests {
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use crate::{BackfillRequest, DataGap, WindowRecord};

    pub const TEST_BATCH: &str = "batch_a";

    /// Fixed instant on 2024-05-01, `hour:minute` UTC.
    pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    /// Minute offsets relative to `base`, for fixtures that have to fall
    /// inside a horizon measured from the current time.
    pub fn minutes_after(base: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        base + TimeDelta::minutes(minutes)
    }

    pub fn mock_window(
        batch_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> WindowRecord {
        WindowRecord::new(batch_id, start, end)
    }

    pub fn mock_gap(batch_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> DataGap {
        DataGap::between(batch_id, start, end)
    }

    pub fn mock_request(
        batch_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        created: DateTime<Utc>,
    ) -> BackfillRequest {
        BackfillRequest::for_gap(&DataGap::between(batch_id, start, end), created)
    }
}
