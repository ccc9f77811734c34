pub mod test_objects;
pub mod timestamp;

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time window owned by a single batch.
pub trait Windowed {
    fn batch_id(&self) -> &str;
    fn start_window(&self) -> DateTime<Utc>;
    fn end_window(&self) -> DateTime<Utc>;

    /// Inclusive on both bounds, so windows that only touch still overlap.
    fn overlaps<W: Windowed + ?Sized>(&self, other: &W) -> bool {
        self.batch_id() == other.batch_id() &&
            self.start_window() <= other.end_window() &&
            other.start_window() <= self.end_window()
    }

    fn duration_secs(&self) -> i64 {
        (self.end_window() - self.start_window()).num_seconds()
    }
}

macro_rules! windowed_entity {
    ($($entity:ty),+ $(,)?) => {
        $(
            impl Windowed for $entity {
                fn batch_id(&self) -> &str {
                    &self.batch_id
                }

                fn start_window(&self) -> DateTime<Utc> {
                    self.start_window
                }

                fn end_window(&self) -> DateTime<Utc> {
                    self.end_window
                }
            }

            impl Display for $entity {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match serde_json::to_string(self) {
                        Ok(json) => f.write_str(&json),
                        Err(_) => write!(f, "{:?}", self),
                    }
                }
            }
        )+
    };
}

/// One received batch window in the window log. Written once by the
/// ingestion side and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    #[serde(alias = "BatchId")]
    pub batch_id: String,
    #[serde(alias = "StartWindow", with = "timestamp")]
    pub start_window: DateTime<Utc>,
    #[serde(alias = "EndWindow", with = "timestamp")]
    pub end_window: DateTime<Utc>,
}

impl WindowRecord {
    pub fn new(batch_id: &str, start_window: DateTime<Utc>, end_window: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            start_window,
            end_window,
        }
    }
}

/// Hint that a window boundary has no matching neighbour: a window starts
/// at T1 but no window ends at T1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanSignal {
    #[serde(alias = "BatchId")]
    pub batch_id: String,
    #[serde(alias = "StartWindow", with = "timestamp")]
    pub start_window: DateTime<Utc>,
    #[serde(alias = "EndWindow", with = "timestamp")]
    pub end_window: DateTime<Utc>,
}

/// Interval of missing data between two consecutive windows of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGap {
    #[serde(alias = "BatchId")]
    pub batch_id: String,
    #[serde(alias = "StartWindow", with = "timestamp")]
    pub start_window: DateTime<Utc>,
    #[serde(alias = "EndWindow", with = "timestamp")]
    pub end_window: DateTime<Utc>,
    #[serde(alias = "GapInSeconds")]
    pub gap_in_seconds: i64,
}

impl DataGap {
    pub fn between(batch_id: &str, start_window: DateTime<Utc>, end_window: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            start_window,
            end_window,
            gap_in_seconds: (end_window - start_window).num_seconds(),
        }
    }

    /// The re-check gap scheduled after a request was dispatched. It covers
    /// exactly the requested window.
    pub fn follow_up(request: &BackfillRequest) -> Self {
        Self::between(&request.batch_id, request.start_window, request.end_window)
    }
}

/// Device-addressable repair instruction for one gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    #[serde(alias = "BatchId")]
    pub batch_id: String,
    #[serde(alias = "StartWindow", with = "timestamp")]
    pub start_window: DateTime<Utc>,
    #[serde(alias = "EndWindow", with = "timestamp")]
    pub end_window: DateTime<Utc>,
    #[serde(alias = "Created", with = "timestamp")]
    pub created: DateTime<Utc>,
}

impl BackfillRequest {
    pub fn for_gap(gap: &DataGap, created: DateTime<Utc>) -> Self {
        Self {
            batch_id: gap.batch_id.clone(),
            start_window: gap.start_window,
            end_window: gap.end_window,
            created,
        }
    }
}

windowed_entity!(WindowRecord, OrphanSignal, DataGap, BackfillRequest);

/// Payload of the backfill device method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillMethodPayload {
    #[serde(with = "timestamp")]
    pub start_window: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub end_window: DateTime<Utc>,
    pub batch_id: String,
}

impl From<&BackfillRequest> for BackfillMethodPayload {
    fn from(request: &BackfillRequest) -> Self {
        Self {
            start_window: request.start_window,
            end_window: request.end_window,
            batch_id: request.batch_id.clone(),
        }
    }
}

/// Detection message consumed by the direct backfill path. Field names
/// follow the edge relay's detection output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapNotice {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "previousLastTsInBatch", with = "timestamp")]
    pub previous_last_ts: DateTime<Utc>,
    #[serde(rename = "currfirstTsInBatch", with = "timestamp")]
    pub current_first_ts: DateTime<Utc>,
}

impl GapNotice {
    pub fn into_request(self, created: DateTime<Utc>) -> BackfillRequest {
        BackfillRequest {
            batch_id: self.device_id,
            start_window: self.previous_last_ts,
            end_window: self.current_first_ts,
            created,
        }
    }
}
