use anyhow::Result;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use data_model::WindowRecord;

use crate::{GapEngine, StoreConfig};

pub async fn in_memory_engine() -> Result<GapEngine> {
    Ok(GapEngine::connect(&StoreConfig::in_memory()).await?)
}

/// An hour before now on a whole second, so fixtures built from it survive
/// the microsecond round trip through the store and stay inside
/// horizons measured from the current time.
pub fn recent_base() -> DateTime<Utc> {
    (Utc::now() - TimeDelta::hours(1)).trunc_subsecs(0)
}

pub async fn with_windows(
    engine: &GapEngine,
    windows: &[(&str, DateTime<Utc>, DateTime<Utc>)],
) -> Result<()> {
    for (batch_id, start, end) in windows {
        engine
            .record_window(&WindowRecord::new(batch_id, *start, *end))
            .await?;
    }
    Ok(())
}

pub async fn engine_with_windows(
    windows: &[(&str, DateTime<Utc>, DateTime<Utc>)],
) -> Result<GapEngine> {
    let engine = in_memory_engine().await?;
    with_windows(&engine, windows).await?;
    Ok(engine)
}
