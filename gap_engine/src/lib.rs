//! The gap engine computes missing windows from the window log and keeps the
//! ledger of dispatched backfill requests that deduplicates repairs.
//!
//! The engine holds no state besides its connection pool. Every operation
//! checks a connection out of the pool for its own duration only, so
//! concurrent workers coordinate exclusively through the tables.

use std::{fmt::Display, future::Future, str::FromStr, time::Duration};

use backfill_utils::{from_epoch_micros, horizon_start, to_epoch_micros};
use chrono::{DateTime, Utc};
use data_model::{BackfillRequest, DataGap, WindowRecord, Windowed};
use metrics::{store, Timer};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row,
    SqlitePool,
};
use tracing::{debug, error, info};

pub mod queries;
pub mod test_gap_engine;

const IN_MEMORY_URL: &str = "sqlite::memory:";

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://gap_backfill.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            database_url: IN_MEMORY_URL.to_string(),
            max_connections: 1,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("relational store failure during {operation} of {entity}. error: {source}")]
    Store {
        operation: &'static str,
        entity: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to decode a {table} row. error: {reason}")]
    Decode { table: &'static str, reason: String },

    #[error("cannot insert backfill request {request}, {rows} rows affected")]
    InsertRejected { request: String, rows: u64 },
}

const COMPONENT: &str = "gap-engine";

fn store_error(
    operation: &'static str,
    entity: &dyn Display,
) -> impl FnOnce(sqlx::Error) -> Error {
    let entity = entity.to_string();
    move |source| Error::Store {
        operation,
        entity,
        source,
    }
}

/// Outcome of recording a request in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInsert {
    Recorded,
    /// The exact request key is already in the ledger, typically because
    /// the same request was delivered twice.
    Conflict,
}

pub struct GapEngine {
    pool: SqlitePool,
    metrics: store::Metrics,
}

impl GapEngine {
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(store_error("connect", &config.database_url))?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection, so the
        // pool pins exactly one that never idles out.
        let pool_options = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(store_error("connect", &config.database_url))?;

        let engine = Self {
            pool,
            metrics: store::Metrics::new(),
        };
        engine.bootstrap().await?;
        info!(database_url = %config.database_url, "gap engine connected");
        Ok(engine)
    }

    async fn bootstrap(&self) -> Result<(), Error> {
        for statement in queries::SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error("bootstrap", &statement))?;
        }
        Ok(())
    }

    /// Closes the pool. Operations issued afterwards fail with a store
    /// error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn observed<T, F>(
        &self,
        operation: &'static str,
        entity: &(dyn Display + Sync),
        fut: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let labels = [KeyValue::new("op", operation)];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);
        fut.await.inspect_err(|err| {
            self.metrics.errors.add(1, &labels);
            error!(
                component = COMPONENT,
                operation,
                %entity,
                "error accessing relational store: {:?}",
                err
            );
        })
    }

    /// Appends a received window to the window log.
    pub async fn record_window(&self, window: &WindowRecord) -> Result<(), Error> {
        self.observed("record_window", window, async {
            sqlx::query(queries::INSERT_WINDOW)
                .bind(&window.batch_id)
                .bind(to_epoch_micros(&window.start_window))
                .bind(to_epoch_micros(&window.end_window))
                .execute(&self.pool)
                .await
                .map_err(store_error("record_window", window))?;
            Ok(())
        })
        .await
    }

    /// Gaps between consecutive windows of `batch_id` whose later window
    /// started within `since_horizon` of now, most recent first.
    pub async fn compute_gaps(
        &self,
        batch_id: &str,
        since_horizon: Duration,
    ) -> Result<Vec<DataGap>, Error> {
        let since = horizon_start(Utc::now(), since_horizon);
        self.observed("compute_gaps", &batch_id, async {
            let rows = sqlx::query(queries::SELECT_GAPS)
                .bind(batch_id)
                .bind(to_epoch_micros(&since))
                .fetch_all(&self.pool)
                .await
                .map_err(store_error("compute_gaps", &batch_id))?;
            rows.iter().map(gap_from_row).collect()
        })
        .await
    }

    /// Current gaps of `batch_id` lying entirely inside `[start, end]`.
    /// Late data may have split or closed the original gap.
    pub async fn compute_gaps_in_window(
        &self,
        batch_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DataGap>, Error> {
        let entity = format!("{batch_id} [{}, {}]", start.to_rfc3339(), end.to_rfc3339());
        let (start, end) = (to_epoch_micros(&start), to_epoch_micros(&end));
        self.observed("compute_gaps_in_window", &entity, async {
            let rows = sqlx::query(queries::SELECT_GAPS_IN_WINDOW)
                .bind(batch_id)
                .bind(start)
                .bind(end)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
                .map_err(store_error("compute_gaps_in_window", &entity))?;
            rows.iter().map(gap_from_row).collect()
        })
        .await
    }

    /// Records a dispatched request in the ledger. From here on the request
    /// leases its window to `find_active_request` callers.
    pub async fn record_active_request(
        &self,
        request: &BackfillRequest,
    ) -> Result<LedgerInsert, Error> {
        self.observed("record_active_request", request, async {
            let result = sqlx::query(queries::INSERT_BACKFILL_REQUEST)
                .bind(&request.batch_id)
                .bind(to_epoch_micros(&request.start_window))
                .bind(to_epoch_micros(&request.end_window))
                .bind(to_epoch_micros(&request.created))
                .execute(&self.pool)
                .await
                .map_err(store_error("record_active_request", request))?;
            match result.rows_affected() {
                1 => Ok(LedgerInsert::Recorded),
                0 => {
                    debug!(%request, "backfill request already recorded");
                    Ok(LedgerInsert::Conflict)
                }
                rows => Err(Error::InsertRejected {
                    request: request.to_string(),
                    rows,
                }),
            }
        })
        .await
    }

    /// Most recent ledger entry overlapping `window` that was created within
    /// `horizon` of now.
    pub async fn find_active_request<W>(
        &self,
        window: &W,
        horizon: Duration,
    ) -> Result<Option<BackfillRequest>, Error>
    where
        W: Windowed + Display + Sync,
    {
        let oldest_live = horizon_start(Utc::now(), horizon);
        self.observed("find_active_request", window, async {
            let row = sqlx::query(queries::SELECT_ACTIVE_REQUEST)
                .bind(window.batch_id())
                .bind(to_epoch_micros(&window.end_window()))
                .bind(to_epoch_micros(&window.start_window()))
                .bind(to_epoch_micros(&oldest_live))
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error("find_active_request", window))?;
            row.as_ref().map(request_from_row).transpose()
        })
        .await
    }
}

fn column<'r, T>(row: &'r SqliteRow, table: &'static str, name: &str) -> Result<T, Error>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| Error::Decode {
        table,
        reason: format!("column {name}: {e}"),
    })
}

fn timestamp_column(row: &SqliteRow, table: &'static str, name: &str) -> Result<DateTime<Utc>, Error> {
    let micros: i64 = column(row, table, name)?;
    from_epoch_micros(micros).map_err(|e| Error::Decode {
        table,
        reason: format!("column {name}: {e}"),
    })
}

fn gap_from_row(row: &SqliteRow) -> Result<DataGap, Error> {
    let batch_id: String = column(row, "window_log", "batch_id")?;
    let start = timestamp_column(row, "window_log", "gap_start")?;
    let end = timestamp_column(row, "window_log", "gap_end")?;
    Ok(DataGap::between(&batch_id, start, end))
}

fn request_from_row(row: &SqliteRow) -> Result<BackfillRequest, Error> {
    Ok(BackfillRequest {
        batch_id: column(row, "backfill_requests", "batch_id")?,
        start_window: timestamp_column(row, "backfill_requests", "start_window")?,
        end_window: timestamp_column(row, "backfill_requests", "end_window")?,
        created: timestamp_column(row, "backfill_requests", "created")?,
    })
}
