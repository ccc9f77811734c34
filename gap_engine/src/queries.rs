//! Statements run against the window log and the backfill request ledger.
//! Every value is a bound parameter. Timestamps are epoch microseconds.

pub const CREATE_WINDOW_LOG: &str = "
    CREATE TABLE IF NOT EXISTS window_log (
        batch_id TEXT NOT NULL,
        start_window INTEGER NOT NULL,
        end_window INTEGER NOT NULL
    )";

pub const CREATE_WINDOW_LOG_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS window_log_batch_start
    ON window_log (batch_id, start_window)";

pub const CREATE_BACKFILL_REQUESTS: &str = "
    CREATE TABLE IF NOT EXISTS backfill_requests (
        batch_id TEXT NOT NULL,
        start_window INTEGER NOT NULL,
        end_window INTEGER NOT NULL,
        created INTEGER NOT NULL,
        PRIMARY KEY (batch_id, start_window, end_window, created)
    )";

pub const CREATE_BACKFILL_REQUESTS_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS backfill_requests_batch_created
    ON backfill_requests (batch_id, created)";

pub const SCHEMA: [&str; 4] = [
    CREATE_WINDOW_LOG,
    CREATE_WINDOW_LOG_INDEX,
    CREATE_BACKFILL_REQUESTS,
    CREATE_BACKFILL_REQUESTS_INDEX,
];

pub const INSERT_WINDOW: &str = "
    INSERT INTO window_log (batch_id, start_window, end_window)
    VALUES (?, ?, ?)";

// Consecutive windows of one batch are paired by rank. Identical records
// (re-delivered ingestion) collapse into one before ranking.
//
// binds: batch_id, earliest cur.start_window
pub const SELECT_GAPS: &str = "
    WITH ordered AS (
        SELECT batch_id, start_window, end_window,
               ROW_NUMBER() OVER (ORDER BY start_window, end_window) AS rn
        FROM (SELECT DISTINCT batch_id, start_window, end_window
              FROM window_log
              WHERE batch_id = ?)
    )
    SELECT DISTINCT cur.batch_id AS batch_id,
           prev.end_window AS gap_start,
           cur.start_window AS gap_end
    FROM ordered cur
    JOIN ordered prev ON cur.rn = prev.rn + 1
    WHERE cur.start_window <> prev.end_window
      AND cur.start_window >= ?
    ORDER BY gap_start DESC, gap_end DESC";

// binds: batch_id, window start, window end, window start, window end
pub const SELECT_GAPS_IN_WINDOW: &str = "
    WITH ordered AS (
        SELECT batch_id, start_window, end_window,
               ROW_NUMBER() OVER (ORDER BY start_window, end_window) AS rn
        FROM (SELECT DISTINCT batch_id, start_window, end_window
              FROM window_log
              WHERE batch_id = ?)
    )
    SELECT DISTINCT cur.batch_id AS batch_id,
           prev.end_window AS gap_start,
           cur.start_window AS gap_end
    FROM ordered cur
    JOIN ordered prev ON cur.rn = prev.rn + 1
    WHERE cur.start_window <> prev.end_window
      AND prev.end_window BETWEEN ? AND ?
      AND cur.start_window BETWEEN ? AND ?
    ORDER BY gap_start DESC, gap_end DESC";

pub const INSERT_BACKFILL_REQUEST: &str = "
    INSERT INTO backfill_requests (batch_id, start_window, end_window, created)
    VALUES (?, ?, ?, ?)
    ON CONFLICT DO NOTHING";

// Inclusive overlap with the candidate window, newest entry wins.
//
// binds: batch_id, candidate end, candidate start, oldest live created
pub const SELECT_ACTIVE_REQUEST: &str = "
    SELECT batch_id, start_window, end_window, created
    FROM backfill_requests
    WHERE batch_id = ?
      AND start_window <= ?
      AND end_window >= ?
      AND created > ?
    ORDER BY created DESC
    LIMIT 1";
