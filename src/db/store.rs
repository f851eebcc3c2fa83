//! SQLite store for probe history, statistics snapshots and disconnects.
//!
//! Timestamps are stored as epoch milliseconds so range scans stay on the
//! integer indexes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::{DisconnectRow, PingRecord, StatsRow};
use crate::stats::{DisconnectEvent, StatsSnapshot};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ping_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_name TEXT NOT NULL,
    host TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    success INTEGER NOT NULL,
    response_time_ms REAL
);

CREATE TABLE IF NOT EXISTS target_statistics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_name TEXT NOT NULL,
    host TEXT NOT NULL,
    total_pings INTEGER NOT NULL,
    successful_pings INTEGER NOT NULL,
    failed_pings INTEGER NOT NULL,
    success_rate REAL NOT NULL,
    avg_response_time REAL,
    min_response_time REAL,
    max_response_time REAL,
    last_status INTEGER,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS disconnect_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_name TEXT NOT NULL,
    host TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    disconnect_count INTEGER NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    UNIQUE(target_name, start_time)
);

CREATE INDEX IF NOT EXISTS idx_ping_history_target_timestamp
    ON ping_history(target_name, timestamp);

CREATE INDEX IF NOT EXISTS idx_target_statistics_target_timestamp
    ON target_statistics(target_name, timestamp);

CREATE INDEX IF NOT EXISTS idx_disconnect_events_target_start
    ON disconnect_events(target_name, start_time);
";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- Ping history (append-only) ---

    /// Append a batch of ping results.
    pub fn add_ping_records(&self, records: &[PingRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO ping_history (target_name, host, timestamp, success, response_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for r in records {
                stmt.execute(params![
                    r.target_name,
                    r.host,
                    r.timestamp.timestamp_millis(),
                    r.success as i64,
                    r.response_time_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get ping history for a target within a time range, oldest first.
    pub fn get_ping_records(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PingRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT target_name, host, timestamp, success, response_time_ms
             FROM ping_history
             WHERE target_name = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp ASC LIMIT ?4",
        )?;

        let records = stmt
            .query_map(
                params![
                    target_name,
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    limit
                ],
                |row| {
                    Ok(PingRecord {
                        target_name: row.get(0)?,
                        host: row.get(1)?,
                        timestamp: millis_to_utc(row.get(2)?),
                        success: row.get::<_, i64>(3)? != 0,
                        response_time_ms: row.get(4)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    // --- Statistics snapshots (append-only) ---

    /// Append a batch of statistics snapshots.
    pub fn add_stats_snapshots(&self, snapshots: &[StatsSnapshot]) -> Result<(), DbError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO target_statistics (target_name, host, total_pings, successful_pings,
                    failed_pings, success_rate, avg_response_time, min_response_time,
                    max_response_time, last_status, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for s in snapshots {
                stmt.execute(params![
                    s.target_name,
                    s.host,
                    s.total_pings as i64,
                    s.successful_pings as i64,
                    s.failed_pings as i64,
                    s.success_rate,
                    s.avg_response_time,
                    s.min_response_time,
                    s.max_response_time,
                    s.last_status,
                    s.timestamp.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get snapshot rows for a target, newest first.
    pub fn get_stats_rows(&self, target_name: &str, limit: i64) -> Result<Vec<StatsRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT target_name, host, total_pings, successful_pings, failed_pings, success_rate,
                    avg_response_time, min_response_time, max_response_time, last_status, timestamp
             FROM target_statistics
             WHERE target_name = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![target_name, limit], |row| {
                Ok(StatsRow {
                    target_name: row.get(0)?,
                    host: row.get(1)?,
                    total_pings: row.get::<_, i64>(2)? as u64,
                    successful_pings: row.get::<_, i64>(3)? as u64,
                    failed_pings: row.get::<_, i64>(4)? as u64,
                    success_rate: row.get(5)?,
                    avg_response_time: row.get(6)?,
                    min_response_time: row.get(7)?,
                    max_response_time: row.get(8)?,
                    last_status: row.get(9)?,
                    timestamp: millis_to_utc(row.get(10)?),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    // --- Disconnect events (upsert keyed on target_name + start_time) ---

    /// Insert or update a disconnect event.
    ///
    /// Re-applying the same event is idempotent, so replayed writes after a
    /// retry converge on the latest state. The opening reason is kept.
    pub fn upsert_disconnect(&self, event: &DisconnectEvent) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO disconnect_events
                (target_name, host, start_time, end_time, disconnect_count, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(target_name, start_time) DO UPDATE SET
                end_time = excluded.end_time,
                disconnect_count = excluded.disconnect_count",
            params![
                event.target_name,
                event.host,
                event.start_time.timestamp_millis(),
                event.end_time.map(|t| t.timestamp_millis()),
                event.consecutive_failure_count,
                event.reason,
            ],
        )?;
        Ok(())
    }

    /// Get disconnect events for a target, newest first.
    pub fn get_disconnect_rows(
        &self,
        target_name: &str,
        limit: i64,
    ) -> Result<Vec<DisconnectRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT target_name, host, start_time, end_time, disconnect_count, reason
             FROM disconnect_events
             WHERE target_name = ?1
             ORDER BY start_time DESC LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![target_name, limit], |row| {
                Ok(DisconnectRow {
                    target_name: row.get(0)?,
                    host: row.get(1)?,
                    start_time: millis_to_utc(row.get(2)?),
                    end_time: row.get::<_, Option<i64>>(3)?.map(millis_to_utc),
                    disconnect_count: row.get(4)?,
                    reason: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Get the open disconnect event for a target, if any.
    pub fn get_open_disconnect(&self, target_name: &str) -> Result<Option<DisconnectRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT target_name, host, start_time, end_time, disconnect_count, reason
                 FROM disconnect_events
                 WHERE target_name = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC LIMIT 1",
                params![target_name],
                |row| {
                    Ok(DisconnectRow {
                        target_name: row.get(0)?,
                        host: row.get(1)?,
                        start_time: millis_to_utc(row.get(2)?),
                        end_time: row.get::<_, Option<i64>>(3)?.map(millis_to_utc),
                        disconnect_count: row.get(4)?,
                        reason: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ping_history_round_trip() {
        let (_tmp, store) = store();

        let records = vec![
            PingRecord {
                target_name: "gw".into(),
                host: "192.168.1.1".into(),
                timestamp: at(0),
                success: true,
                response_time_ms: Some(1.5),
            },
            PingRecord {
                target_name: "gw".into(),
                host: "192.168.1.1".into(),
                timestamp: at(60),
                success: false,
                response_time_ms: None,
            },
        ];
        store.add_ping_records(&records).unwrap();

        let fetched = store
            .get_ping_records("gw", at(0), at(120), 100)
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched[0].success);
        assert_eq!(fetched[0].response_time_ms, Some(1.5));
        assert!(!fetched[1].success);
        assert_eq!(fetched[1].timestamp, at(60));

        // Range end is exclusive.
        let first_only = store.get_ping_records("gw", at(0), at(60), 100).unwrap();
        assert_eq!(first_only.len(), 1);
    }

    #[test]
    fn stats_snapshot_round_trip() {
        let (_tmp, store) = store();

        let snap = StatsSnapshot {
            target_name: "gw".into(),
            host: "192.168.1.1".into(),
            total_pings: 10,
            successful_pings: 9,
            failed_pings: 1,
            success_rate: 90.0,
            avg_response_time: Some(2.25),
            min_response_time: Some(1.0),
            max_response_time: Some(7.5),
            last_status: Some(1),
            timestamp: at(0),
        };
        store.add_stats_snapshots(&[snap]).unwrap();

        let rows = store.get_stats_rows("gw", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_pings, 10);
        assert_eq!(rows[0].success_rate, 90.0);
        assert_eq!(rows[0].min_response_time, Some(1.0));
        assert_eq!(rows[0].last_status, Some(1));
    }

    #[test]
    fn disconnect_upsert_open_then_close() {
        let (_tmp, store) = store();

        let mut event = DisconnectEvent {
            target_name: "gw".into(),
            host: "192.168.1.1".into(),
            start_time: at(0),
            end_time: None,
            consecutive_failure_count: 1,
            reason: "timeout".into(),
        };
        store.upsert_disconnect(&event).unwrap();

        let open = store.get_open_disconnect("gw").unwrap().unwrap();
        assert_eq!(open.disconnect_count, 1);
        assert!(open.end_time.is_none());

        // Growing failure count updates the same row.
        event.consecutive_failure_count = 3;
        store.upsert_disconnect(&event).unwrap();

        // Closing pairs with the same (target_name, start_time) key.
        event.end_time = Some(at(180));
        store.upsert_disconnect(&event).unwrap();

        assert!(store.get_open_disconnect("gw").unwrap().is_none());

        let rows = store.get_disconnect_rows("gw", 10).unwrap();
        assert_eq!(rows.len(), 1, "upserts must not create duplicate rows");
        assert_eq!(rows[0].disconnect_count, 3);
        assert_eq!(rows[0].end_time, Some(at(180)));
        assert_eq!(rows[0].reason, "timeout");
    }

    #[test]
    fn disconnects_are_scoped_per_target() {
        let (_tmp, store) = store();

        for name in ["a", "b"] {
            store
                .upsert_disconnect(&DisconnectEvent {
                    target_name: name.into(),
                    host: "10.0.0.1".into(),
                    start_time: at(0),
                    end_time: None,
                    consecutive_failure_count: 1,
                    reason: "unreachable".into(),
                })
                .unwrap();
        }

        assert!(store.get_open_disconnect("a").unwrap().is_some());
        assert!(store.get_open_disconnect("b").unwrap().is_some());
        assert_eq!(store.get_disconnect_rows("a", 10).unwrap().len(), 1);
    }
}
