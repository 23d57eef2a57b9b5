//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Thread-safe database store.
#[derive(Clone, Debug)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        self.conn()
            .execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Samples ---

    /// Add samples in batch.
    pub fn add_samples(&self, samples: &[RawSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (time, target_id, latency_ms, ttl, jitter_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for s in samples {
                stmt.execute(params![
                    format_time(s.time),
                    s.target_id,
                    s.latency_ms,
                    s.ttl,
                    s.jitter_ms,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get samples for a target within `[start, end)`.
    pub fn get_samples(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, ttl, jitter_ms FROM samples
             WHERE target_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;

        let samples = stmt
            .query_map(
                params![target_id, format_time(start), format_time(end)],
                |row| {
                    Ok(RawSample {
                        time: row_time(row, 0)?,
                        target_id: row.get(1)?,
                        latency_ms: row.get(2)?,
                        ttl: row.get(3)?,
                        jitter_ms: row.get(4)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Targets that have at least one stored sample.
    pub fn sample_target_ids(&self) -> Result<Vec<i64>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT target_id FROM samples ORDER BY target_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn earliest_sample_time(&self, target_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM samples WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete samples of every target before a cutoff. Returns the row count.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM samples WHERE time < ?1",
            params![format_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Rollups ---

    /// Add rollups in batch, replacing rows for the same window.
    pub fn add_rollups(&self, rollups: &[Rollup]) -> Result<(), DbError> {
        if rollups.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO rollups (time, target_id, window_seconds, min_ms, avg_ms, max_ms, sample_count, failed_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(time, target_id, window_seconds) DO UPDATE SET
                 min_ms=excluded.min_ms, avg_ms=excluded.avg_ms, max_ms=excluded.max_ms,
                 sample_count=excluded.sample_count, failed_count=excluded.failed_count",
            )?;

            for r in rollups {
                stmt.execute(params![
                    format_time(r.time),
                    r.target_id,
                    r.window_seconds,
                    r.min_ms,
                    r.avg_ms,
                    r.max_ms,
                    r.sample_count,
                    r.failed_count,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get rollups for a target and window within `[start, end)`.
    pub fn get_rollups(
        &self,
        target_id: i64,
        window_seconds: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, window_seconds, min_ms, avg_ms, max_ms, sample_count, failed_count
             FROM rollups
             WHERE target_id = ?1 AND window_seconds = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time ASC",
        )?;

        let rollups = stmt
            .query_map(
                params![target_id, window_seconds, format_time(start), format_time(end)],
                |row| {
                    Ok(Rollup {
                        time: row_time(row, 0)?,
                        target_id: row.get(1)?,
                        window_seconds: row.get(2)?,
                        min_ms: row.get(3)?,
                        avg_ms: row.get(4)?,
                        max_ms: row.get(5)?,
                        sample_count: row.get(6)?,
                        failed_count: row.get(7)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rollups)
    }

    /// Start time of the newest rollup for a target and window.
    pub fn last_rollup_time(
        &self,
        target_id: i64,
        window_seconds: i64,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(time) FROM rollups WHERE target_id = ?1 AND window_seconds = ?2",
            params![target_id, window_seconds],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete rollups of one window size before a cutoff. Returns the row count.
    pub fn delete_rollups_before(
        &self,
        window_seconds: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM rollups WHERE window_seconds = ?1 AND time < ?2",
            params![window_seconds, format_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

fn row_time(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp {:?}", raw).into(),
        )
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
