//! SQLite storage layer for the server engine.
//!
//! Two tables back the streak engine:
//!
//! - `activity_log`: append-only event log, one row per submitted activity.
//!   Duplicates are legal here; idempotence lives in the transition rules, not
//!   in log deduplication.
//! - `streak_records`: one row per user holding the derived streak state plus a
//!   `version` counter. Every write is a compare-and-swap on `version`, which
//!   gives the per-user write serialization the engine requires: a transition
//!   and a sweep can never both commit against the same prior state.
//!
//! Calendar days are stored as ISO-8601 TEXT and `active_days` as a JSON array,
//! so the persisted shape is readable with any SQLite client.

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::calendar::CalendarDay;
use crate::model::{ActivityEvent, StreakRecord};

/// A record read together with its concurrency token.
///
/// The version must be handed back to [`Storage::update_record`]; a stale
/// version means another writer committed first and the caller must re-read.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    pub record: StreakRecord,
    pub version: i64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:ember.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                activity_type TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient per-user history queries
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_activity_log_user_ts
            ON activity_log(user_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS streak_records (
                user_id TEXT PRIMARY KEY,
                current_streak INTEGER NOT NULL,
                best_streak INTEGER NOT NULL,
                last_activity_date TEXT,
                streak_start_date TEXT,
                is_at_risk INTEGER NOT NULL,
                freezes_available INTEGER NOT NULL,
                freeze_active INTEGER NOT NULL,
                active_days TEXT NOT NULL,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one activity event to the log.
    ///
    /// The log accepts duplicates by design; derived state is protected by the
    /// transition rules, not by this table.
    pub async fn insert_activity(&self, event: &ActivityEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (user_id, ts, activity_type)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&event.user_id)
        .bind(event.occurred_at.timestamp())
        .bind(&event.activity_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of logged events for a user.
    pub async fn activity_count(&self, user_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as n FROM activity_log WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("n"))
    }

    /// Timestamp of the most recent logged event for a user, if any.
    pub async fn last_activity_at(&self, user_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(ts) as last_ts FROM activity_log WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let last_ts: Option<i64> = row.get("last_ts");
        Ok(last_ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }

    /// Insert a zeroed record for a new user.
    ///
    /// Idempotent: re-registering an existing user leaves their record alone
    /// and returns `false`.
    pub async fn create_record(&self, user_id: &str) -> anyhow::Result<bool> {
        let zero = StreakRecord::new();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO streak_records
                (user_id, current_streak, best_streak, last_activity_date,
                 streak_start_date, is_at_risk, freezes_available, freeze_active,
                 active_days, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(user_id)
        .bind(i64::from(zero.current_streak))
        .bind(i64::from(zero.best_streak))
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(0_i64)
        .bind(0_i64)
        .bind(0_i64)
        .bind(encode_active_days(&zero)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetch a user's record with its version, or `None` if never registered.
    pub async fn get_record(&self, user_id: &str) -> anyhow::Result<Option<VersionedRecord>> {
        let row = sqlx::query(
            r#"
            SELECT current_streak, best_streak, last_activity_date,
                   streak_start_date, is_at_risk, freezes_available,
                   freeze_active, active_days, version
            FROM streak_records
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode_record(&r)).transpose()
    }

    /// Compare-and-swap write of a user's record.
    ///
    /// Commits only if the stored version still equals `expected_version`.
    /// Returns `false` on a version mismatch (concurrent writer won); the
    /// caller re-reads and retries.
    pub async fn update_record(
        &self,
        user_id: &str,
        record: &StreakRecord,
        expected_version: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE streak_records
            SET current_streak = ?, best_streak = ?, last_activity_date = ?,
                streak_start_date = ?, is_at_risk = ?, freezes_available = ?,
                freeze_active = ?, active_days = ?, version = version + 1
            WHERE user_id = ? AND version = ?
            "#,
        )
        .bind(i64::from(record.current_streak))
        .bind(i64::from(record.best_streak))
        .bind(record.last_activity_date.map(|d| d.to_string()))
        .bind(record.streak_start_date.map(|d| d.to_string()))
        .bind(i64::from(record.is_at_risk))
        .bind(i64::from(record.freezes_available))
        .bind(i64::from(record.freeze_active))
        .bind(encode_active_days(record)?)
        .bind(user_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// All records with a positive streak, for the sweep jobs.
    ///
    /// Zeroed records can never become at-risk and have nothing to reset, so
    /// both sweeps share this scan.
    pub async fn streak_holders(&self) -> anyhow::Result<Vec<(String, VersionedRecord)>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, current_streak, best_streak, last_activity_date,
                   streak_start_date, is_at_risk, freezes_available,
                   freeze_active, active_days, version
            FROM streak_records
            WHERE current_streak > 0
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let user_id: String = r.get("user_id");
                Ok((user_id, decode_record(r)?))
            })
            .collect()
    }
}

fn encode_active_days(record: &StreakRecord) -> anyhow::Result<String> {
    let days: Vec<CalendarDay> = record.active_days.iter().copied().collect();
    serde_json::to_string(&days).context("encoding active_days")
}

fn decode_record(row: &SqliteRow) -> anyhow::Result<VersionedRecord> {
    let last_activity_date: Option<String> = row.get("last_activity_date");
    let streak_start_date: Option<String> = row.get("streak_start_date");
    let active_days_json: String = row.get("active_days");

    let active_days: Vec<CalendarDay> =
        serde_json::from_str(&active_days_json).context("decoding active_days")?;

    let record = StreakRecord {
        current_streak: u32::try_from(row.get::<i64, _>("current_streak"))?,
        best_streak: u32::try_from(row.get::<i64, _>("best_streak"))?,
        last_activity_date: last_activity_date
            .map(|d| d.parse().context("parsing last_activity_date"))
            .transpose()?,
        streak_start_date: streak_start_date
            .map(|d| d.parse().context("parsing streak_start_date"))
            .transpose()?,
        is_at_risk: row.get::<i64, _>("is_at_risk") != 0,
        freezes_available: u32::try_from(row.get::<i64, _>("freezes_available"))?,
        freeze_active: row.get::<i64, _>("freeze_active") != 0,
        active_days: active_days.into_iter().collect(),
    };

    Ok(VersionedRecord {
        record,
        version: row.get("version"),
    })
}
