//! Conversion record store: the single source of truth for attempt state.
//!
//! One row per submission and one per (paper id, version), mutated only
//! through the guarded operations here. The design accepts that *anything*
//! can race: two workers converting the same identifier, an author
//! re-upload racing a running conversion, a slow attempt finishing after a
//! newer one already superseded it. Rather than distributed locking, the
//! store resolves every race at commit time:
//!
//! * [`ConversionStore::start`] is an upsert. A newer attempt overwrites an
//!   older in-progress or failed row in place, capturing a fresh checksum,
//!   engine version, and start time.
//! * [`ConversionStore::mark_success`] and [`mark_failure`] only commit if
//!   the row still carries the checksum and engine version this attempt
//!   started with, and the row is not already `success`. A stale attempt
//!   finishing late fails the equality guard and is discarded, so it can
//!   never clobber a newer attempt's result.
//!
//! The guard compares (checksum, engine version), never timestamps or
//! attempt ids: two attempts over identical input are interchangeable, and
//! what matters is only whether a result corresponds to the row's
//! *currently active* expectations.
//!
//! Every operation runs as one transaction under an explicit
//! [`RetryPolicy`], so transient connectivity trouble is absorbed here and
//! surfaces to the orchestrator only as [`StoreError::Unavailable`] once
//! the budget is spent.
//!
//! [`mark_failure`]: ConversionStore::mark_failure

pub mod retry;

use crate::error::StoreError;
use crate::payload::RecordKey;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub use retry::RetryPolicy;

/// Conversion state of a record. Stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    InProgress = 0,
    Success = 1,
    Failure = 2,
}

impl ConversionStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::InProgress),
            1 => Some(Self::Success),
            2 => Some(Self::Failure),
            _ => None,
        }
    }
}

/// One conversion record, as read back from either table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub status: ConversionStatus,
    pub engine_version: String,
    pub source_checksum: String,
    /// Epoch seconds when the active attempt called `start`.
    pub start_time: i64,
    /// Epoch seconds when the row reached success or failure.
    /// `None` exactly while the row is in progress.
    pub end_time: Option<i64>,
}

/// Record store over SQLite via sqlx.
///
/// Constructed once and passed by reference to each orchestrator, never
/// reached through a global.
#[derive(Debug, Clone)]
pub struct ConversionStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

/// Current epoch seconds. A pre-epoch clock collapses to 0 rather than
/// panicking; record timestamps are informational ordering, not identity.
pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ConversionStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Open (creating if missing) a SQLite database file.
    pub async fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable {
                attempts: 1,
                source: e,
            })?;
        let store = Self::new(pool, retry);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the two record tables if they do not exist.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.retry
            .run("init_schema", || async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversion_sub (
                        submission_id    INTEGER PRIMARY KEY,
                        status           INTEGER NOT NULL,
                        engine_version   TEXT    NOT NULL,
                        source_checksum  TEXT    NOT NULL,
                        start_time       INTEGER NOT NULL,
                        end_time         INTEGER
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversion_doc (
                        paper_id         TEXT    NOT NULL,
                        document_version INTEGER NOT NULL,
                        status           INTEGER NOT NULL,
                        engine_version   TEXT    NOT NULL,
                        source_checksum  TEXT    NOT NULL,
                        start_time       INTEGER NOT NULL,
                        end_time         INTEGER,
                        publish_time     INTEGER,
                        PRIMARY KEY (paper_id, document_version)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;
                Ok(())
            })
            .await
    }

    /// Begin (or supersede) an attempt: create the row if absent, otherwise
    /// overwrite it in place with fresh values and `end_time = NULL`.
    ///
    /// Never fails on "already exists". That is the point: a newer attempt
    /// superseding an older in-progress or failed one is the normal path,
    /// and the overwrite is what invalidates the older attempt's guard.
    pub async fn start(
        &self,
        key: &RecordKey,
        checksum: &str,
        engine_version: &str,
    ) -> Result<(), StoreError> {
        let now = now_epoch();
        self.retry
            .run("start", || async {
                match key {
                    RecordKey::Submission(id) => {
                        sqlx::query(
                            r#"
                            INSERT INTO conversion_sub
                                (submission_id, status, engine_version, source_checksum, start_time, end_time)
                            VALUES (?, 0, ?, ?, ?, NULL)
                            ON CONFLICT(submission_id) DO UPDATE SET
                                status = 0,
                                engine_version = excluded.engine_version,
                                source_checksum = excluded.source_checksum,
                                start_time = excluded.start_time,
                                end_time = NULL
                            "#,
                        )
                        .bind(id)
                        .bind(engine_version)
                        .bind(checksum)
                        .bind(now)
                        .execute(&self.pool)
                        .await?;
                    }
                    RecordKey::Document { paper_id, version } => {
                        sqlx::query(
                            r#"
                            INSERT INTO conversion_doc
                                (paper_id, document_version, status, engine_version, source_checksum, start_time, end_time, publish_time)
                            VALUES (?, ?, 0, ?, ?, ?, NULL, NULL)
                            ON CONFLICT(paper_id, document_version) DO UPDATE SET
                                status = 0,
                                engine_version = excluded.engine_version,
                                source_checksum = excluded.source_checksum,
                                start_time = excluded.start_time,
                                end_time = NULL,
                                publish_time = NULL
                            "#,
                        )
                        .bind(paper_id)
                        .bind(version)
                        .bind(engine_version)
                        .bind(checksum)
                        .bind(now)
                        .execute(&self.pool)
                        .await?;
                    }
                }
                Ok(())
            })
            .await?;
        info!("Conversion started for {}", key);
        Ok(())
    }

    /// Commit success for this attempt if, and only if, the row still
    /// matches the attempt's (checksum, engine version) and is not already
    /// `success`.
    ///
    /// The returned bool is the tie-break: `true` means this attempt won
    /// and its output is current; `false` means a newer attempt superseded
    /// it (or success was already recorded) and the output must be
    /// discarded. A missing row is [`StoreError::RecordNotFound`]: success
    /// without a prior `start` is a programming error, not a race.
    pub async fn mark_success(
        &self,
        key: &RecordKey,
        checksum: &str,
        engine_version: &str,
    ) -> Result<bool, StoreError> {
        let won = self
            .finalize(key, checksum, engine_version, ConversionStatus::Success)
            .await?;
        if won {
            info!("Conversion succeeded for {}", key);
        } else {
            info!("Superseded success for {} discarded", key);
        }
        Ok(won)
    }

    /// Record failure under the same guard as success.
    ///
    /// No result is consulted: a superseded attempt's failure is silently
    /// discarded, and the guard guarantees a failure can never downgrade a
    /// row a newer attempt already marked `success`.
    pub async fn mark_failure(
        &self,
        key: &RecordKey,
        checksum: &str,
        engine_version: &str,
    ) -> Result<(), StoreError> {
        let wrote = self
            .finalize(key, checksum, engine_version, ConversionStatus::Failure)
            .await?;
        if wrote {
            info!("Conversion failed for {}", key);
        } else {
            info!("Superseded failure for {} discarded", key);
        }
        Ok(())
    }

    /// Guarded finalisation shared by success and failure: read the row,
    /// check the guard, conditionally write, all in one transaction.
    async fn finalize(
        &self,
        key: &RecordKey,
        checksum: &str,
        engine_version: &str,
        status: ConversionStatus,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let outcome = self
            .retry
            .run("finalize", || async {
                let mut tx = self.pool.begin().await?;

                let row = match key {
                    RecordKey::Submission(id) => sqlx::query(
                        "SELECT status, source_checksum, engine_version \
                         FROM conversion_sub WHERE submission_id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?,
                    RecordKey::Document { paper_id, version } => sqlx::query(
                        "SELECT status, source_checksum, engine_version \
                         FROM conversion_doc WHERE paper_id = ? AND document_version = ?",
                    )
                    .bind(paper_id)
                    .bind(version)
                    .fetch_optional(&mut *tx)
                    .await?,
                };

                let Some(row) = row else {
                    return Ok(None); // no record: caller maps to RecordNotFound
                };

                let row_status: i64 = row.get("status");
                let row_checksum: String = row.get("source_checksum");
                let row_engine: String = row.get("engine_version");

                let guard_holds = row_status != ConversionStatus::Success.as_i64()
                    && row_checksum == checksum
                    && row_engine == engine_version;
                if !guard_holds {
                    tx.commit().await?;
                    return Ok(Some(false));
                }

                match key {
                    RecordKey::Submission(id) => {
                        sqlx::query(
                            "UPDATE conversion_sub SET status = ?, end_time = ? \
                             WHERE submission_id = ?",
                        )
                        .bind(status.as_i64())
                        .bind(now)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    RecordKey::Document { paper_id, version } => {
                        sqlx::query(
                            "UPDATE conversion_doc SET status = ?, end_time = ? \
                             WHERE paper_id = ? AND document_version = ?",
                        )
                        .bind(status.as_i64())
                        .bind(now)
                        .bind(paper_id)
                        .bind(version)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                tx.commit().await?;
                Ok(Some(true))
            })
            .await?;

        outcome.ok_or_else(|| StoreError::RecordNotFound {
            key: key.to_string(),
        })
    }

    /// Whether any record exists for the key, in any status.
    ///
    /// Used by batch dispatch to skip identifiers that were already tried
    /// (at-least-once delivery dedup); it deliberately does not look at the
    /// status, since even a failed prior attempt means "do not re-enqueue".
    pub async fn has_any_row(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.retry
            .run("has_any_row", || async {
                let exists: i64 = match key {
                    RecordKey::Submission(id) => {
                        sqlx::query_scalar(
                            "SELECT EXISTS(SELECT 1 FROM conversion_sub WHERE submission_id = ?)",
                        )
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await?
                    }
                    RecordKey::Document { paper_id, version } => sqlx::query_scalar(
                        "SELECT EXISTS(SELECT 1 FROM conversion_doc \
                         WHERE paper_id = ? AND document_version = ?)",
                    )
                    .bind(paper_id)
                    .bind(version)
                    .fetch_one(&self.pool)
                    .await?,
                };
                Ok(exists != 0)
            })
            .await
    }

    /// Read a record without touching it. The poll path for status
    /// visibility, and the publish orchestrator's eligibility check.
    pub async fn fetch(&self, key: &RecordKey) -> Result<Option<ConversionRecord>, StoreError> {
        self.retry
            .run("fetch", || async {
                let row = match key {
                    RecordKey::Submission(id) => sqlx::query(
                        "SELECT status, engine_version, source_checksum, start_time, end_time \
                         FROM conversion_sub WHERE submission_id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?,
                    RecordKey::Document { paper_id, version } => sqlx::query(
                        "SELECT status, engine_version, source_checksum, start_time, end_time \
                         FROM conversion_doc WHERE paper_id = ? AND document_version = ?",
                    )
                    .bind(paper_id)
                    .bind(version)
                    .fetch_optional(&self.pool)
                    .await?,
                };
                Ok(row.map(|row| {
                    let status: i64 = row.get("status");
                    ConversionRecord {
                        status: ConversionStatus::from_i64(status)
                            .unwrap_or(ConversionStatus::Failure),
                        engine_version: row.get("engine_version"),
                        source_checksum: row.get("source_checksum"),
                        start_time: row.get("start_time"),
                        end_time: row.get("end_time"),
                    }
                }))
            })
            .await
    }

    /// Copy a successful submission record into the permanent document
    /// table with `status = success` and a publish timestamp.
    ///
    /// Idempotent: a repeat publish of the same (paper id, version) is a
    /// no-op, reported by the `false` return rather than a duplicate-key
    /// error.
    pub async fn publish_document(
        &self,
        paper_id: &str,
        version: i64,
        from: &ConversionRecord,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let inserted = self
            .retry
            .run("publish_document", || async {
                let result = sqlx::query(
                    r#"
                    INSERT INTO conversion_doc
                        (paper_id, document_version, status, engine_version, source_checksum, start_time, end_time, publish_time)
                    VALUES (?, ?, 1, ?, ?, ?, ?, ?)
                    ON CONFLICT(paper_id, document_version) DO NOTHING
                    "#,
                )
                .bind(paper_id)
                .bind(version)
                .bind(&from.engine_version)
                .bind(&from.source_checksum)
                .bind(from.start_time)
                .bind(from.end_time)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;
        if inserted {
            info!("Published record written for {paper_id}v{version}");
        } else {
            info!("Publish record for {paper_id}v{version} already present");
        }
        Ok(inserted)
    }
}
