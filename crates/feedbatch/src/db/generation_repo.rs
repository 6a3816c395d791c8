//! Generation log: one row per feed generation run.
//!
//! A row with status `running` is the feed's Generation Lock. It is created
//! inside an immediate (write-locked) transaction so two concurrent
//! `acquire_lock` calls cannot both observe "no running generation".

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{Database, DatabaseError};

/// Lifecycle status of a generation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Running,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Running => "running",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }
}

impl FromSql for GenerationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "running" => Ok(GenerationStatus::Running),
            "completed" => Ok(GenerationStatus::Completed),
            "failed" => Ok(GenerationStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown generation status '{}'", other).into(),
            )),
        }
    }
}

/// A generation row from the database.
#[derive(Debug, Clone)]
pub struct GenerationRow {
    pub id: i64,
    pub feed_id: String,
    pub job_id: String,
    pub status: GenerationStatus,
    pub total_products: u64,
    pub processed_count: u64,
    pub product_count: u64,
    pub error_count: u64,
    pub file_size: Option<u64>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Heartbeat, refreshed after every processed batch.
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationRow {
    /// A fresh running row; `id` is assigned on insert.
    pub fn running(feed_id: &str, job_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            feed_id: feed_id.to_string(),
            job_id: job_id.to_string(),
            status: GenerationStatus::Running,
            total_products: 0,
            processed_count: 0,
            product_count: 0,
            error_count: 0,
            file_size: None,
            message: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// True when the row is running and its heartbeat is older than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status != GenerationStatus::Running {
            return false;
        }
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map(|age| age > timeout).unwrap_or(false)
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            feed_id: row.get("feed_id")?,
            job_id: row.get("job_id")?,
            status: row.get("status")?,
            total_products: row.get::<_, i64>("total_products")? as u64,
            processed_count: row.get::<_, i64>("processed_count")? as u64,
            product_count: row.get::<_, i64>("product_count")? as u64,
            error_count: row.get::<_, i64>("error_count")? as u64,
            file_size: row.get::<_, Option<i64>>("file_size")?.map(|v| v as u64),
            message: row.get("message")?,
            started_at: timestamp_column(row, "started_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
            finished_at: match row.get::<_, Option<String>>("finished_at")? {
                Some(_) => Some(timestamp_column(row, "finished_at")?),
                None => None,
            },
        })
    }
}

fn timestamp_column(row: &Row<'_>, name: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Result of trying to take a feed's Generation Lock.
#[derive(Debug, Clone)]
pub enum LockOutcome {
    /// The caller now owns the generation. `reclaimed` is the stale row that
    /// was failed to make room, if any.
    Acquired {
        row: GenerationRow,
        reclaimed: Option<GenerationRow>,
    },
    /// A fresh generation is already running; nothing was written.
    Held(GenerationRow),
}

fn insert_row(conn: &Connection, row: &GenerationRow) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO feed_generations (feed_id, job_id, status, total_products, processed_count,
         product_count, error_count, file_size, message, started_at, updated_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            row.feed_id,
            row.job_id,
            row.status.as_str(),
            row.total_products as i64,
            row.processed_count as i64,
            row.product_count as i64,
            row.error_count as i64,
            row.file_size.map(|v| v as i64),
            row.message,
            format_timestamp(row.started_at),
            format_timestamp(row.updated_at),
            row.finished_at.map(format_timestamp),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn select_running(conn: &Connection, feed_id: &str) -> Result<Option<GenerationRow>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM feed_generations WHERE feed_id = ?1 AND status = 'running'
         ORDER BY id DESC LIMIT 1",
        params![feed_id],
        GenerationRow::from_row,
    )
    .optional()
    .map_err(DatabaseError::from)
}

fn fail_running(
    conn: &Connection,
    id: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE feed_generations SET status = 'failed', message = ?2, updated_at = ?3,
         finished_at = ?3 WHERE id = ?1 AND status = 'running'",
        params![id, message, format_timestamp(now)],
    )?;
    Ok(changed > 0)
}

/// Takes the Generation Lock for `feed_id` on behalf of `job_id`.
///
/// A running row whose heartbeat is older than `stale_timeout` is failed in
/// the same transaction and replaced. A fresh running row is returned as
/// `LockOutcome::Held` and the transaction is rolled back.
pub fn acquire_lock(
    db: &Database,
    feed_id: &str,
    job_id: &str,
    stale_timeout: Duration,
) -> Result<LockOutcome, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let mut reclaimed = None;
        if let Some(existing) = select_running(&tx, feed_id)? {
            if !existing.is_stale(now, stale_timeout) {
                tx.rollback()?;
                return Ok(LockOutcome::Held(existing));
            }
            log::warn!(
                "Reclaiming stale generation {} for feed {} (job {}, last heartbeat {})",
                existing.id,
                feed_id,
                existing.job_id,
                existing.updated_at
            );
            fail_running(&tx, existing.id, "Stale generation reclaimed", now)?;
            reclaimed = Some(existing);
        }

        let mut row = GenerationRow::running(feed_id, job_id, now);
        row.id = insert_row(&tx, &row)?;
        tx.commit()?;

        Ok(LockOutcome::Acquired { row, reclaimed })
    })
}

/// Inserts a row verbatim. Used to import history and to seed tests.
pub fn insert(db: &Database, row: &GenerationRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| insert_row(conn, row))
}

/// Finds a generation by its ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<GenerationRow>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM feed_generations WHERE id = ?1",
            params![id],
            GenerationRow::from_row,
        )
        .optional()
        .map_err(DatabaseError::from)
    })
}

/// Finds the running generation of a feed, if any.
pub fn find_running(db: &Database, feed_id: &str) -> Result<Option<GenerationRow>, DatabaseError> {
    db.with_conn(|conn| select_running(conn, feed_id))
}

/// Fails every running generation of `feed_id` whose heartbeat is older than
/// `stale_timeout`. Returns the rows that were failed.
pub fn fail_stale(
    db: &Database,
    feed_id: &str,
    stale_timeout: Duration,
) -> Result<Vec<GenerationRow>, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let running: Vec<GenerationRow> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM feed_generations WHERE feed_id = ?1 AND status = 'running'",
            )?;
            let rows = stmt
                .query_map(params![feed_id], GenerationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut failed = Vec::new();
        for row in running {
            if row.is_stale(now, stale_timeout)
                && fail_running(&tx, row.id, "Generation timed out", now)?
            {
                failed.push(row);
            }
        }

        tx.commit()?;
        Ok(failed)
    })
}

/// Refreshes progress counters and the heartbeat of a running generation.
/// Returns false if the row is no longer running.
pub fn update_progress(
    db: &Database,
    id: i64,
    total_products: u64,
    processed_count: u64,
    product_count: u64,
    error_count: u64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE feed_generations SET total_products = ?2, processed_count = ?3,
             product_count = ?4, error_count = ?5, updated_at = ?6
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                total_products as i64,
                processed_count as i64,
                product_count as i64,
                error_count as i64,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Marks a running generation completed, releasing the feed's lock.
pub fn mark_completed(
    db: &Database,
    id: i64,
    product_count: u64,
    error_count: u64,
    file_size: u64,
    message: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let now = format_timestamp(Utc::now());
        let changed = conn.execute(
            "UPDATE feed_generations SET status = 'completed', product_count = ?2,
             error_count = ?3, file_size = ?4, message = ?5, updated_at = ?6, finished_at = ?6
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                product_count as i64,
                error_count as i64,
                file_size as i64,
                message,
                now,
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Marks a running generation failed, releasing the feed's lock.
/// Returns false if it was already terminal.
pub fn mark_failed(db: &Database, id: i64, message: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| fail_running(conn, id, message, Utc::now()))
}

/// Appends error messages to a generation's error log.
pub fn append_errors(db: &Database, id: i64, messages: &[String]) -> Result<(), DatabaseError> {
    if messages.is_empty() {
        return Ok(());
    }
    db.with_conn_mut(|conn| {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO generation_errors (generation_id, message, created_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            let now = format_timestamp(Utc::now());
            for message in messages {
                stmt.execute(params![id, message, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

/// Lists a generation's error log in insertion order.
pub fn list_errors(db: &Database, id: i64) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT message FROM generation_errors WHERE generation_id = ?1 ORDER BY id")?;
        let messages = stmt
            .query_map(params![id], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(messages)
    })
}

/// Most recent generations of a feed, newest first.
pub fn history(db: &Database, feed_id: &str, limit: u64) -> Result<Vec<GenerationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM feed_generations WHERE feed_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![feed_id, limit as i64], GenerationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn aged_row(feed_id: &str, job_id: &str, age_secs: i64) -> GenerationRow {
        let then = Utc::now() - chrono::Duration::seconds(age_secs);
        GenerationRow::running(feed_id, job_id, then)
    }

    const TIMEOUT: Duration = Duration::from_secs(600);

    #[test]
    fn test_acquire_on_empty_feed() {
        let db = test_db();
        let outcome = acquire_lock(&db, "feed-1", "job-1", TIMEOUT).unwrap();
        match outcome {
            LockOutcome::Acquired { row, reclaimed } => {
                assert!(row.id > 0);
                assert_eq!(row.job_id, "job-1");
                assert_eq!(row.status, GenerationStatus::Running);
                assert!(reclaimed.is_none());
            }
            LockOutcome::Held(_) => panic!("expected Acquired"),
        }
    }

    #[test]
    fn test_acquire_held_by_fresh_generation() {
        let db = test_db();
        acquire_lock(&db, "feed-1", "job-1", TIMEOUT).unwrap();

        let outcome = acquire_lock(&db, "feed-1", "job-2", TIMEOUT).unwrap();
        match outcome {
            LockOutcome::Held(existing) => assert_eq!(existing.job_id, "job-1"),
            LockOutcome::Acquired { .. } => panic!("expected Held"),
        }

        // Nothing was written for the loser.
        let rows = history(&db, "feed-1", 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_acquire_reclaims_stale_generation() {
        let db = test_db();
        let stale_id = insert(&db, &aged_row("feed-1", "old-job", 3600)).unwrap();

        let outcome = acquire_lock(&db, "feed-1", "new-job", TIMEOUT).unwrap();
        match outcome {
            LockOutcome::Acquired { row, reclaimed } => {
                assert_eq!(row.job_id, "new-job");
                assert_eq!(reclaimed.unwrap().id, stale_id);
            }
            LockOutcome::Held(_) => panic!("expected Acquired"),
        }

        let old = find_by_id(&db, stale_id).unwrap().unwrap();
        assert_eq!(old.status, GenerationStatus::Failed);
        assert!(old.finished_at.is_some());
        assert_eq!(find_running(&db, "feed-1").unwrap().unwrap().job_id, "new-job");
    }

    #[test]
    fn test_locks_are_per_feed() {
        let db = test_db();
        acquire_lock(&db, "feed-1", "job-1", TIMEOUT).unwrap();
        let outcome = acquire_lock(&db, "feed-2", "job-2", TIMEOUT).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired { .. }));
    }

    #[test]
    fn test_mark_failed_releases_lock() {
        let db = test_db();
        let LockOutcome::Acquired { row, .. } = acquire_lock(&db, "f", "j1", TIMEOUT).unwrap()
        else {
            panic!("expected Acquired");
        };

        assert!(mark_failed(&db, row.id, "cancelled").unwrap());
        // Already terminal.
        assert!(!mark_failed(&db, row.id, "again").unwrap());

        let outcome = acquire_lock(&db, "f", "j2", TIMEOUT).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired { .. }));
        let failed = find_by_id(&db, row.id).unwrap().unwrap();
        assert_eq!(failed.message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_mark_completed_records_metrics() {
        let db = test_db();
        let LockOutcome::Acquired { row, .. } = acquire_lock(&db, "f", "j1", TIMEOUT).unwrap()
        else {
            panic!("expected Acquired");
        };

        assert!(mark_completed(&db, row.id, 240, 10, 4096, "done").unwrap());
        let done = find_by_id(&db, row.id).unwrap().unwrap();
        assert_eq!(done.status, GenerationStatus::Completed);
        assert_eq!(done.product_count, 240);
        assert_eq!(done.error_count, 10);
        assert_eq!(done.file_size, Some(4096));
        assert!(find_running(&db, "f").unwrap().is_none());
    }

    #[test]
    fn test_update_progress_only_touches_running_rows() {
        let db = test_db();
        let LockOutcome::Acquired { row, .. } = acquire_lock(&db, "f", "j1", TIMEOUT).unwrap()
        else {
            panic!("expected Acquired");
        };

        assert!(update_progress(&db, row.id, 250, 100, 98, 2).unwrap());
        let updated = find_by_id(&db, row.id).unwrap().unwrap();
        assert_eq!(updated.processed_count, 100);
        assert_eq!(updated.total_products, 250);
        assert!(updated.updated_at >= row.updated_at);

        mark_failed(&db, row.id, "boom").unwrap();
        assert!(!update_progress(&db, row.id, 250, 200, 196, 4).unwrap());
    }

    #[test]
    fn test_fail_stale_only_fails_old_rows() {
        let db = test_db();
        let old = insert(&db, &aged_row("f", "old", 7200)).unwrap();
        let fresh_other_feed = insert(&db, &aged_row("g", "other", 7200)).unwrap();

        let failed = fail_stale(&db, "f", TIMEOUT).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, old);

        assert_eq!(
            find_by_id(&db, old).unwrap().unwrap().status,
            GenerationStatus::Failed
        );
        assert_eq!(
            find_by_id(&db, fresh_other_feed).unwrap().unwrap().status,
            GenerationStatus::Running
        );

        insert(&db, &aged_row("f", "fresh", 5)).unwrap();
        assert!(fail_stale(&db, "f", TIMEOUT).unwrap().is_empty());
    }

    #[test]
    fn test_errors_are_appended_in_order() {
        let db = test_db();
        let id = insert(&db, &aged_row("f", "j", 0)).unwrap();

        append_errors(&db, id, &["first".to_string()]).unwrap();
        append_errors(&db, id, &[]).unwrap();
        append_errors(&db, id, &["second".to_string(), "third".to_string()]).unwrap();

        assert_eq!(list_errors(&db, id).unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_history_newest_first_with_limit() {
        let db = test_db();
        for i in 0..5 {
            let mut row = aged_row("f", &format!("j{}", i), 0);
            row.status = GenerationStatus::Completed;
            insert(&db, &row).unwrap();
        }

        let rows = history(&db, "f", 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].job_id, "j4");
        assert_eq!(rows[2].job_id, "j2");
    }

    #[test]
    fn test_is_stale() {
        let row = aged_row("f", "j", 120);
        assert!(row.is_stale(Utc::now(), Duration::from_secs(60)));
        assert!(!row.is_stale(Utc::now(), Duration::from_secs(600)));

        let mut done = row.clone();
        done.status = GenerationStatus::Completed;
        assert!(!done.is_stale(Utc::now(), Duration::from_secs(60)));
    }
}
