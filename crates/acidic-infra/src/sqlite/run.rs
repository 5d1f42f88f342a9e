//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `acidic-core` using sqlx with split
//! read/write pools. The workflow graph, serialized job, accessors, and
//! stored error are JSON text columns. Find-or-create runs in one writer
//! transaction and relies on the `idempotency_key` UNIQUE constraint: an
//! insert that loses a race re-reads the winner's row.
//!
//! Writes made by a lock holder carry the holder's `locked_at` value in
//! their WHERE clause. The stored text is the RFC 3339 rendering of that
//! timestamp, so equality on the column is equality on the owner token.

use std::collections::BTreeMap;

use acidic_core::repository::run::{RunRepository, apply_attachment};
use acidic_types::error::RepositoryError;
use acidic_types::job::{IdempotencyKey, SerializedJob};
use acidic_types::run::{Attachment, NewRun, RunRecord, StoredError};
use acidic_types::workflow::{RecoveryPoint, WorkflowGraph};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Distinguish a missing run from a guarded write that matched no row.
    async fn missing_or_conflict(&self, run_id: &Uuid, conflict: impl Into<String>) -> RepositoryError {
        let exists = sqlx::query("SELECT 1 FROM acidic_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await;
        match exists {
            Ok(Some(_)) => RepositoryError::Conflict(conflict.into()),
            Ok(None) => RepositoryError::NotFound,
            Err(e) => query_error(e),
        }
    }

    /// Run `sql`, whose WHERE clause ends in `id = ? AND locked_at IS ?`.
    ///
    /// `binds` fill the placeholders before the WHERE clause.
    async fn update_if_locked_by(
        &self,
        sql: &str,
        run_id: &Uuid,
        lock: Option<&DateTime<Utc>>,
        binds: &[Option<String>],
    ) -> Result<(), RepositoryError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind.clone());
        }
        let result = query
            .bind(run_id.to_string())
            .bind(lock.map(format_datetime))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or_conflict(run_id, "run lock is held by another worker").await);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    idempotency_key: String,
    job_class: String,
    serialized_job: String,
    workflow: Option<String>,
    recovery_point: Option<String>,
    locked_at: Option<String>,
    last_run_at: Option<String>,
    enqueued_at: Option<String>,
    attr_accessors: String,
    error_object: Option<String>,
    staged: i64,
    awaited_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            job_class: row.try_get("job_class")?,
            serialized_job: row.try_get("serialized_job")?,
            workflow: row.try_get("workflow")?,
            recovery_point: row.try_get("recovery_point")?,
            locked_at: row.try_get("locked_at")?,
            last_run_at: row.try_get("last_run_at")?,
            enqueued_at: row.try_get("enqueued_at")?,
            attr_accessors: row.try_get("attr_accessors")?,
            error_object: row.try_get("error_object")?,
            staged: row.try_get("staged")?,
            awaited_by: row.try_get("awaited_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<RunRecord, RepositoryError> {
        let serialized_job: SerializedJob = from_json(&self.serialized_job, "serialized_job")?;
        let workflow: Option<WorkflowGraph> = self
            .workflow
            .as_deref()
            .map(|s| from_json(s, "workflow"))
            .transpose()?;
        let attr_accessors: BTreeMap<String, Value> = from_json(&self.attr_accessors, "attr_accessors")?;
        let error_object: Option<StoredError> = self
            .error_object
            .as_deref()
            .map(|s| from_json(s, "error_object"))
            .transpose()?;

        Ok(RunRecord {
            id: parse_uuid(&self.id)?,
            idempotency_key: IdempotencyKey::new(self.idempotency_key),
            job_class: self.job_class,
            serialized_job,
            workflow,
            recovery_point: self.recovery_point.map(RecoveryPoint::from),
            locked_at: self.locked_at.as_deref().map(parse_datetime).transpose()?,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
            enqueued_at: self.enqueued_at.as_deref().map(parse_datetime).transpose()?,
            attr_accessors,
            error_object,
            staged: self.staged != 0,
            awaited_by: self.awaited_by.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: Serialize + ?Sized>(value: &T, column: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {column}: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

async fn fetch_by_key(
    conn: &mut SqliteConnection,
    key: &IdempotencyKey,
) -> Result<Option<RunRecord>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM acidic_runs WHERE idempotency_key = ?")
        .bind(key.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;

    match row {
        Some(row) => {
            let r = RunRow::from_row(&row).map_err(query_error)?;
            Ok(Some(r.into_record()?))
        }
        None => Ok(None),
    }
}

/// Plain INSERT; the caller inspects the raw error for a uniqueness race.
async fn insert_run(conn: &mut SqliteConnection, run: &RunRecord) -> Result<Result<(), sqlx::Error>, RepositoryError> {
    let serialized_job = to_json(&run.serialized_job, "serialized_job")?;
    let workflow = run.workflow.as_ref().map(|w| to_json(w, "workflow")).transpose()?;
    let attr_accessors = to_json(&run.attr_accessors, "attr_accessors")?;
    let error_object = run.error_object.as_ref().map(|e| to_json(e, "error_object")).transpose()?;

    let result = sqlx::query(
        r#"INSERT INTO acidic_runs
           (id, idempotency_key, job_class, serialized_job, workflow, recovery_point,
            locked_at, last_run_at, enqueued_at, attr_accessors, error_object, staged,
            awaited_by, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(run.id.to_string())
    .bind(run.idempotency_key.as_str())
    .bind(&run.job_class)
    .bind(&serialized_job)
    .bind(&workflow)
    .bind(run.recovery_point.as_ref().map(|p| p.as_str().to_string()))
    .bind(run.locked_at.as_ref().map(format_datetime))
    .bind(run.last_run_at.as_ref().map(format_datetime))
    .bind(run.enqueued_at.as_ref().map(format_datetime))
    .bind(&attr_accessors)
    .bind(&error_object)
    .bind(run.staged as i64)
    .bind(run.awaited_by.map(|id| id.to_string()))
    .bind(format_datetime(&run.created_at))
    .bind(format_datetime(&run.updated_at))
    .execute(&mut *conn)
    .await;

    Ok(result.map(|_| ()))
}

/// Write back the fields the attach step may change.
async fn write_attachment(conn: &mut SqliteConnection, run: &RunRecord) -> Result<(), RepositoryError> {
    let workflow = run.workflow.as_ref().map(|w| to_json(w, "workflow")).transpose()?;
    let attr_accessors = to_json(&run.attr_accessors, "attr_accessors")?;

    sqlx::query(
        r#"UPDATE acidic_runs SET
             workflow = ?, recovery_point = ?, locked_at = ?, last_run_at = ?,
             attr_accessors = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&workflow)
    .bind(run.recovery_point.as_ref().map(|p| p.as_str().to_string()))
    .bind(run.locked_at.as_ref().map(format_datetime))
    .bind(run.last_run_at.as_ref().map(format_datetime))
    .bind(&attr_accessors)
    .bind(format_datetime(&run.updated_at))
    .bind(run.id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_or_attach(
        &self,
        new: NewRun,
        acquire_lock: bool,
        lock_timeout: Duration,
    ) -> Result<Attachment, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let (mut run, created) = match fetch_by_key(&mut *tx, &new.idempotency_key).await? {
            Some(run) => (run, false),
            None => {
                let fresh = new.clone().into_record(now);
                match insert_run(&mut *tx, &fresh).await? {
                    Ok(()) => (fresh, true),
                    Err(e) if is_unique_violation(&e) => {
                        tracing::debug!(key = %new.idempotency_key, "lost insert race, attaching to existing run");
                        let existing = fetch_by_key(&mut *tx, &new.idempotency_key)
                            .await?
                            .ok_or(RepositoryError::NotFound)?;
                        (existing, false)
                    }
                    Err(e) => return Err(query_error(e)),
                }
            }
        };

        let before = run.clone();
        let lock_acquired = apply_attachment(&mut run, &new, acquire_lock, lock_timeout, now);
        if run != before {
            write_attachment(&mut *tx, &run).await?;
        }

        tx.commit().await.map_err(query_error)?;

        if created {
            tracing::debug!(run_id = %run.id, key = %run.idempotency_key, staged = run.staged, "run created");
        }
        Ok(Attachment {
            run,
            created,
            lock_acquired,
        })
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM acidic_runs WHERE idempotency_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM acidic_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn advance_recovery_point(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        from: &RecoveryPoint,
        to: &RecoveryPoint,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE acidic_runs SET recovery_point = ?, updated_at = ?
               WHERE id = ? AND recovery_point = ? AND locked_at = ?"#,
        )
        .bind(to.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .bind(from.as_str())
        .bind(format_datetime(lock))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            let conflict = format!("recovery point is no longer '{from}' or the run lock changed hands");
            return Err(self.missing_or_conflict(run_id, conflict).await);
        }
        Ok(())
    }

    async fn record_accessor(
        &self,
        run_id: &Uuid,
        name: &str,
        value: &Value,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query("SELECT attr_accessors FROM acidic_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?
            .ok_or(RepositoryError::NotFound)?;
        let current: String = row.try_get("attr_accessors").map_err(query_error)?;

        let mut accessors: BTreeMap<String, Value> = from_json(&current, "attr_accessors")?;
        accessors.insert(name.to_string(), value.clone());

        sqlx::query("UPDATE acidic_runs SET attr_accessors = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(&accessors, "attr_accessors")?)
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn store_error(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        error: &StoredError,
    ) -> Result<(), RepositoryError> {
        self.update_if_locked_by(
            "UPDATE acidic_runs SET error_object = ?, updated_at = ? WHERE id = ? AND locked_at IS ?",
            run_id,
            Some(lock),
            &[
                Some(to_json(error, "error_object")?),
                Some(format_datetime(&Utc::now())),
            ],
        )
        .await
    }

    async fn release_lock(&self, run_id: &Uuid, lock: &DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update_if_locked_by(
            "UPDATE acidic_runs SET locked_at = NULL, updated_at = ? WHERE id = ? AND locked_at IS ?",
            run_id,
            Some(lock),
            &[Some(format_datetime(&Utc::now()))],
        )
        .await
    }

    async fn finish(&self, run_id: &Uuid, lock: Option<&DateTime<Utc>>) -> Result<(), RepositoryError> {
        self.update_if_locked_by(
            r#"UPDATE acidic_runs SET recovery_point = ?, locked_at = NULL, updated_at = ?
               WHERE id = ? AND locked_at IS ?"#,
            run_id,
            lock,
            &[
                Some(RecoveryPoint::Finished.as_str().to_string()),
                Some(format_datetime(&Utc::now())),
            ],
        )
        .await
    }

    async fn mark_enqueued(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            "UPDATE acidic_runs SET enqueued_at = COALESCE(enqueued_at, ?), updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_awaiting(&self, run_id: &Uuid) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM acidic_runs WHERE awaited_by = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_record()?);
        }
        Ok(runs)
    }
}
