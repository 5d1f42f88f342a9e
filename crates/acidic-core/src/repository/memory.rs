//! In-memory `RunRepository` backed by `DashMap`.
//!
//! Suitable for tests and for embedding the engine in a single process.
//! Find-or-create is atomic per key through the map's entry API, which plays
//! the role of the storage-level uniqueness constraint.

use acidic_types::error::RepositoryError;
use acidic_types::job::IdempotencyKey;
use acidic_types::run::{Attachment, NewRun, RunRecord, StoredError};
use acidic_types::workflow::RecoveryPoint;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::run::{RunRepository, apply_attachment};

/// DashMap-backed run store.
#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<IdempotencyKey, RunRecord>,
    keys: DashMap<Uuid, IdempotencyKey>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Overwrite a stored record wholesale (operator repair, tests).
    pub fn replace(&self, run: RunRecord) {
        self.keys.insert(run.id, run.idempotency_key.clone());
        self.runs.insert(run.idempotency_key.clone(), run);
    }

    fn update<F>(&self, run_id: &Uuid, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut RunRecord) -> Result<(), RepositoryError>,
    {
        let key = self
            .keys
            .get(run_id)
            .map(|k| k.value().clone())
            .ok_or(RepositoryError::NotFound)?;
        let mut run = self.runs.get_mut(&key).ok_or(RepositoryError::NotFound)?;
        f(&mut run)?;
        run.updated_at = Utc::now();
        Ok(())
    }
}

fn ensure_lock(run: &RunRecord, lock: Option<&DateTime<Utc>>) -> Result<(), RepositoryError> {
    if run.holds_lock(lock) {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(
            "run lock is held by another worker".to_string(),
        ))
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_or_attach(
        &self,
        new: NewRun,
        acquire_lock: bool,
        lock_timeout: Duration,
    ) -> Result<Attachment, RepositoryError> {
        let now = Utc::now();
        let mut created = false;

        let mut entry = self
            .runs
            .entry(new.idempotency_key.clone())
            .or_insert_with(|| {
                created = true;
                new.clone().into_record(now)
            });

        if created {
            self.keys.insert(entry.id, entry.idempotency_key.clone());
        }

        let lock_acquired = apply_attachment(&mut entry, &new, acquire_lock, lock_timeout, now);

        Ok(Attachment {
            run: entry.clone(),
            created,
            lock_acquired,
        })
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(key).map(|r| r.value().clone()))
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let Some(key) = self.keys.get(run_id).map(|k| k.value().clone()) else {
            return Ok(None);
        };
        Ok(self.runs.get(&key).map(|r| r.value().clone()))
    }

    async fn advance_recovery_point(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        from: &RecoveryPoint,
        to: &RecoveryPoint,
    ) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            ensure_lock(run, Some(lock))?;
            if run.recovery_point.as_ref() != Some(from) {
                return Err(RepositoryError::Conflict(format!(
                    "recovery point is no longer '{from}'"
                )));
            }
            run.recovery_point = Some(to.clone());
            Ok(())
        })
    }

    async fn record_accessor(
        &self,
        run_id: &Uuid,
        name: &str,
        value: &Value,
    ) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            run.attr_accessors.insert(name.to_string(), value.clone());
            Ok(())
        })
    }

    async fn store_error(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        error: &StoredError,
    ) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            ensure_lock(run, Some(lock))?;
            run.error_object = Some(error.clone());
            Ok(())
        })
    }

    async fn release_lock(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            ensure_lock(run, Some(lock))?;
            run.locked_at = None;
            Ok(())
        })
    }

    async fn finish(
        &self,
        run_id: &Uuid,
        lock: Option<&DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            ensure_lock(run, lock)?;
            run.recovery_point = Some(RecoveryPoint::Finished);
            run.locked_at = None;
            Ok(())
        })
    }

    async fn mark_enqueued(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        self.update(run_id, |run| {
            run.enqueued_at.get_or_insert_with(Utc::now);
            Ok(())
        })
    }

    async fn list_awaiting(&self, run_id: &Uuid) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut children: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| r.awaited_by.as_ref() == Some(run_id))
            .map(|r| r.value().clone())
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acidic_types::job::SerializedJob;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn new_run(key: &str) -> NewRun {
        NewRun {
            idempotency_key: IdempotencyKey::new(key),
            job_class: "WorkJob".to_string(),
            serialized_job: SerializedJob::new("WorkJob", key, vec![]),
            workflow: None,
            attr_accessors: BTreeMap::new(),
            staged: true,
            awaited_by: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_create_or_attach_creates_one_record() {
        let repo = Arc::new(InMemoryRunRepository::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.create_or_attach(new_run("dup"), false, Duration::seconds(90))
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let attachment = handle.await.unwrap();
            if attachment.created {
                created += 1;
            }
            ids.push(attachment.run.id);
        }

        assert_eq!(created, 1);
        assert_eq!(repo.len(), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_advance_rejects_stale_from() {
        let repo = InMemoryRunRepository::new();
        let attachment = repo
            .create_or_attach(new_run("k"), false, Duration::seconds(90))
            .await
            .unwrap();
        let mut run = attachment.run;
        let lock = Utc::now();
        run.locked_at = Some(lock);
        run.recovery_point = Some(RecoveryPoint::step("c"));
        repo.replace(run.clone());

        let err = repo
            .advance_recovery_point(
                &run.id,
                &lock,
                &RecoveryPoint::step("a"),
                &RecoveryPoint::step("b"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_taken_over_lock_rejects_former_owner() {
        let repo = InMemoryRunRepository::new();
        let mut run = repo
            .create_or_attach(new_run("slow"), false, Duration::seconds(90))
            .await
            .unwrap()
            .run;
        let former = Utc::now() - Duration::seconds(120);
        let current = Utc::now();

        // A second worker took the lock over after the first one stalled.
        run.recovery_point = Some(RecoveryPoint::step("work"));
        run.locked_at = Some(current);
        repo.replace(run.clone());

        let error = StoredError {
            step: Some("work".to_string()),
            message: "late failure".to_string(),
            chain: vec![],
            occurred_at: Utc::now(),
        };
        assert!(matches!(
            repo.release_lock(&run.id, &former).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.store_error(&run.id, &former, &error).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.finish(&run.id, Some(&former)).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.advance_recovery_point(
                &run.id,
                &former,
                &RecoveryPoint::step("work"),
                &RecoveryPoint::Finished
            )
            .await,
            Err(RepositoryError::Conflict(_))
        ));

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.locked_at, Some(current));
        assert_eq!(stored.recovery_point, Some(RecoveryPoint::step("work")));
        assert!(stored.error_object.is_none());

        repo.release_lock(&run.id, &current).await.unwrap();
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(stored.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_enqueued_keeps_first_timestamp() {
        let repo = InMemoryRunRepository::new();
        let run = repo
            .create_or_attach(new_run("child"), false, Duration::seconds(90))
            .await
            .unwrap()
            .run;
        assert!(run.enqueued_at.is_none());

        repo.mark_enqueued(&run.id).await.unwrap();
        let first = repo.get_run(&run.id).await.unwrap().unwrap().enqueued_at;
        assert!(first.is_some());
        repo.mark_enqueued(&run.id).await.unwrap();
        assert_eq!(repo.get_run(&run.id).await.unwrap().unwrap().enqueued_at, first);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let repo = InMemoryRunRepository::new();
        let err = repo.release_lock(&Uuid::now_v7(), &Utc::now()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }
}
