use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools;
use native_db::Database;
use tracing::debug;

use crate::{
    modules::{
        database::{
            batch_delete_impl, batch_insert_impl, batch_update_impl, filter_by_secondary_key_impl,
            insert_impl, secondary_find_impl, update_impl,
        },
        error::{code::ErrorCode, MailSiftResult},
        metrics::{MAILSIFT_TASK_FETCH_DURATION, MAILSIFT_TASK_QUEUE_LENGTH},
        scheduler::{
            model::{TaskMeta, TaskStatus},
            nativedb::{TaskMetaEntity, TaskMetaEntityKey},
        },
        settings::cli::SETTINGS,
    },
    raise_error, utc_now,
};

const HOUR_TO_MS: i64 = 60 * 60 * 1000;
/// A Running job whose heartbeat is older than this is considered stalled
/// and re-entered as Scheduled.
pub(crate) const STALL_INTERVAL_MS: i64 = 60 * 1000;
const CLAIM_BATCH: usize = 500;
/// Terminal-state retention: newest N rows survive the cleanup sweep.
const COMPLETED_RETENTION: usize = 100;
const FAILED_RETENTION: usize = 500;

/// Durable queue rows in the embedded tasks database. This is the only
/// queue backend; the engine talks to it directly rather than through a
/// storage abstraction.
#[derive(Clone)]
pub struct NativeDbTaskStore {
    db: Arc<Database<'static>>,
}

impl NativeDbTaskStore {
    pub fn init(db: Arc<Database<'static>>) -> Self {
        Self { db }
    }

    pub async fn save(&self, meta: TaskMeta) -> MailSiftResult<()> {
        insert_impl(&self.db, TaskMetaEntity::from(meta)).await
    }

    pub async fn save_all(&self, metas: Vec<TaskMeta>) -> MailSiftResult<()> {
        let batch: Vec<TaskMetaEntity> = metas.into_iter().map(Into::into).collect();
        batch_insert_impl(&self.db, batch).await
    }

    /// Claims due jobs ordered by `(priority, next_run)`, flipping them to
    /// Running in the same transaction. Stalled Running jobs are re-entered
    /// as Scheduled first so a crashed worker cannot strand its claim.
    pub async fn claim_due(&self) -> MailSiftResult<Vec<TaskMeta>> {
        let start = Instant::now();
        self.requeue_stalled().await?;

        let claimed: Vec<TaskMetaEntity> = batch_update_impl(
            &self.db,
            |rw| {
                let candidates: Vec<TaskMetaEntity> = rw
                    .scan()
                    .secondary(TaskMetaEntityKey::status)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .start_with(TaskStatus::Scheduled.code())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .try_collect()
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;

                let mut per_queue: ahash::AHashMap<String, i64> = ahash::AHashMap::new();
                for task in &candidates {
                    *per_queue.entry(task.queue_name.clone()).or_default() += 1;
                }
                for (queue, count) in per_queue {
                    MAILSIFT_TASK_QUEUE_LENGTH
                        .with_label_values(&[&queue])
                        .set(count);
                }

                let now = utc_now!();
                let mut due: Vec<TaskMetaEntity> = candidates
                    .into_iter()
                    .filter(|c| c.next_run <= now)
                    .collect();
                due.sort_by_key(|t| (t.priority.code(), t.next_run));
                Ok(due.into_iter().take(CLAIM_BATCH).collect())
            },
            move |data| {
                let mut result = Vec::new();
                for entity in data.iter() {
                    let mut updated = entity.clone();
                    updated.status = TaskStatus::Running;
                    updated.updated_at = utc_now!();
                    updated.heartbeat_at = utc_now!();
                    result.push((entity.clone(), updated));
                }
                Ok(result)
            },
        )
        .await?;

        let elapsed = start.elapsed();
        MAILSIFT_TASK_FETCH_DURATION.observe(elapsed.as_secs_f64());
        debug!("Time taken to claim due jobs: {:#?}", elapsed);

        Ok(claimed.into_iter().map(Into::into).collect())
    }

    async fn requeue_stalled(&self) -> MailSiftResult<()> {
        batch_update_impl::<TaskMetaEntity>(
            &self.db,
            |rw| {
                let now = utc_now!();
                let stalled: Vec<TaskMetaEntity> = rw
                    .scan()
                    .secondary(TaskMetaEntityKey::status)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .start_with(TaskStatus::Running.code())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .filter_map(|result: Result<TaskMetaEntity, _>| match result {
                        Ok(t) if now - t.heartbeat_at.max(t.updated_at) > STALL_INTERVAL_MS => {
                            Some(Ok(t))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    })
                    .try_collect()
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                Ok(stalled)
            },
            |data| {
                let mut result = Vec::new();
                for entity in data.iter() {
                    let mut updated = entity.clone();
                    updated.status = TaskStatus::Scheduled;
                    updated.updated_at = utc_now!();
                    result.push((entity.clone(), updated));
                }
                Ok(result)
            },
        )
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, task_id: u64) -> MailSiftResult<()> {
        self.mutate(task_id, |row| {
            row.heartbeat_at = utc_now!();
        })
        .await
    }

    pub async fn mark_succeeded(&self, task_id: u64, elapsed_ms: usize) -> MailSiftResult<()> {
        self.mutate(task_id, move |row| {
            row.status = TaskStatus::Success;
            row.last_duration_ms = Some(elapsed_ms);
            row.updated_at = utc_now!();
        })
        .await
    }

    /// Records a failed attempt. With a `next_run` the job re-enters the
    /// schedule; without one it is left Failed for the retention sweep. A
    /// row an operator stopped or removed mid-run keeps its status and only
    /// gains the error.
    pub async fn mark_failed(
        &self,
        task_id: u64,
        error: String,
        elapsed_ms: usize,
        attempt: usize,
        next_run: Option<i64>,
    ) -> MailSiftResult<()> {
        self.mutate(task_id, move |row| {
            row.last_error = Some(error);
            row.last_duration_ms = Some(elapsed_ms);
            row.retry_count = Some(attempt);
            row.updated_at = utc_now!();
            if matches!(row.status, TaskStatus::Stopped | TaskStatus::Removed) {
                return;
            }
            match next_run {
                Some(next_run) => {
                    row.status = TaskStatus::Scheduled;
                    row.next_run = next_run;
                }
                None => row.status = TaskStatus::Failed,
            }
        })
        .await
    }

    pub async fn mark_stopped(&self, task_id: u64, reason: Option<String>) -> MailSiftResult<()> {
        self.mutate(task_id, move |row| {
            row.status = TaskStatus::Stopped;
            row.stopped_reason = reason;
            row.updated_at = utc_now!();
        })
        .await
    }

    pub async fn mark_removed(&self, task_id: u64) -> MailSiftResult<()> {
        self.mutate(task_id, |row| {
            row.status = TaskStatus::Removed;
            row.updated_at = utc_now!();
        })
        .await
    }

    async fn mutate(
        &self,
        task_id: u64,
        apply: impl FnOnce(&mut TaskMetaEntity) + Send + 'static,
    ) -> MailSiftResult<()> {
        update_impl(
            &self.db,
            move |rw| {
                rw.get()
                    .secondary::<TaskMetaEntity>(TaskMetaEntityKey::id, task_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("The job with id={} was not found.", task_id),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                apply(&mut updated);
                Ok(updated)
            },
        )
        .await?;
        Ok(())
    }

    /// After a restart, jobs left Running by the previous process are either
    /// rescheduled or removed if their retry budget is already spent.
    pub async fn restore(&self) -> MailSiftResult<()> {
        tracing::info!("starting job restore...");
        let interrupted = filter_by_secondary_key_impl::<TaskMetaEntity>(
            &self.db,
            TaskMetaEntityKey::status,
            TaskStatus::Running.code(),
        )
        .await?;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
            for task in interrupted {
                let mut updated = task.clone();
                let spent = task
                    .retry_count
                    .is_some_and(|count| count >= task.max_retries.unwrap_or(0) as usize);
                if spent {
                    updated.status = TaskStatus::Removed;
                    updated.stopped_reason =
                        Some("Retry budget spent; dropped during job restore".into());
                } else {
                    updated.status = TaskStatus::Scheduled;
                }
                updated.updated_at = utc_now!();
                rw.update(task.clone(), updated)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
            }
            rw.commit()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
            Ok(())
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))??;
        tracing::info!("finished job restore.");
        Ok(())
    }

    /// Retention sweep: the newest completed and failed rows survive within
    /// their budgets, removed/stopped rows age out entirely.
    pub async fn cleanup(&self) -> MailSiftResult<()> {
        self.enforce_retention(TaskStatus::Success, COMPLETED_RETENTION)
            .await?;
        self.enforce_retention(TaskStatus::Failed, FAILED_RETENTION)
            .await?;

        let max_age_ms = SETTINGS.mailsift_cleanup_interval_hours as i64 * HOUR_TO_MS;
        let now = utc_now!();
        for status in [TaskStatus::Removed, TaskStatus::Stopped] {
            batch_delete_impl::<TaskMetaEntity>(&self.db, move |rw| {
                let rows: Vec<TaskMetaEntity> = rw
                    .scan()
                    .secondary(TaskMetaEntityKey::status)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .start_with(status.code())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .filter_map(|result: Result<TaskMetaEntity, _>| match result {
                        Ok(t) if now - t.created_at > max_age_ms => Some(Ok(t)),
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    })
                    .try_collect()
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                Ok(rows)
            })
            .await?;
        }

        Ok(())
    }

    async fn enforce_retention(&self, status: TaskStatus, keep: usize) -> MailSiftResult<()> {
        batch_delete_impl::<TaskMetaEntity>(&self.db, move |rw| {
            let mut rows: Vec<TaskMetaEntity> = rw
                .scan()
                .secondary(TaskMetaEntityKey::status)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .start_with(status.code())
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .try_collect()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
            if rows.len() <= keep {
                return Ok(Vec::new());
            }
            rows.sort_by_key(|t| std::cmp::Reverse(t.updated_at));
            Ok(rows.split_off(keep))
        })
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: u64) -> MailSiftResult<Option<TaskMeta>> {
        secondary_find_impl::<TaskMetaEntity>(&self.db, TaskMetaEntityKey::id, task_id)
            .await
            .map(|opt| opt.map(Into::into))
    }

    pub async fn list_by_key(&self, task_key: &str) -> MailSiftResult<Vec<TaskMetaEntity>> {
        filter_by_secondary_key_impl(&self.db, TaskMetaEntityKey::task_key, task_key.to_string())
            .await
    }

    pub async fn list_by_key_and_status(
        &self,
        task_key: &str,
        status: TaskStatus,
    ) -> MailSiftResult<Vec<TaskMetaEntity>> {
        filter_by_secondary_key_impl(
            &self.db,
            TaskMetaEntityKey::typed_status,
            TaskMetaEntity::status_filter_key(task_key, status),
        )
        .await
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Arc<Database<'static>> {
        &self.db
    }
}
