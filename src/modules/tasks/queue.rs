use crate::modules::database::manager::DB_MANAGER;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailSiftResult;
use crate::modules::scheduler::engine::QueueEngine;
use crate::modules::scheduler::model::TaskStatus;
use crate::modules::scheduler::nativedb::meta::NativeDbTaskStore;
use crate::modules::scheduler::nativedb::TaskMetaEntity;
use crate::modules::scheduler::task::Task;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::sync::tasks::{
    ReconcileTask, ReindexAllTask, SyncBulkTask, SyncOneTask, BULK_SYNC_QUEUE, EMAIL_SYNC_QUEUE,
    RECONCILIATION_QUEUE,
};
use crate::{modules::context::Initialize, raise_error};
use std::sync::{Arc, OnceLock};
use tracing::error;

static TASK_QUEUE: OnceLock<MailSiftTaskQueue> = OnceLock::new();

/// The durable sync queue. When initialization fails the singleton stays
/// unset and callers observe `QueueUnavailable`; the write coordinator
/// falls back to synchronous indexing and the process keeps running.
pub struct MailSiftTaskQueue {
    engine: Arc<QueueEngine>,
}

impl Initialize for MailSiftTaskQueue {
    async fn initialize() -> MailSiftResult<()> {
        match MailSiftTaskQueue::new().await {
            Ok(queue) => {
                let _ = TASK_QUEUE.set(queue);
            }
            Err(e) => {
                error!(
                    "Sync queue unavailable; ingest falls back to direct indexing: {:?}",
                    e
                );
            }
        }
        Ok(())
    }
}

impl MailSiftTaskQueue {
    pub fn get() -> MailSiftResult<&'static MailSiftTaskQueue> {
        TASK_QUEUE.get().ok_or_else(|| {
            raise_error!(
                "The sync queue is not available".into(),
                ErrorCode::QueueUnavailable
            )
        })
    }

    pub fn available() -> bool {
        TASK_QUEUE.get().is_some()
    }

    async fn new() -> MailSiftResult<Self> {
        let store = NativeDbTaskStore::init(DB_MANAGER.tasks_db().clone());
        store.restore().await?;
        let engine = QueueEngine::new(store)
            .register::<SyncOneTask>()
            .register::<SyncBulkTask>()
            .register::<ReconcileTask>()
            .register::<ReindexAllTask>()
            .queue_workers(EMAIL_SYNC_QUEUE, SETTINGS.mailsift_sync_one_workers)
            .queue_workers(BULK_SYNC_QUEUE, SETTINGS.mailsift_bulk_sync_workers)
            .queue_workers(RECONCILIATION_QUEUE, SETTINGS.mailsift_reconcile_workers)
            .start();
        Ok(MailSiftTaskQueue { engine })
    }

    pub async fn submit_task<T>(&self, task: T, delay_seconds: Option<u32>) -> MailSiftResult<()>
    where
        T: Task + Send + Sync + 'static,
    {
        self.engine.submit(task, delay_seconds).await
    }

    pub async fn submit_tasks<T>(
        &self,
        tasks: &[T],
        delay_seconds: Option<u32>,
    ) -> MailSiftResult<()>
    where
        T: Task + Send + Sync + 'static,
    {
        self.engine.submit_all(tasks, delay_seconds).await
    }

    pub async fn stop_task(
        &self,
        task_id: u64,
        stop_reason: Option<String>,
    ) -> MailSiftResult<()> {
        self.engine.stop(task_id, stop_reason).await
    }

    pub async fn remove_task(&self, id: u64) -> MailSiftResult<()> {
        self.engine.store().mark_removed(id).await
    }

    /// Operator view over one job type, optionally filtered by status.
    pub async fn list_sync_tasks(
        &self,
        task_key: &str,
        status: Option<TaskStatus>,
    ) -> MailSiftResult<Vec<TaskMetaEntity>> {
        match status {
            Some(status) => {
                self.engine
                    .store()
                    .list_by_key_and_status(task_key, status)
                    .await
            }
            None => self.engine.store().list_by_key(task_key).await,
        }
    }
}
