use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::modules::message::entity::EmailMessage;
use crate::modules::scheduler::model::TaskPriority;
use crate::modules::scheduler::task::{Task, TaskFuture};
use crate::modules::search::SearchStore;
use crate::modules::settings::cli::SETTINGS;

pub const EMAIL_SYNC_QUEUE: &str = "email-sync";
pub const BULK_SYNC_QUEUE: &str = "bulk-sync";
pub const RECONCILIATION_QUEUE: &str = "email-reconciliation";

/// Ten minutes; a bulk replication that runs longer is failed and retried.
const BULK_SYNC_TIMEOUT_SECS: u64 = 600;

fn default_batch_size() -> usize {
    SETTINGS.mailsift_bulk_sync_batch_size as usize
}

/// Replicates one message from the row store into the search index.
/// Forced, so a partially-written document converges on the row.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SyncOneTask {
    pub message_id: String,
}

impl Task for SyncOneTask {
    const TASK_KEY: &'static str = "sync_one";
    const TASK_QUEUE: &'static str = EMAIL_SYNC_QUEUE;

    fn run(self, _task_id: u64) -> TaskFuture {
        Box::pin(async move {
            let Some(message) = EmailMessage::find(self.message_id.clone()).await? else {
                // The row disappeared (account deleted); nothing to sync.
                warn!("Message {} no longer exists; skipping sync", self.message_id);
                return Ok(());
            };
            let doc = (message.id.clone(), message.to_search_doc());
            SearchStore::get().bulk_index(vec![doc], true).await?;
            Ok(())
        })
    }
}

/// Replicates a set of messages in chunks, emitting progress per chunk.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SyncBulkTask {
    pub message_ids: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl SyncBulkTask {
    pub fn new(message_ids: Vec<String>, priority: TaskPriority) -> Self {
        Self {
            message_ids,
            batch_size: default_batch_size(),
            priority,
        }
    }
}

impl Task for SyncBulkTask {
    const TASK_KEY: &'static str = "sync_bulk";
    const TASK_QUEUE: &'static str = BULK_SYNC_QUEUE;

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn timeout_seconds(&self) -> Option<u64> {
        Some(BULK_SYNC_TIMEOUT_SECS)
    }

    fn run(self, task_id: u64) -> TaskFuture {
        Box::pin(async move {
            let batch_size = self.batch_size.max(1);
            let total = self.message_ids.len();
            let mut done = 0usize;
            for chunk in self.message_ids.chunks(batch_size) {
                let messages = EmailMessage::load_many(chunk.to_vec()).await?;
                let docs: Vec<_> = messages
                    .into_iter()
                    .map(|m| (m.id.clone(), m.to_search_doc()))
                    .collect();
                SearchStore::get().bulk_index(docs, true).await?;
                done += chunk.len();
                info!(
                    "Bulk sync {}: replicated {}/{} messages",
                    task_id, done, total
                );
            }
            Ok(())
        })
    }
}

/// One reconciliation pass for a single account, runnable on demand.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReconcileTask {
    pub account_id: u64,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
}

fn default_days_back() -> u32 {
    SETTINGS.mailsift_initial_sync_days
}

impl Task for ReconcileTask {
    const TASK_KEY: &'static str = "reconcile";
    const TASK_QUEUE: &'static str = RECONCILIATION_QUEUE;

    fn priority(&self) -> TaskPriority {
        TaskPriority::Low
    }

    fn run(self, _task_id: u64) -> TaskFuture {
        Box::pin(async move {
            let summary = crate::modules::reconciler::reconcile_account(
                self.account_id,
                Some(self.days_back),
            )
            .await?;
            info!(
                "Reconcile for account {}: {} missing, {} queued",
                self.account_id, summary.missing, summary.queued
            );
            Ok(())
        })
    }
}

/// Full re-index of one account, optionally dropping the existing
/// documents first.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReindexAllTask {
    pub account_id: u64,
    #[serde(default)]
    pub delete_existing: bool,
}

impl Task for ReindexAllTask {
    const TASK_KEY: &'static str = "reindex_all";
    const TASK_QUEUE: &'static str = RECONCILIATION_QUEUE;

    fn priority(&self) -> TaskPriority {
        TaskPriority::Low
    }

    fn timeout_seconds(&self) -> Option<u64> {
        Some(BULK_SYNC_TIMEOUT_SECS)
    }

    fn run(self, task_id: u64) -> TaskFuture {
        Box::pin(async move {
            if self.delete_existing {
                let deleted = SearchStore::get().delete_by_account(self.account_id).await?;
                info!(
                    "Reindex {}: dropped {} documents for account {}",
                    task_id, deleted, self.account_id
                );
            }
            let ids = EmailMessage::list_ids_by_account(self.account_id, usize::MAX).await?;
            let batch_size = default_batch_size().max(1);
            for chunk in ids.chunks(batch_size) {
                let messages = EmailMessage::load_many(chunk.to_vec()).await?;
                let docs: Vec<_> = messages
                    .into_iter()
                    .map(|m| (m.id.clone(), m.to_search_doc()))
                    .collect();
                SearchStore::get().bulk_index(docs, true).await?;
            }
            info!(
                "Reindex {}: re-indexed {} messages for account {}",
                task_id,
                ids.len(),
                self.account_id
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_payload_round_trips_with_priority() {
        let task = SyncBulkTask::new(
            vec!["a@x.com_1".into(), "a@x.com_2".into()],
            TaskPriority::Low,
        );
        let meta = task.new_meta();
        assert_eq!(meta.queue_name, BULK_SYNC_QUEUE);
        assert_eq!(meta.priority, TaskPriority::Low);
        assert_eq!(meta.timeout_seconds, Some(BULK_SYNC_TIMEOUT_SECS));

        let parsed: SyncBulkTask = serde_json::from_str(&meta.task_params).unwrap();
        assert_eq!(parsed.message_ids.len(), 2);
        assert_eq!(parsed.priority, TaskPriority::Low);
    }

    #[test]
    fn sync_one_defaults() {
        let meta = SyncOneTask {
            message_id: "a@x.com_9".into(),
        }
        .new_meta();
        assert_eq!(meta.queue_name, EMAIL_SYNC_QUEUE);
        assert_eq!(meta.priority, TaskPriority::Normal);
        assert_eq!(meta.timeout_seconds, None);
    }
}
