use tracing::{info, warn};

use crate::modules::categorizer::CATEGORIZER;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::message::category::EmailCategory;
use crate::modules::message::entity::EmailMessage;
use crate::modules::message::{CategoryTransition, IngestOutcome};
use crate::modules::metrics::MAILSIFT_MESSAGES_INGESTED_TOTAL;
use crate::modules::scheduler::model::TaskPriority;
use crate::modules::search::query::SearchFilters;
use crate::modules::search::{SearchPage, SearchStore};
use crate::modules::settings::cli::SETTINGS;
use crate::modules::sync::tasks::{SyncBulkTask, SyncOneTask};
use crate::modules::tasks::queue::MailSiftTaskQueue;

/// Which store actually answered a read.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SearchSource {
    Primary,
    Fallback,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub page: SearchPage,
    pub source: SearchSource,
}

/// The write coordinator: authoritative store first, search replication
/// second. The queue carries replication when it is up; when it is not,
/// indexing happens inline and the reconciler repairs whatever slips.
pub struct EmailService;

impl EmailService {
    pub async fn ingest(msgs: Vec<EmailMessage>) -> MailSiftResult<IngestOutcome> {
        let docs: Vec<(String, serde_json::Value)> = msgs
            .iter()
            .map(|m| (m.id.clone(), m.to_search_doc()))
            .collect();
        let outcome = EmailMessage::upsert_messages(msgs).await?;
        MAILSIFT_MESSAGES_INGESTED_TOTAL
            .with_label_values(&["indexed"])
            .inc_by(outcome.indexed as u64);
        MAILSIFT_MESSAGES_INGESTED_TOTAL
            .with_label_values(&["skipped"])
            .inc_by(outcome.skipped as u64);

        if outcome.indexed == 0 {
            return Ok(outcome);
        }
        Self::trigger_classification();

        match MailSiftTaskQueue::get() {
            Ok(queue) => {
                let job = SyncBulkTask::new(outcome.inserted_ids.clone(), TaskPriority::Normal);
                if let Err(e) = queue.submit_task(job, None).await {
                    warn!("Failed to enqueue the sync job; indexing inline: {}", e);
                    Self::index_inline(docs).await;
                }
            }
            Err(_) => {
                // Degraded mode: no queue, so replicate synchronously. An
                // index failure here only widens the reconciliation window.
                Self::index_inline(docs).await;
            }
        }
        Ok(outcome)
    }

    /// Kicks the classification runner after fresh rows land. A run already
    /// in flight picks the new backlog up on its next trigger, so the
    /// rejection is not an error worth logging.
    fn trigger_classification() {
        if SETTINGS.mailsift_llm_api_key.is_none() {
            return;
        }
        tokio::spawn(async move {
            match CATEGORIZER.trigger().await {
                Ok(_) => {}
                Err(e) if e.code() == ErrorCode::AlreadyExists => {}
                Err(e) => warn!("Classification trigger failed: {}", e),
            }
        });
    }

    async fn index_inline(docs: Vec<(String, serde_json::Value)>) {
        if let Err(e) = SearchStore::get().bulk_index(docs, false).await {
            warn!(
                "Inline indexing failed; the reconciler will repair the gap: {}",
                e
            );
        }
    }

    /// Degenerate single-message path.
    pub async fn index_one(message_id: String) -> MailSiftResult<()> {
        match MailSiftTaskQueue::get() {
            Ok(queue) => {
                queue
                    .submit_task(SyncOneTask { message_id }, None)
                    .await
            }
            Err(_) => {
                if let Some(message) = EmailMessage::find(message_id).await? {
                    let doc = (message.id.clone(), message.to_search_doc());
                    Self::index_inline(vec![doc]).await;
                }
                Ok(())
            }
        }
    }

    /// Category writes bypass the queue: they are small, frequent, and the
    /// downstream filters need both stores aligned quickly. Row store
    /// first, then the index.
    pub async fn update_categories(
        updates: Vec<(String, EmailCategory)>,
    ) -> MailSiftResult<Vec<CategoryTransition>> {
        let transitions = EmailMessage::bulk_update_categories(updates).await?;
        if transitions.is_empty() {
            return Ok(transitions);
        }
        let applied: Vec<(String, EmailCategory)> = transitions
            .iter()
            .map(|t| (t.message_id.clone(), t.category))
            .collect();
        if let Err(e) = SearchStore::get().bulk_update_categories(&applied).await {
            // Readers filtering by category may briefly disagree across
            // stores; the row store remains the truth.
            warn!("Search-store category update failed: {}", e);
        }
        Ok(transitions)
    }

    pub async fn update_category(
        message_id: String,
        category: EmailCategory,
    ) -> MailSiftResult<Option<CategoryTransition>> {
        let mut transitions = Self::update_categories(vec![(message_id, category)]).await?;
        Ok(transitions.pop())
    }

    /// Search prefers the index; if the index is unreachable the row store
    /// answers, tagged so observability and tests can tell the difference.
    pub async fn search(
        query: &str,
        filters: &SearchFilters,
        allowed_account_ids: &[u64],
        page: u64,
        limit: u64,
    ) -> MailSiftResult<SearchOutcome> {
        match SearchStore::get()
            .search(query, filters, allowed_account_ids, page, limit)
            .await
        {
            Ok(page) => Ok(SearchOutcome {
                page,
                source: SearchSource::Primary,
            }),
            Err(e) => {
                info!("Search store unavailable; answering from the row store: {}", e);
                let (items, total) = EmailMessage::fallback_scan(
                    Some(query.to_string()),
                    filters.account,
                    filters.folder.clone(),
                    filters.category,
                    allowed_account_ids.to_vec(),
                    page,
                    limit,
                )
                .await?;
                let hits = items
                    .into_iter()
                    .map(|m| {
                        let mut doc = m.to_search_doc();
                        doc["id"] = serde_json::Value::String(m.id);
                        doc
                    })
                    .collect();
                let total_pages = if limit > 0 {
                    (total as f64 / limit as f64).ceil() as u64
                } else {
                    0
                };
                Ok(SearchOutcome {
                    page: SearchPage {
                        hits,
                        total,
                        page,
                        limit,
                        total_pages,
                    },
                    source: SearchSource::Fallback,
                })
            }
        }
    }
}
