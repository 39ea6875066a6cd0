use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::modules::account::entity::MailAccount;
use crate::modules::common::periodic::spawn_periodic;
use crate::modules::context::BackgroundTask;
use crate::modules::error::MailSiftResult;
use crate::modules::message::entity::EmailMessage;
use crate::modules::metrics::MAILSIFT_RECONCILED_MESSAGES_TOTAL;
use crate::modules::scheduler::model::TaskPriority;
use crate::modules::search::SearchStore;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::sync::tasks::SyncBulkTask;
use crate::modules::tasks::queue::MailSiftTaskQueue;

/// Per-account id listings are capped per tick; a hugely divergent account
/// converges over several intervals instead of monopolizing one.
const ID_CAP: usize = 10_000;

#[derive(Debug, Default, PartialEq)]
pub struct ReconcileSummary {
    pub missing: usize,
    pub queued: usize,
}

/// Ids present in the authoritative listing but absent from the search
/// listing. The reverse direction is intentionally left alone: the row
/// store is authoritative and never trimmed to match the index.
pub fn missing_ids(row_ids: &[String], search_ids: &[String]) -> Vec<String> {
    let indexed: HashSet<&String> = search_ids.iter().collect();
    row_ids
        .iter()
        .filter(|id| !indexed.contains(id))
        .cloned()
        .collect()
}

/// One repair pass for one account: compare counts, list both sides, and
/// re-enqueue whatever the index is missing. An on-demand run may restrict
/// the row side to the last `days_back` days.
pub async fn reconcile_account(
    account_id: u64,
    days_back: Option<u32>,
) -> MailSiftResult<ReconcileSummary> {
    let row_count = EmailMessage::count_by_account(account_id).await?;
    let search_count = SearchStore::get().count_by_account(account_id).await? as usize;
    if row_count <= search_count {
        return Ok(ReconcileSummary::default());
    }

    let since = days_back.map(|days| crate::days_ago_timestamp!(days));
    let row_ids = EmailMessage::list_ids_by_account_since(account_id, ID_CAP, since).await?;
    let search_ids = SearchStore::get()
        .list_ids_by_account(account_id, ID_CAP as u64)
        .await?;
    let missing = missing_ids(&row_ids, &search_ids);
    if missing.is_empty() {
        return Ok(ReconcileSummary::default());
    }

    let summary = ReconcileSummary {
        missing: missing.len(),
        queued: missing.len(),
    };
    MAILSIFT_RECONCILED_MESSAGES_TOTAL
        .with_label_values(&[&account_id.to_string()])
        .inc_by(missing.len() as u64);

    match MailSiftTaskQueue::get() {
        Ok(queue) => {
            queue
                .submit_task(SyncBulkTask::new(missing, TaskPriority::Low), None)
                .await?;
        }
        Err(_) => {
            // Queue outage: repair directly so divergence does not pile up.
            warn!(
                "Sync queue unavailable; indexing {} missing messages for account {} inline",
                summary.missing, account_id
            );
            let messages = EmailMessage::load_many(missing).await?;
            let docs: Vec<_> = messages
                .into_iter()
                .map(|m| (m.id.clone(), m.to_search_doc()))
                .collect();
            SearchStore::get().bulk_index(docs, true).await?;
        }
    }
    Ok(summary)
}

/// Full sweep across every account; the periodic tick and the on-demand
/// Reconcile job both land here.
pub async fn reconcile_all() -> MailSiftResult<ReconcileSummary> {
    let accounts = MailAccount::list_startable().await?;
    let mut totals = ReconcileSummary::default();
    for account in accounts {
        let summary = reconcile_account(account.id, None).await?;
        totals.missing += summary.missing;
        totals.queued += summary.queued;
    }
    if totals.missing > 0 {
        info!(
            "Reconciliation pass: {} missing, {} queued",
            totals.missing, totals.queued
        );
    }
    Ok(totals)
}

pub struct ReconciliationTask;

impl BackgroundTask for ReconciliationTask {
    fn start() {
        spawn_periodic(
            "search-store-reconciliation",
            Duration::from_secs(SETTINGS.mailsift_reconciliation_interval_secs),
            false,
            || async {
                reconcile_all().await?;
                Ok(())
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ids_is_exact_set_difference() {
        let rows = vec![
            "a@x.com_1".to_string(),
            "a@x.com_2".to_string(),
            "a@x.com_3".to_string(),
        ];
        let indexed = vec!["a@x.com_2".to_string()];
        let missing = missing_ids(&rows, &indexed);
        assert_eq!(missing, vec!["a@x.com_1".to_string(), "a@x.com_3".to_string()]);
    }

    #[test]
    fn no_divergence_yields_empty() {
        let rows = vec!["a@x.com_1".to_string()];
        assert!(missing_ids(&rows, &rows.clone()).is_empty());
        assert!(missing_ids(&[], &[]).is_empty());
    }

    #[test]
    fn extra_search_documents_are_ignored() {
        let rows = vec!["a@x.com_1".to_string()];
        let indexed = vec!["a@x.com_1".to_string(), "stale@x.com_9".to_string()];
        assert!(missing_ids(&rows, &indexed).is_empty());
    }
}
