use std::collections::HashSet;
use std::sync::LazyLock;

use native_db::Models;

use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    async_find_impl, batch_delete_impl, filter_by_secondary_key_impl, with_rw_transaction_impl,
    ModelsAdapter,
};
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::message::category::EmailCategory;
use crate::modules::message::entity::{EmailMessage, EmailMessageKey, EmailRecipient, EmailRecipientKey};
use crate::raise_error;

pub mod category;
pub mod entity;

pub static MESSAGE_MODELS: LazyLock<Models> = LazyLock::new(|| {
    let mut adapter = ModelsAdapter::new();
    adapter.register_model::<EmailMessage>();
    adapter.register_model::<EmailRecipient>();
    adapter.models
});

/// Outcome of one ingest batch against the authoritative store.
#[derive(Debug, Default, PartialEq)]
pub struct IngestOutcome {
    pub indexed: usize,
    pub skipped: usize,
    /// Ids of the rows actually inserted, in input order.
    pub inserted_ids: Vec<String>,
}

/// Result of a category write, carrying the value it replaced so callers
/// can suppress repeat notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTransition {
    pub message_id: String,
    pub previous: Option<EmailCategory>,
    pub category: EmailCategory,
}

impl CategoryTransition {
    pub fn newly_interested(&self) -> bool {
        self.category == EmailCategory::Interested
            && self.previous != Some(EmailCategory::Interested)
    }
}

impl EmailMessage {
    /// Inserts a batch transactionally. A message whose `(account_id, uid)`
    /// already exists is counted as skipped and its recipients are not
    /// touched; any other storage error aborts the whole batch.
    pub async fn upsert_messages(msgs: Vec<EmailMessage>) -> MailSiftResult<IngestOutcome> {
        with_rw_transaction_impl(DB_MANAGER.message_db(), move |rw| {
            let mut outcome = IngestOutcome::default();
            let mut seen_in_batch: HashSet<String> = HashSet::new();
            for msg in msgs {
                let key = format!("{}_{}", msg.account_id, msg.uid);
                let existing: Option<EmailMessage> = rw
                    .get()
                    .secondary(EmailMessageKey::account_uid, key.clone())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                if existing.is_some() || !seen_in_batch.insert(key) {
                    outcome.skipped += 1;
                    continue;
                }
                let recipients = msg.recipient_rows();
                let id = msg.id.clone();
                rw.insert(msg)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                for recipient in recipients {
                    rw.insert(recipient).map_err(|e| {
                        raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure)
                    })?;
                }
                outcome.indexed += 1;
                outcome.inserted_ids.push(id);
            }
            Ok(outcome)
        })
        .await
    }

    /// Absence is `Ok(None)`, never an error.
    pub async fn find(id: String) -> MailSiftResult<Option<EmailMessage>> {
        async_find_impl::<EmailMessage>(DB_MANAGER.message_db(), id).await
    }

    /// Loads the subset of `ids` that still exist, preserving input order.
    pub async fn load_many(ids: Vec<String>) -> MailSiftResult<Vec<EmailMessage>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(msg) = Self::find(id).await? {
                found.push(msg);
            }
        }
        Ok(found)
    }

    /// Applies category updates in one transaction and reports each row's
    /// previous value. Unknown ids are dropped from the result rather than
    /// failing the batch.
    pub async fn bulk_update_categories(
        updates: Vec<(String, EmailCategory)>,
    ) -> MailSiftResult<Vec<CategoryTransition>> {
        with_rw_transaction_impl(DB_MANAGER.message_db(), move |rw| {
            let mut transitions = Vec::with_capacity(updates.len());
            for (message_id, category) in updates {
                let current: Option<EmailMessage> = rw
                    .get()
                    .primary(message_id.clone())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                let Some(current) = current else {
                    continue;
                };
                let previous = current.category;
                let mut updated = current.clone();
                updated.category = Some(category);
                rw.update(current, updated)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                transitions.push(CategoryTransition {
                    message_id,
                    previous,
                    category,
                });
            }
            Ok(transitions)
        })
        .await
    }

    pub async fn uncategorized_ids(limit: usize) -> MailSiftResult<Vec<String>> {
        let rows: Vec<EmailMessage> = filter_by_secondary_key_impl(
            DB_MANAGER.message_db(),
            EmailMessageKey::category_bucket,
            "uncategorized".to_string(),
        )
        .await?;
        Ok(rows.into_iter().take(limit).map(|m| m.id).collect())
    }

    pub async fn count_by_account(account_id: u64) -> MailSiftResult<usize> {
        let rows: Vec<EmailMessage> = filter_by_secondary_key_impl(
            DB_MANAGER.message_db(),
            EmailMessageKey::account_id,
            account_id,
        )
        .await?;
        Ok(rows.len())
    }

    /// Ids for one account, capped. The reconciler bounds its per-tick work
    /// with `cap`.
    pub async fn list_ids_by_account(account_id: u64, cap: usize) -> MailSiftResult<Vec<String>> {
        Self::list_ids_by_account_since(account_id, cap, None).await
    }

    /// Same listing restricted to messages dated at or after `since_ms`.
    pub async fn list_ids_by_account_since(
        account_id: u64,
        cap: usize,
        since_ms: Option<i64>,
    ) -> MailSiftResult<Vec<String>> {
        let rows: Vec<EmailMessage> = filter_by_secondary_key_impl(
            DB_MANAGER.message_db(),
            EmailMessageKey::account_id,
            account_id,
        )
        .await?;
        Ok(rows
            .into_iter()
            .filter(|m| since_ms.is_none_or(|cutoff| m.date >= cutoff))
            .take(cap)
            .map(|m| m.id)
            .collect())
    }

    /// Row-store scan used when the search store is unavailable. The caller
    /// scoping set is the authorization fence of last resort: an empty set
    /// returns empty without touching storage.
    pub async fn fallback_scan(
        query: Option<String>,
        account: Option<u64>,
        folder: Option<String>,
        category: Option<EmailCategory>,
        allowed_account_ids: Vec<u64>,
        page: u64,
        limit: u64,
    ) -> MailSiftResult<(Vec<EmailMessage>, u64)> {
        if allowed_account_ids.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let mut rows: Vec<EmailMessage> = Vec::new();
        for account_id in &allowed_account_ids {
            if let Some(filter) = account {
                if filter != *account_id {
                    continue;
                }
            }
            rows.extend(
                filter_by_secondary_key_impl::<EmailMessage>(
                    DB_MANAGER.message_db(),
                    EmailMessageKey::account_id,
                    *account_id,
                )
                .await?,
            );
        }
        let needle = query.map(|q| q.to_lowercase()).filter(|q| !q.is_empty());
        let folder = folder.map(|f| f.to_lowercase());
        rows.retain(|m| {
            if let Some(folder) = &folder {
                if &m.folder != folder {
                    return false;
                }
            }
            if let Some(category) = category {
                if m.category != Some(category) {
                    return false;
                }
            }
            if let Some(needle) = &needle {
                let from_name = m.from.name.as_deref().unwrap_or("").to_lowercase();
                let from_addr = m.from.address.as_deref().unwrap_or("").to_lowercase();
                return m.subject.to_lowercase().contains(needle)
                    || m.body.to_lowercase().contains(needle)
                    || from_name.contains(needle)
                    || from_addr.contains(needle);
            }
            true
        });
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        let total = rows.len() as u64;
        let offset = page.saturating_sub(1) * limit;
        let items = rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((items, total))
    }

    /// Cascade cleanup when an account is deleted. Removes messages and
    /// their recipient rows; returns the number of messages removed.
    pub async fn delete_account_messages(account_id: u64) -> MailSiftResult<usize> {
        let ids: Vec<String> =
            EmailMessage::list_ids_by_account(account_id, usize::MAX).await?;
        for chunk in ids.chunks(500) {
            let chunk = chunk.to_vec();
            batch_delete_impl::<EmailRecipient>(DB_MANAGER.message_db(), move |rw| {
                let mut rows = Vec::new();
                for message_id in &chunk {
                    let found: Vec<EmailRecipient> = rw
                        .scan()
                        .secondary(EmailRecipientKey::message_id)
                        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                        .start_with(message_id.clone())
                        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
                    rows.extend(found);
                }
                Ok(rows)
            })
            .await?;
        }
        batch_delete_impl::<EmailMessage>(DB_MANAGER.message_db(), move |rw| {
            let rows: Vec<EmailMessage> = rw
                .scan()
                .secondary(EmailMessageKey::account_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .start_with(account_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
            Ok(rows)
        })
        .await
    }

    pub async fn recipients_of(message_id: String) -> MailSiftResult<Vec<EmailRecipient>> {
        filter_by_secondary_key_impl(
            DB_MANAGER.message_db(),
            EmailRecipientKey::message_id,
            message_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::common::Addr;
    use crate::utc_now;

    fn message(account_id: u64, uid: u32) -> EmailMessage {
        EmailMessage {
            id: format!("user{}@example.com_{}", account_id, uid),
            account_id,
            account_email: format!("user{}@example.com", account_id),
            folder: "inbox".into(),
            subject: format!("Subject {}", uid),
            from: Addr {
                name: Some("Sender".into()),
                address: Some("sender@example.com".into()),
            },
            to: vec![Addr {
                name: None,
                address: Some(format!("user{}@example.com", account_id)),
            }],
            cc: vec![],
            bcc: vec![],
            date: utc_now!(),
            body: "hello there".into(),
            text_body: Some("hello there".into()),
            html_body: None,
            flags: vec!["\\Seen".into()],
            category: None,
            uid: uid.to_string(),
            ingested_at: utc_now!(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let batch = vec![message(9101, 101), message(9101, 102), message(9101, 103)];
        let first = EmailMessage::upsert_messages(batch.clone()).await.unwrap();
        assert_eq!(first.indexed, 3);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.inserted_ids.len(), 3);

        let second = EmailMessage::upsert_messages(batch).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, 3);
        assert!(second.inserted_ids.is_empty());

        assert_eq!(EmailMessage::count_by_account(9101).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_within_one_batch_is_skipped() {
        let outcome =
            EmailMessage::upsert_messages(vec![message(9102, 7), message(9102, 7)])
                .await
                .unwrap();
        assert_eq!(outcome.indexed, 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn recipients_are_not_duplicated_on_reingest() {
        let msg = message(9103, 42);
        let id = msg.id.clone();
        EmailMessage::upsert_messages(vec![msg.clone()]).await.unwrap();
        EmailMessage::upsert_messages(vec![msg]).await.unwrap();
        let recipients = EmailMessage::recipients_of(id).await.unwrap();
        assert_eq!(recipients.len(), 1);
    }

    #[tokio::test]
    async fn category_update_reports_previous_value() {
        let msg = message(9104, 1);
        let id = msg.id.clone();
        EmailMessage::upsert_messages(vec![msg]).await.unwrap();

        let first = EmailMessage::bulk_update_categories(vec![(
            id.clone(),
            EmailCategory::Interested,
        )])
        .await
        .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous, None);
        assert!(first[0].newly_interested());

        let second = EmailMessage::bulk_update_categories(vec![(
            id.clone(),
            EmailCategory::Interested,
        )])
        .await
        .unwrap();
        assert_eq!(second[0].previous, Some(EmailCategory::Interested));
        assert!(!second[0].newly_interested());

        let stored = EmailMessage::find(id).await.unwrap().unwrap();
        assert_eq!(stored.category, Some(EmailCategory::Interested));
    }

    #[tokio::test]
    async fn unknown_ids_do_not_fail_category_batch() {
        let transitions = EmailMessage::bulk_update_categories(vec![(
            "missing@example.com_1".into(),
            EmailCategory::Spam,
        )])
        .await
        .unwrap();
        assert!(transitions.is_empty());
    }

    #[tokio::test]
    async fn fallback_scan_enforces_empty_scope() {
        EmailMessage::upsert_messages(vec![message(9105, 1)]).await.unwrap();
        let (items, total) = EmailMessage::fallback_scan(
            Some("subject".into()),
            Some(9105),
            None,
            None,
            vec![],
            1,
            20,
        )
        .await
        .unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn fallback_scan_filters_and_sorts() {
        let mut old = message(9106, 1);
        old.date -= 10_000;
        old.subject = "quarterly pricing deck".into();
        let recent = {
            let mut m = message(9106, 2);
            m.subject = "pricing follow-up".into();
            m
        };
        EmailMessage::upsert_messages(vec![old, recent]).await.unwrap();

        let (items, total) = EmailMessage::fallback_scan(
            Some("pricing".into()),
            None,
            Some("INBOX".into()),
            None,
            vec![9106],
            1,
            10,
        )
        .await
        .unwrap();
        assert_eq!(total, 2);
        assert_eq!(items[0].uid, "2", "newest first");
    }
}
