use crate::modules::common::Addr;
use crate::modules::message::category::EmailCategory;
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// An ingested message in the authoritative store.
///
/// The primary key is the synthetic `{account_email}_{provider_uid}` id;
/// uniqueness on `(account_id, uid)` is enforced through the computed
/// `account_uid` secondary key.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[native_model(id = 2, version = 1)]
#[native_db(
    primary_key(pk -> String),
    secondary_key(account_uid -> String, unique),
    secondary_key(category_bucket -> String)
)]
pub struct EmailMessage {
    /// Synthetic id: `{account_email}_{provider_uid}`
    pub id: String,
    #[secondary_key]
    pub account_id: u64,
    /// Owning account's email address, embedded in the synthetic id
    pub account_email: String,
    /// Folder name, lowercased for equality
    pub folder: String,
    pub subject: String,
    pub from: Addr,
    pub to: Vec<Addr>,
    pub cc: Vec<Addr>,
    pub bcc: Vec<Addr>,
    /// Message date in epoch milliseconds; the `Date` header when parseable,
    /// otherwise the provider's internal date
    pub date: i64,
    /// Best available body: text, else flattened html, else snippet
    pub body: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub flags: Vec<String>,
    pub category: Option<EmailCategory>,
    /// Provider-assigned UID within the folder
    pub uid: String,
    pub ingested_at: i64,
}

impl EmailMessage {
    fn pk(&self) -> String {
        self.id.clone()
    }

    fn account_uid(&self) -> String {
        format!("{}_{}", self.account_id, self.uid)
    }

    fn category_bucket(&self) -> String {
        match &self.category {
            Some(category) => category.label().to_string(),
            None => "uncategorized".to_string(),
        }
    }

    /// The document shape replicated into the search index. Secrets never
    /// pass through here; the index carries message content only.
    pub fn to_search_doc(&self) -> serde_json::Value {
        serde_json::json!({
            "account": self.account_id.to_string(),
            "folder": self.folder,
            "subject": self.subject,
            "from": {
                "name": self.from.name,
                "address": self.from.address,
            },
            "to": self
                .to
                .iter()
                .map(|a| serde_json::json!({ "name": a.name, "address": a.address }))
                .collect::<Vec<_>>(),
            "date": self.date,
            "body": self.body,
            "textBody": self.text_body,
            "htmlBody": self.html_body,
            "flags": self.flags,
            "category": self.category.as_ref().map(|c| c.label()),
            "uid": self.uid,
        })
    }

    /// Recipient child rows, appended on first insertion only.
    pub fn recipient_rows(&self) -> Vec<EmailRecipient> {
        let mut rows = Vec::with_capacity(self.to.len() + self.cc.len() + self.bcc.len());
        for (kind, addrs) in [
            (RecipientKind::To, &self.to),
            (RecipientKind::Cc, &self.cc),
            (RecipientKind::Bcc, &self.bcc),
        ] {
            for (index, addr) in addrs.iter().enumerate() {
                rows.push(EmailRecipient {
                    id: format!("{}_{}_{}", self.id, kind.as_str(), index),
                    message_id: self.id.clone(),
                    kind,
                    name: addr.name.clone(),
                    address: addr.address.clone(),
                });
            }
        }
        rows
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RecipientKind {
    #[default]
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[native_model(id = 3, version = 1)]
#[native_db(primary_key(pk -> String))]
pub struct EmailRecipient {
    pub id: String,
    #[secondary_key]
    pub message_id: String,
    pub kind: RecipientKind,
    pub name: Option<String>,
    pub address: Option<String>,
}

impl EmailRecipient {
    fn pk(&self) -> String {
        self.id.clone()
    }
}
