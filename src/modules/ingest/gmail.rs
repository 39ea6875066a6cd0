use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::days_ago_timestamp;
use crate::modules::account::entity::{MailAccount, SyncStatus};
use crate::modules::common::parallel::run_with_limit;
use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::common::Addr;
use crate::modules::credentials::CredentialStore;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::ingest::{
    choose_date, normalize_folder, normalize_subject, rate_limit_backoff, synthetic_id,
    INGEST_BATCH_SIZE,
};
use crate::modules::message::entity::EmailMessage;
use crate::modules::pipeline::EmailService;
use crate::modules::settings::cli::SETTINGS;
use crate::{mailsift_version, raise_error, utc_now};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Per-account fetch fan-out against the Gmail API.
const FETCH_CONCURRENCY: usize = 10;
const PAGE_SIZE: u32 = 100;
const MAX_RESULTS_PER_POLL: usize = 500;
/// Stop paging after this many consecutive too-old messages,
const OLD_STREAK_LIMIT: usize = 30;
/// or after this many too-old messages in total.
const OLD_TOTAL_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    id: String,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    payload: Option<Part>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PartBody {
    data: Option<String>,
}

/// Gmail REST poller for OAuth accounts: lists recent message ids, fetches
/// each with bounded concurrency, and hands normalized batches to the
/// write path. Returns `Ok` only on shutdown.
pub struct GmailIngestor;

impl GmailIngestor {
    pub async fn run(account: MailAccount) -> MailSiftResult<()> {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        MailAccount::set_sync_status(account.id, SyncStatus::Syncing).await?;
        let client = Arc::new(build_client()?);

        loop {
            Self::poll_once(&client, &account).await?;
            MailAccount::touch_last_sync(account.id).await?;

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down Gmail poller for {}", account.email);
                    return Ok(());
                }
            }
        }
    }

    async fn poll_once(client: &Arc<reqwest::Client>, account: &MailAccount) -> MailSiftResult<()> {
        let cutoff = days_ago_timestamp!(SETTINGS.mailsift_initial_sync_days);
        let mut page_token: Option<String> = None;
        let mut fetched_total = 0usize;
        let mut old_streak = 0usize;
        let mut old_total = 0usize;
        let mut batch: Vec<EmailMessage> = Vec::with_capacity(INGEST_BATCH_SIZE);

        'pages: loop {
            let list = Self::list_messages(client, account, page_token.take()).await?;
            if list.messages.is_empty() {
                break;
            }

            let details = {
                let client = client.clone();
                let email = account.email.clone();
                run_with_limit(FETCH_CONCURRENCY, list.messages.clone(), move |m| {
                    let client = client.clone();
                    let email = email.clone();
                    async move { Self::get_message(&client, &email, &m.id).await }
                })
                .await?
            };

            for detail in details {
                fetched_total += 1;
                let internal_date = detail
                    .internal_date
                    .as_deref()
                    .and_then(|s| s.parse::<i64>().ok());
                if internal_date.is_some_and(|d| d < cutoff) {
                    old_streak += 1;
                    old_total += 1;
                    if old_streak >= OLD_STREAK_LIMIT || old_total >= OLD_TOTAL_LIMIT {
                        debug!(
                            "Stopping poll for {}: hit the old-message limits",
                            account.email
                        );
                        break 'pages;
                    }
                    continue;
                }
                old_streak = 0;
                batch.push(normalize_detail(account, detail));
                if batch.len() >= INGEST_BATCH_SIZE {
                    EmailService::ingest(std::mem::take(&mut batch)).await?;
                }
                if fetched_total >= MAX_RESULTS_PER_POLL {
                    break 'pages;
                }
            }

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if !batch.is_empty() {
            EmailService::ingest(batch).await?;
        }
        Ok(())
    }

    async fn list_messages(
        client: &reqwest::Client,
        account: &MailAccount,
        page_token: Option<String>,
    ) -> MailSiftResult<MessageList> {
        let mut url = format!(
            "{}/messages?labelIds=INBOX&maxResults={}",
            GMAIL_API_BASE, PAGE_SIZE
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", token));
        }
        let value = Self::get_with_auth(client, account, &url).await?;
        serde_json::from_value::<MessageList>(value).map_err(|e| {
            raise_error!(
                format!(
                    "Failed to deserialize the Gmail message list: {:#?}. Possible model mismatch or API change.",
                    e
                ),
                ErrorCode::GmailApiCallFailed
            )
        })
    }

    /// `format=full` first; a scope-403 mentioning metadata falls back to
    /// `format=metadata` so restricted grants still produce records.
    async fn get_message(
        client: &reqwest::Client,
        account_email: &str,
        message_id: &str,
    ) -> MailSiftResult<MessageDetail> {
        let full_url = format!("{}/messages/{}?format=full", GMAIL_API_BASE, message_id);
        match Self::get_json(client, account_email, &full_url).await {
            Ok(value) => parse_detail(value),
            Err(e) if e.code() == ErrorCode::InsufficientScope => {
                debug!(
                    "Metadata-scope fallback for message {} on account {}",
                    message_id, account_email
                );
                let meta_url =
                    format!("{}/messages/{}?format=metadata", GMAIL_API_BASE, message_id);
                parse_detail(Self::get_json(client, account_email, &meta_url).await?)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_with_auth(
        client: &reqwest::Client,
        account: &MailAccount,
        url: &str,
    ) -> MailSiftResult<Value> {
        match Self::get_json(client, &account.email, url).await {
            Err(e) if e.code() == ErrorCode::AuthExpired => {
                // One forced refresh; a second 401 disconnects the account.
                warn!(
                    "Gmail API rejected the token for {}; forcing one refresh",
                    account.email
                );
                CredentialStore::force_refresh(&account.email).await?;
                match Self::get_json(client, &account.email, url).await {
                    Err(e) if e.code() == ErrorCode::AuthExpired => {
                        MailAccount::set_sync_status(account.id, SyncStatus::Disconnected).await?;
                        Err(raise_error!(
                            format!("Gmail authorization for {} is no longer valid", account.email),
                            ErrorCode::AuthPermanent
                        ))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn get_json(
        client: &reqwest::Client,
        account_email: &str,
        url: &str,
    ) -> MailSiftResult<Value> {
        let mut attempt = 0u32;
        loop {
            let token = CredentialStore::get_valid_access_token(account_email).await?;
            let response = client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let delay = rate_limit_backoff(attempt);
                warn!(
                    "Gmail rate limit for {}; backing off {:?} (attempt {})",
                    account_email, delay, attempt
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let body: Value = response.json().await.unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(raise_error!(
                    format!("Gmail API returned 401 for {}", account_email),
                    ErrorCode::AuthExpired
                ));
            }
            if status == reqwest::StatusCode::FORBIDDEN {
                let message = body["error"]["message"].as_str().unwrap_or_default();
                if message.contains("Metadata scope") {
                    return Err(raise_error!(
                        format!("Granted scope only allows metadata access: {}", message),
                        ErrorCode::InsufficientScope
                    ));
                }
                return Err(raise_error!(
                    format!("Gmail API denied the request: {}", message),
                    ErrorCode::AuthPermanent
                ));
            }
            if !status.is_success() {
                return Err(raise_error!(
                    format!("Gmail API call failed ({}): {}", status, body),
                    ErrorCode::GmailApiCallFailed
                ));
            }
            return Ok(body);
        }
    }
}

fn build_client() -> MailSiftResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("MailSift/{}", mailsift_version!()))
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))
}

fn parse_detail(value: Value) -> MailSiftResult<MessageDetail> {
    serde_json::from_value::<MessageDetail>(value).map_err(|e| {
        raise_error!(
            format!(
                "Failed to deserialize the Gmail message detail: {:#?}. Possible model mismatch or API change.",
                e
            ),
            ErrorCode::GmailApiCallFailed
        )
    })
}

/// Builds the canonical record from a Gmail API payload: headers for the
/// envelope, recursively flattened parts for the body, labels as flags.
fn normalize_detail(account: &MailAccount, detail: MessageDetail) -> EmailMessage {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| p.headers.clone())
        .unwrap_or_default();
    let header = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let header_date = header("Date")
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|d| d.timestamp_millis());
    let internal_date = detail
        .internal_date
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok());

    let (text_body, html_body) = detail
        .payload
        .as_ref()
        .map(extract_bodies)
        .unwrap_or((None, None));
    let body = text_body
        .clone()
        .or_else(|| html_body.clone())
        .unwrap_or_else(|| detail.snippet.clone());

    EmailMessage {
        id: synthetic_id(&account.email, &detail.id),
        account_id: account.id,
        account_email: account.email.clone(),
        folder: normalize_folder("INBOX"),
        subject: normalize_subject(header("Subject").as_deref()),
        from: header("From").map(|v| Addr::parse(&v)).unwrap_or_default(),
        to: parse_address_list(header("To").as_deref()),
        cc: parse_address_list(header("Cc").as_deref()),
        bcc: parse_address_list(header("Bcc").as_deref()),
        date: choose_date(header_date, internal_date),
        body,
        text_body,
        html_body,
        flags: detail.label_ids,
        category: None,
        uid: detail.id,
        ingested_at: utc_now!(),
    }
}

fn parse_address_list(value: Option<&str>) -> Vec<Addr> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Addr::parse)
                .collect()
        })
        .unwrap_or_default()
}

/// Walks `parts` depth-first collecting the first text/plain and text/html
/// bodies found anywhere in the tree.
fn extract_bodies(payload: &Part) -> (Option<String>, Option<String>) {
    let mut text = None;
    let mut html = None;
    walk_parts(payload, &mut text, &mut html);
    (text, html)
}

fn walk_parts(part: &Part, text: &mut Option<String>, html: &mut Option<String>) {
    if text.is_none() && part.mime_type == "text/plain" {
        *text = part.body.as_ref().and_then(|b| decode_body_data(b.data.as_deref()?));
    }
    if html.is_none() && part.mime_type == "text/html" {
        *html = part.body.as_ref().and_then(|b| decode_body_data(b.data.as_deref()?));
    }
    if let Some(children) = &part.parts {
        for child in children {
            if text.is_some() && html.is_some() {
                return;
            }
            walk_parts(child, text, html);
        }
    }
}

/// Gmail bodies are base64url; some gateways hand back standard base64.
fn decode_body_data(data: &str) -> Option<String> {
    let bytes = URL_SAFE
        .decode(data)
        .or_else(|_| STANDARD.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(mime: &str, data: Option<&str>, parts: Option<Vec<Part>>) -> Part {
        Part {
            mime_type: mime.into(),
            headers: vec![],
            body: data.map(|d| PartBody {
                data: Some(d.into()),
            }),
            parts,
        }
    }

    #[test]
    fn decodes_base64url_with_base64_fallback() {
        let url_safe = URL_SAFE.encode("hello+world/again");
        assert_eq!(
            decode_body_data(&url_safe).as_deref(),
            Some("hello+world/again")
        );
        let standard = STANDARD.encode("hello+world/again");
        assert_eq!(
            decode_body_data(&standard).as_deref(),
            Some("hello+world/again")
        );
        assert_eq!(decode_body_data("!!not-base64!!"), None);
    }

    #[test]
    fn prefers_text_plain_over_html() {
        let payload = part(
            "multipart/alternative",
            None,
            Some(vec![
                part("text/html", Some(&URL_SAFE.encode("<b>hi</b>")), None),
                part("text/plain", Some(&URL_SAFE.encode("hi")), None),
            ]),
        );
        let (text, html) = extract_bodies(&payload);
        assert_eq!(text.as_deref(), Some("hi"));
        assert_eq!(html.as_deref(), Some("<b>hi</b>"));
    }

    #[test]
    fn walks_nested_multiparts() {
        let payload = part(
            "multipart/mixed",
            None,
            Some(vec![part(
                "multipart/alternative",
                None,
                Some(vec![part(
                    "text/plain",
                    Some(&URL_SAFE.encode("nested body")),
                    None,
                )]),
            )]),
        );
        let (text, _) = extract_bodies(&payload);
        assert_eq!(text.as_deref(), Some("nested body"));
    }

    #[test]
    fn snippet_is_the_last_resort() {
        let account = MailAccount {
            id: 1,
            email: "me@example.com".into(),
            ..Default::default()
        };
        let detail = MessageDetail {
            id: "abc123".into(),
            snippet: "snippet text".into(),
            internal_date: Some("1700000000000".into()),
            label_ids: vec!["INBOX".into(), "UNREAD".into()],
            payload: Some(part("text/plain", None, None)),
        };
        let msg = normalize_detail(&account, detail);
        assert_eq!(msg.body, "snippet text");
        assert_eq!(msg.id, "me@example.com_abc123");
        assert_eq!(msg.date, 1_700_000_000_000);
        assert_eq!(msg.flags, vec!["INBOX".to_string(), "UNREAD".to_string()]);
        assert_eq!(msg.subject, "(No Subject)");
    }
}
