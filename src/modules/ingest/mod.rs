use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use rand::Rng;
use std::time::Duration;

use crate::decode_mailbox_name;
use crate::modules::common::AddrVec;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::message::entity::EmailMessage;
use crate::raise_error;
use crate::utc_now;

pub mod gmail;
pub mod imap;
pub mod supervisor;

pub const MISSING_SUBJECT: &str = "(No Subject)";
/// Batches handed to the write coordinator.
pub const INGEST_BATCH_SIZE: usize = 50;

/// `{accountEmail}_{providerUid}`. URL-safe because the account email is
/// bounded and the provider UID is alphanumeric.
pub fn synthetic_id(account_email: &str, uid: &str) -> String {
    format!("{}_{}", account_email, uid)
}

pub fn normalize_subject(subject: Option<&str>) -> String {
    match subject.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => MISSING_SUBJECT.to_string(),
    }
}

/// The `Date` header wins when parseable, the provider's internal date is
/// the fallback, and "now" the last resort.
pub fn choose_date(header_date: Option<i64>, internal_date: Option<i64>) -> i64 {
    header_date.or(internal_date).unwrap_or_else(|| utc_now!())
}

/// Folders compare case-insensitively; modified-UTF-7 names are decoded
/// before lowercasing.
pub fn normalize_folder(folder: &str) -> String {
    decode_mailbox_name!(folder).to_lowercase()
}

/// Parses a raw RFC 822 message into the canonical record. Both ingest
/// variants converge here so the row and search stores only ever see one
/// shape.
pub fn message_from_rfc822(
    account_id: u64,
    account_email: &str,
    folder: &str,
    uid: &str,
    raw: &[u8],
    flags: Vec<String>,
    internal_date: Option<i64>,
) -> MailSiftResult<EmailMessage> {
    let parsed = MessageParser::new().parse(raw).ok_or_else(|| {
        raise_error!(
            format!("Unparseable message for uid {}", uid),
            ErrorCode::ImapUnexpectedResult
        )
    })?;

    let from = parsed
        .from()
        .map(|addr| AddrVec::from(addr).0.first().cloned())
        .flatten()
        .unwrap_or_default();
    let to = parsed.to().map(|addr| AddrVec::from(addr).0).unwrap_or_default();
    let cc = parsed.cc().map(|addr| AddrVec::from(addr).0).unwrap_or_default();
    let bcc = parsed.bcc().map(|addr| AddrVec::from(addr).0).unwrap_or_default();

    let text_body = parsed.body_text(0).map(|s| s.to_string());
    let html_body = parsed.body_html(0).map(|s| s.to_string());
    let body = text_body
        .clone()
        .or_else(|| html_body.clone())
        .unwrap_or_default();

    let header_date = parsed.date().map(|d| d.to_timestamp() * 1000);

    Ok(EmailMessage {
        id: synthetic_id(account_email, uid),
        account_id,
        account_email: account_email.to_string(),
        folder: normalize_folder(folder),
        subject: normalize_subject(parsed.subject()),
        from,
        to,
        cc,
        bcc,
        date: choose_date(header_date, internal_date),
        body,
        text_body,
        html_body,
        flags,
        category: None,
        uid: uid.to_string(),
        ingested_at: utc_now!(),
    })
}

/// Exponential backoff with jitter for provider rate limits: 500 ms
/// doubling per attempt, capped at 30 s, with up to 20% random spread.
pub fn rate_limit_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 30_000;
    let raw = BASE_MS.saturating_mul(1u64 << attempt.min(10)).min(CAP_MS) / 2;
    let jitter = rand::rng().random_range(0..=raw / 5);
    Duration::from_millis(raw + jitter)
}

/// Restart backoff for supervised workers: 1 s doubling to a 60 s cap.
pub fn restart_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 1_000;
    const CAP_MS: u64 = 60_000;
    Duration::from_millis(BASE_MS.saturating_mul(1u64 << attempt.min(10)).min(CAP_MS))
}

pub fn as_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: \"Alice Example\" <alice@example.com>\r\n\
To: Bob <bob@example.com>, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Subject: Quarterly pricing\r\n\
Date: Mon, 13 Jul 2026 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Interested in your pricing tiers.\r\n";

    #[test]
    fn parses_canonical_record() {
        let msg = message_from_rfc822(
            7,
            "me@example.com",
            "INBOX",
            "101",
            RAW,
            vec!["\\Seen".into()],
            Some(1_700_000_000_000),
        )
        .unwrap();
        assert_eq!(msg.id, "me@example.com_101");
        assert_eq!(msg.folder, "inbox");
        assert_eq!(msg.subject, "Quarterly pricing");
        assert_eq!(msg.from.address.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.cc.len(), 1);
        assert_eq!(msg.body, "Interested in your pricing tiers.\r\n");
        assert_eq!(msg.text_body.as_deref(), Some("Interested in your pricing tiers.\r\n"));
        // The Date header wins over the internal date.
        assert_eq!(msg.date, 1_783_936_800_000);
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        assert_eq!(normalize_subject(None), MISSING_SUBJECT);
        assert_eq!(normalize_subject(Some("")), MISSING_SUBJECT);
        assert_eq!(normalize_subject(Some("  ")), MISSING_SUBJECT);
        assert_eq!(normalize_subject(Some("Hi")), "Hi");
    }

    #[test]
    fn date_prefers_header() {
        assert_eq!(choose_date(Some(10), Some(20)), 10);
        assert_eq!(choose_date(None, Some(20)), 20);
        assert!(choose_date(None, None) > 0);
    }

    #[test]
    fn folder_is_lowercased() {
        assert_eq!(normalize_folder("INBOX"), "inbox");
        assert_eq!(normalize_folder("Sent Items"), "sent items");
    }

    #[test]
    fn backoff_respects_cap_and_jitter() {
        for attempt in 0..12 {
            let d = rate_limit_backoff(attempt).as_millis() as u64;
            assert!(d >= 250, "attempt {attempt} too short: {d}");
            assert!(d <= 36_000, "attempt {attempt} beyond cap: {d}");
        }
        assert_eq!(restart_backoff(0).as_secs(), 1);
        assert_eq!(restart_backoff(3).as_secs(), 8);
        assert_eq!(restart_backoff(10).as_secs(), 60);
        assert_eq!(restart_backoff(30).as_secs(), 60);
    }
}
