use std::sync::LazyLock;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::modules::message::entity::EmailMessage;
use crate::modules::metrics::{FAILURE, MAILSIFT_NOTIFICATIONS_TOTAL, SUCCESS};
use crate::modules::settings::cli::SETTINGS;
use crate::mailsift_version;

const SNIPPET_LIMIT: usize = 200;
const SLACK_SINK: &str = "slack";
const GENERIC_SINK: &str = "generic";

static WEBHOOK_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent(format!("MailSift/{}", mailsift_version!()))
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build the webhook HTTP client")
});

/// At-least-once webhook fan-out for Interested messages. Both sinks fire
/// in parallel; a sink failure is logged and never propagates into the
/// classification pipeline. Redelivery is the operator's call via the
/// queue tooling.
pub struct Notifier;

impl Notifier {
    pub async fn notify_interested(message: &EmailMessage) {
        let slack = async {
            if let Some(url) = &SETTINGS.mailsift_slack_webhook_url {
                Self::post(SLACK_SINK, url, &slack_payload(message)).await;
            }
        };
        let generic = async {
            if let Some(url) = &SETTINGS.mailsift_generic_webhook_url {
                Self::post(GENERIC_SINK, url, &generic_payload(message)).await;
            }
        };
        tokio::join!(slack, generic);
    }

    async fn post(sink: &str, url: &str, payload: &Value) {
        let result = WEBHOOK_CLIENT.post(url).json(payload).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                MAILSIFT_NOTIFICATIONS_TOTAL
                    .with_label_values(&[sink, SUCCESS])
                    .inc();
                info!("Delivered {} notification", sink);
            }
            Ok(response) => {
                MAILSIFT_NOTIFICATIONS_TOTAL
                    .with_label_values(&[sink, FAILURE])
                    .inc();
                warn!(
                    "The {} webhook answered {}; notification dropped",
                    sink,
                    response.status()
                );
            }
            Err(e) => {
                MAILSIFT_NOTIFICATIONS_TOTAL
                    .with_label_values(&[sink, FAILURE])
                    .inc();
                warn!("Failed to deliver the {} notification: {:#?}", sink, e);
            }
        }
    }
}

fn body_snippet(body: &str) -> String {
    let snippet: String = body.chars().take(SNIPPET_LIMIT).collect();
    if body.chars().count() > SNIPPET_LIMIT {
        format!("{snippet}…")
    } else {
        snippet
    }
}

/// Slack incoming-webhook blocks: header, field grid, body snippet.
pub fn slack_payload(message: &EmailMessage) -> Value {
    json!({
        "blocks": [
            {
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": "🎯 New Interested Lead",
                    "emoji": true
                }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*From:*\n{}", message.from) },
                    { "type": "mrkdwn", "text": format!("*Subject:*\n{}", message.subject) },
                    { "type": "mrkdwn", "text": format!("*Account:*\n{}", message.account_email) },
                    { "type": "mrkdwn", "text": "*Category:*\nInterested" }
                ]
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": body_snippet(&message.body)
                }
            }
        ]
    })
}

/// The generic sink receives the full record, id included, so downstream
/// automation can dedupe on at-least-once delivery.
pub fn generic_payload(message: &EmailMessage) -> Value {
    json!({
        "event": "email.interested",
        "message": {
            "id": message.id,
            "account": message.account_email,
            "folder": message.folder,
            "subject": message.subject,
            "from": { "name": message.from.name, "address": message.from.address },
            "to": message
                .to
                .iter()
                .map(|a| json!({ "name": a.name, "address": a.address }))
                .collect::<Vec<_>>(),
            "date": message.date,
            "body": message.body,
            "category": "Interested",
            "uid": message.uid,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::common::Addr;

    fn message() -> EmailMessage {
        EmailMessage {
            id: "me@example.com_77".into(),
            account_email: "me@example.com".into(),
            subject: "Interested in your pricing".into(),
            from: Addr {
                name: Some("Lead".into()),
                address: Some("lead@corp.com".into()),
            },
            body: "b".repeat(450),
            ..Default::default()
        }
    }

    #[test]
    fn slack_payload_has_header_fields_and_snippet() {
        let payload = slack_payload(&message());
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        let fields = blocks[1]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 4);
        assert!(fields[1]["text"]
            .as_str()
            .unwrap()
            .contains("Interested in your pricing"));
        let snippet = blocks[2]["text"]["text"].as_str().unwrap();
        assert_eq!(snippet.chars().count(), SNIPPET_LIMIT + 1, "truncated with ellipsis");
    }

    #[test]
    fn generic_payload_references_the_message_id() {
        let payload = generic_payload(&message());
        assert_eq!(payload["message"]["id"], "me@example.com_77");
        assert_eq!(payload["event"], "email.interested");
        assert_eq!(payload["message"]["category"], "Interested");
    }

    #[test]
    fn short_bodies_are_not_padded() {
        assert_eq!(body_snippet("short"), "short");
    }
}
