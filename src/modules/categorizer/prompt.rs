use serde::Serialize;
use serde_json::Value;

use crate::modules::message::category::EmailCategory;
use crate::modules::message::entity::EmailMessage;

/// Bodies are truncated before prompting; classification does not need the
/// whole thread.
const BODY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationInput {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub body: String,
}

impl From<&EmailMessage> for ClassificationInput {
    fn from(message: &EmailMessage) -> Self {
        Self {
            id: message.id.clone(),
            subject: message.subject.clone(),
            from: message.from.to_string(),
            body: message.body.chars().take(BODY_LIMIT).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCategory {
    pub category: EmailCategory,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

/// Per-message outcome; a bad row never poisons its chunk.
pub type ClassificationOutcome = (String, Result<ScoredCategory, String>);

/// One prompt per chunk. The records are JSON-encoded so subjects and
/// bodies cannot escape the list structure.
pub fn build_prompt(items: &[ClassificationInput]) -> String {
    let records = serde_json::to_string_pretty(items).expect("inputs are always serializable");
    format!(
        "You are an email triage assistant. Classify each email below into exactly one of \
these categories: \"Interested\", \"Meeting Booked\", \"Not Interested\", \"Spam\", \
\"Out of Office\".\n\n\
Emails:\n{records}\n\n\
Respond with a JSON object of the form \
{{\"results\": [{{\"id\": \"<id>\", \"category\": \"<category>\", \"confidence\": <0..1>, \
\"reasoning\": \"<short reason>\"}}]}}. \
Include every id exactly once and nothing else."
    )
}

/// Parses the model's JSON reply. Unknown categories and ids missing from
/// the response become per-id errors; confidence is clamped to [0, 1].
pub fn parse_response(raw: &str, expected_ids: &[String]) -> Vec<ClassificationOutcome> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return expected_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        Err(format!("model returned malformed JSON: {e}")),
                    )
                })
                .collect();
        }
    };

    let results = parsed["results"].as_array().cloned().unwrap_or_default();
    expected_ids
        .iter()
        .map(|id| {
            let entry = results.iter().find(|r| r["id"].as_str() == Some(id));
            let outcome = match entry {
                None => Err("id missing from the model response".to_string()),
                Some(entry) => {
                    let label = entry["category"].as_str().unwrap_or_default();
                    match EmailCategory::from_label(label) {
                        None => Err(format!("unknown category '{label}'")),
                        Some(category) => Ok(ScoredCategory {
                            category,
                            confidence: entry["confidence"]
                                .as_f64()
                                .unwrap_or(0.0)
                                .clamp(0.0, 1.0),
                            reasoning: entry["reasoning"].as_str().map(String::from),
                        }),
                    }
                }
            };
            (id.clone(), outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prompt_escapes_content() {
        let items = vec![ClassificationInput {
            id: "a@x.com_1".into(),
            subject: "Quote \"now\"".into(),
            from: "Eve <eve@x.com>".into(),
            body: "line1\nline2".into(),
        }];
        let prompt = build_prompt(&items);
        assert!(prompt.contains("Quote \\\"now\\\""));
        assert!(prompt.contains("line1\\nline2"));
        assert!(prompt.contains("Out of Office"));
    }

    #[test]
    fn body_is_truncated() {
        let message = EmailMessage {
            body: "x".repeat(5000),
            ..Default::default()
        };
        let input = ClassificationInput::from(&message);
        assert_eq!(input.body.chars().count(), 1000);
    }

    #[test]
    fn parses_valid_results() {
        let raw = r#"{"results": [
            {"id": "m1", "category": "Interested", "confidence": 0.92, "reasoning": "asks for pricing"},
            {"id": "m2", "category": "Meeting Booked", "confidence": 0.7}
        ]}"#;
        let outcomes = parse_response(raw, &ids(&["m1", "m2"]));
        let (_, first) = &outcomes[0];
        let scored = first.as_ref().unwrap();
        assert_eq!(scored.category, EmailCategory::Interested);
        assert_eq!(scored.confidence, 0.92);
        assert_eq!(scored.reasoning.as_deref(), Some("asks for pricing"));
        assert!(outcomes[1].1.is_ok());
    }

    #[test]
    fn unknown_category_is_a_per_id_error() {
        let raw = r#"{"results": [
            {"id": "m1", "category": "Lukewarm", "confidence": 0.5},
            {"id": "m2", "category": "Spam", "confidence": 0.9}
        ]}"#;
        let outcomes = parse_response(raw, &ids(&["m1", "m2"]));
        assert!(outcomes[0].1.is_err());
        assert_eq!(outcomes[1].1.as_ref().unwrap().category, EmailCategory::Spam);
    }

    #[test]
    fn missing_id_is_a_per_id_error() {
        let raw = r#"{"results": [{"id": "m1", "category": "Spam", "confidence": 1.0}]}"#;
        let outcomes = parse_response(raw, &ids(&["m1", "m2"]));
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"{"results": [
            {"id": "m1", "category": "Spam", "confidence": 1.8},
            {"id": "m2", "category": "Spam", "confidence": -0.3}
        ]}"#;
        let outcomes = parse_response(raw, &ids(&["m1", "m2"]));
        assert_eq!(outcomes[0].1.as_ref().unwrap().confidence, 1.0);
        assert_eq!(outcomes[1].1.as_ref().unwrap().confidence, 0.0);
    }

    #[test]
    fn malformed_json_fails_every_id() {
        let outcomes = parse_response("not json at all", &ids(&["m1", "m2"]));
        assert!(outcomes.iter().all(|(_, r)| r.is_err()));
    }
}
