use std::time::Duration;

use serde_json::{json, Value};

use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::settings::cli::SETTINGS;
use crate::{mailsift_version, raise_error};

/// Per-chunk deadline for one classification request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str =
    "You classify emails for a sales team. Always answer with a single JSON object.";

/// Chat-completions client for the classification model. JSON response
/// mode and a low temperature keep the output parseable.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl LlmClient {
    pub fn new() -> MailSiftResult<Self> {
        let api_key = SETTINGS.mailsift_llm_api_key.clone().ok_or_else(|| {
            raise_error!(
                "Classification is not configured: 'mailsift_llm_api_key' is unset".into(),
                ErrorCode::MissingConfiguration
            )
        })?;
        let client = reqwest::Client::builder()
            .user_agent(format!("MailSift/{}", mailsift_version!()))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        Ok(Self {
            client,
            base_url: SETTINGS.mailsift_llm_base_url.trim_end_matches('/').to_string(),
            model: SETTINGS.mailsift_llm_model.clone(),
            api_key,
        })
    }

    /// Sends one prompt and returns the raw message content. A 429 maps to
    /// `TooManyRequest` so the runner can back off without failing the run.
    pub async fn complete(&self, prompt: &str) -> MailSiftResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.1,
            "max_tokens": 2000,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    raise_error!(
                        "Classification request timed out".into(),
                        ErrorCode::ConnectionTimeout
                    )
                } else {
                    raise_error!(format!("{:#?}", e), ErrorCode::NetworkError)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(raise_error!(
                "The classification provider is rate limiting".into(),
                ErrorCode::TooManyRequest
            ));
        }
        let payload: Value = response.json().await.map_err(|e| {
            raise_error!(format!("{:#?}", e), ErrorCode::HttpResponseError)
        })?;
        if !status.is_success() {
            return Err(raise_error!(
                format!("Classification request failed ({}): {}", status, payload),
                ErrorCode::HttpResponseError
            ));
        }
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                raise_error!(
                    "The model response carried no content".into(),
                    ErrorCode::ClassificationParseError
                )
            })
    }
}
