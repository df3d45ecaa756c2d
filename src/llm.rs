//! LLM-backed parsing of messy webhook responses. Only consulted when a
//! verification endpoint returns something longer than a bare code,
//! which usually means a page excerpt or an email body.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::OtpType;

/// Parse result. `otp_value_found` false means the content carried no
/// recognizable code; that is a "no code this pass" signal, not an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParsedOtp {
    #[serde(default)]
    pub otp_value_found: bool,
    #[serde(default)]
    pub otp_value: Option<String>,
    #[serde(default)]
    pub otp_type: Option<OtpType>,
}

#[async_trait]
pub trait OtpParser: Send + Sync {
    async fn parse_otp_login(
        &self,
        content: &str,
        organization_id: &str,
        enforced_type: Option<OtpType>,
    ) -> Result<ParsedOtp>;
}

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
}

#[derive(Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Parser backed by any OpenAI-compatible chat-completions endpoint.
pub struct LlmOtpParser {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmOtpParser {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn prompt(enforced_type: Option<OtpType>) -> String {
        let type_rule = match enforced_type {
            Some(OtpType::Totp) => "The value is a numeric one-time code; never return a URL.",
            Some(OtpType::MagicLink) => "The value is a login URL (magic link).",
            None => "Use \"totp\" for numeric codes and \"magic_link\" for login URLs.",
        };
        format!(
            "You extract login verification values from raw text. Respond with ONLY a JSON \
             object, no prose and no code fences: {{\"otp_value_found\": <bool>, \
             \"otp_value\": <string or null>, \"otp_type\": \"totp\"|\"magic_link\"|null}}. \
             {type_rule} If the text holds no verification value, return \
             {{\"otp_value_found\": false, \"otp_value\": null, \"otp_type\": null}}."
        )
    }
}

#[async_trait]
impl OtpParser for LlmOtpParser {
    async fn parse_otp_login(
        &self,
        content: &str,
        organization_id: &str,
        enforced_type: Option<OtpType>,
    ) -> Result<ParsedOtp> {
        debug!("parsing webhook content for {organization_id} via {}", self.model);

        let system = Self::prompt(enforced_type);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatRequestMessage {
                    role: "system",
                    content: &system,
                },
                ChatRequestMessage {
                    role: "user",
                    content,
                },
            ],
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM endpoint returned {}", response.status()));
        }

        let parsed: ChatResponse = response.json().await?;
        let reply = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| anyhow!("LLM response held no choices"))?;

        let parsed: ParsedOtp = serde_json::from_str(strip_code_fences(reply))
            .map_err(|err| anyhow!("LLM reply was not the expected JSON: {err}"))?;
        Ok(parsed)
    }
}

/// Models wrap JSON in markdown fences no matter how firmly told not to.
fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
