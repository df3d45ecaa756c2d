//! Outgoing signed requests to caller-supplied verification endpoints.
//! Requests carry an HMAC-SHA256 signature over `v0:{timestamp}:{body}`
//! keyed with the organization API key, so the receiving side can verify
//! both origin and freshness.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::Mac;
use reqwest::Client;
use sha2::Sha256;
use tracing::warn;
use url::Url;

use crate::config::OtpConfig;
use crate::error::OtpError;

type HmacSha256 = hmac::Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-codegate-signature";
pub const TIMESTAMP_HEADER: &str = "x-codegate-timestamp";

pub struct WebhookClient {
    client: Client,
    retries: u32,
    retry_pause: Duration,
}

/// `v0=<hex hmac-sha256>` over `v0:{timestamp}:{body}`.
pub fn sign_payload(api_key: &str, timestamp: u64, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(api_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

impl WebhookClient {
    pub fn new(config: &OtpConfig) -> Self {
        let client = Client::builder()
            .timeout(config.webhook_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            retries: config.webhook_retries.max(1),
            retry_pause: config.webhook_retry_pause,
        }
    }

    /// POST the JSON payload with signature headers, retrying transient
    /// failures. Exhausting the retries is a hard, typed failure so the
    /// caller can report a broken integration instead of a silent pass.
    pub async fn post_signed(
        &self,
        url: &str,
        api_key: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, OtpError> {
        if let Err(err) = Url::parse(url) {
            return Err(OtpError::WebhookFailed {
                url: url.to_string(),
                attempts: 0,
                reason: format!("invalid verification URL: {err}"),
            });
        }
        let body = serde_json::to_vec(payload).map_err(anyhow::Error::from)?;

        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let signature = sign_payload(api_key, timestamp, &body);

            let result = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|err| OtpError::WebhookFailed {
                            url: url.to_string(),
                            attempts: attempt,
                            reason: format!("response was not JSON: {err}"),
                        });
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                    warn!("verification webhook attempt {attempt}/{} got {last_error}", self.retries);
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        "verification webhook attempt {attempt}/{} failed: {last_error}",
                        self.retries
                    );
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(self.retry_pause).await;
            }
        }

        Err(OtpError::WebhookFailed {
            url: url.to_string(),
            attempts: self.retries,
            reason: last_error,
        })
    }
}
