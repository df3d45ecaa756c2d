use std::time::Duration;

use serde::Deserialize;

/// Tunables for the polling loop and the webhook client. The interval
/// and digit-length bounds are empirically tuned constants, not derived
/// values; override them through configuration if a deployment needs to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtpConfig {
    /// Pause between resolution passes.
    pub poll_interval: Duration,
    /// Total budget for one poll, measured from poll start. Checked once
    /// per iteration, so detection can overshoot by up to one interval.
    pub poll_timeout: Duration,
    /// Attempts per webhook POST before the pass fails hard.
    pub webhook_retries: u32,
    /// Per-request timeout on the webhook client.
    pub webhook_timeout: Duration,
    /// Pause between webhook retry attempts.
    pub webhook_retry_pause: Duration,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(10 * 60),
            webhook_retries: 3,
            webhook_timeout: Duration::from_secs(10),
            webhook_retry_pause: Duration::from_millis(500),
        }
    }
}
