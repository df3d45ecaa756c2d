use thiserror::Error;

/// Failures that terminate a poll. Everything softer (vault misses,
/// notification sends, waiting-state writes) is logged and swallowed at
/// the call site instead of surfacing here.
#[derive(Debug, Error)]
pub enum OtpError {
    /// The deadline passed without any source producing a code. The 2FA
    /// step failed because nobody supplied a code in time.
    #[error("no verification code arrived within {waited_secs}s")]
    NoCodeFound { waited_secs: u64 },

    /// The verification webhook could not be reached after the configured
    /// retries. Distinct from `NoCodeFound` so callers can report a broken
    /// integration rather than a user who never typed a code.
    #[error("verification webhook {url} failed after {attempts} attempts: {reason}")]
    WebhookFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Storage or collaborator failure that is fatal to the poll.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
