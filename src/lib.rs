//! codegate: verification-code (OTP/2FA) resolution for browser-automation
//! agents.
//!
//! When an automated run hits a 2FA wall, something has to produce the
//! code: a TOTP secret stored with the run's credentials, a
//! caller-supplied webhook, a code pushed against an identifier, or a
//! human typing it into a UI. This crate owns that whole resolution
//! problem: the prioritized source selection, the polling state machine
//! with its deadline, the persisted waiting flag the UI watches, and the
//! notification channel that tells it when to prompt.
//!
//! The action-execution layer calls [`OtpPoller::poll_otp_value`] when a
//! page demands a code, and the standalone helpers in [`extract`] and
//! [`totp`] directly when the code is already on screen or derivable
//! locally.

pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod notify;
pub mod poller;
pub mod resolver;
pub mod store;
pub mod totp;
pub mod types;
pub mod vault;
pub mod waiting;
pub mod webhook;

pub use config::OtpConfig;
pub use error::OtpError;
pub use extract::{
    extract_totp_from_navigation_inputs, extract_totp_from_navigation_payload,
    extract_totp_from_text,
};
pub use llm::{LlmOtpParser, OtpParser, ParsedOtp};
pub use notify::{NotificationEvent, NotificationRegistry};
pub use poller::OtpPoller;
pub use resolver::OtpSourceResolver;
pub use store::{OrgAuthToken, OtpStore};
pub use totp::{generate_totp, try_generate_totp_from_credential};
pub use types::{NewOtpCode, OtpPollContext, OtpSource, OtpType, OtpValue, StoredOtpCode};
pub use vault::CredentialVault;
pub use waiting::WaitingStateTracker;
pub use webhook::WebhookClient;
