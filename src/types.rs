use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shape of a resolved verification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpType {
    #[serde(alias = "TOTP")]
    Totp,
    #[serde(alias = "MAGIC_LINK")]
    MagicLink,
}

/// A resolved verification code, consumed once by the action layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpValue {
    pub value: String,
    pub otp_type: OtpType,
}

impl OtpValue {
    pub fn totp(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            otp_type: OtpType::Totp,
        }
    }

    pub fn magic_link(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            otp_type: OtpType::MagicLink,
        }
    }

    /// Infer the type from the value shape: URLs are magic links,
    /// everything else is treated as a numeric code.
    pub fn infer(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.starts_with("http://") || value.starts_with("https://") {
            Self::magic_link(value)
        } else {
            Self::totp(value)
        }
    }
}

/// The one resolution strategy a poll context uses, selected once at
/// construction: webhook beats identifier beats the generic run lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpSource {
    Webhook { url: String },
    Identifier { identifier: String },
    RunLookup,
}

/// Identity of one polling session. Immutable after construction and
/// never persisted.
#[derive(Debug, Clone)]
pub struct OtpPollContext {
    pub organization_id: String,
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub workflow_permanent_id: Option<String>,
    pub totp_verification_url: Option<String>,
    pub totp_identifier: Option<String>,
    source: OtpSource,
}

impl OtpPollContext {
    /// `workflow_id` and `workflow_permanent_id` are distinct identifier
    /// types; call sites pass both explicitly, neither is derived from
    /// the other. Empty strings count as absent.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organization_id: impl Into<String>,
        task_id: Option<String>,
        workflow_id: Option<String>,
        workflow_run_id: Option<String>,
        workflow_permanent_id: Option<String>,
        totp_verification_url: Option<String>,
        totp_identifier: Option<String>,
    ) -> Self {
        let totp_verification_url = non_empty(totp_verification_url);
        let totp_identifier = non_empty(totp_identifier);
        let source = match (&totp_verification_url, &totp_identifier) {
            (Some(url), _) => OtpSource::Webhook { url: url.clone() },
            (None, Some(identifier)) => OtpSource::Identifier {
                identifier: identifier.clone(),
            },
            (None, None) => OtpSource::RunLookup,
        };
        Self {
            organization_id: organization_id.into(),
            task_id: non_empty(task_id),
            workflow_id: non_empty(workflow_id),
            workflow_run_id: non_empty(workflow_run_id),
            workflow_permanent_id: non_empty(workflow_permanent_id),
            totp_verification_url,
            totp_identifier,
            source,
        }
    }

    /// Minimal context for a standalone task with no TOTP integration.
    pub fn for_task(organization_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self::new(
            organization_id,
            Some(task_id.into()),
            None,
            None,
            None,
            None,
            None,
        )
    }

    pub fn source(&self) -> &OtpSource {
        &self.source
    }

    /// True when no webhook is configured, so a human has to be prompted
    /// to submit the code and the UI must learn about the wait.
    pub fn needs_manual_input(&self) -> bool {
        self.totp_verification_url.is_none()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// A submitted code row, pushed by a webhook or entered manually.
#[derive(Debug, Clone)]
pub struct StoredOtpCode {
    pub otp_code_id: String,
    pub organization_id: String,
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub totp_identifier: Option<String>,
    pub code: String,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredOtpCode {
    /// A stored code matches the context on every run dimension it
    /// specifies; unspecified dimensions match anything.
    pub fn matches_run(&self, ctx: &OtpPollContext) -> bool {
        dimension_matches(&self.task_id, &ctx.task_id)
            && dimension_matches(&self.workflow_id, &ctx.workflow_id)
            && dimension_matches(&self.workflow_run_id, &ctx.workflow_run_id)
    }
}

fn dimension_matches(stored: &Option<String>, wanted: &Option<String>) -> bool {
    match stored {
        Some(stored) => wanted.as_deref() == Some(stored.as_str()),
        None => true,
    }
}

/// New code submission, before the store assigns id and created_at.
#[derive(Debug, Clone, Default)]
pub struct NewOtpCode {
    pub organization_id: String,
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub totp_identifier: Option<String>,
    pub code: String,
    pub expired_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(task: Option<&str>, wf: Option<&str>, run: Option<&str>) -> StoredOtpCode {
        StoredOtpCode {
            otp_code_id: "otp_1".into(),
            organization_id: "org_1".into(),
            task_id: task.map(String::from),
            workflow_id: wf.map(String::from),
            workflow_run_id: run.map(String::from),
            totp_identifier: None,
            code: "123456".into(),
            expired_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn infer_detects_magic_links() {
        assert_eq!(
            OtpValue::infer("https://example.com/login?t=abc").otp_type,
            OtpType::MagicLink
        );
        assert_eq!(OtpValue::infer("483920").otp_type, OtpType::Totp);
        assert_eq!(OtpValue::infer("483920").value, "483920");
    }

    #[test]
    fn source_prefers_webhook_over_identifier() {
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            Some("https://2fa.example.com/code".into()),
            Some("user@example.com".into()),
        );
        assert!(matches!(ctx.source(), OtpSource::Webhook { .. }));
        assert!(!ctx.needs_manual_input());
    }

    #[test]
    fn source_falls_back_to_identifier_then_run_lookup() {
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            None,
            Some("user@example.com".into()),
        );
        assert!(matches!(ctx.source(), OtpSource::Identifier { .. }));
        assert!(ctx.needs_manual_input());

        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        assert_eq!(*ctx.source(), OtpSource::RunLookup);
        assert!(ctx.needs_manual_input());
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            Some("   ".into()),
            Some(String::new()),
        );
        assert_eq!(*ctx.source(), OtpSource::RunLookup);
        assert!(ctx.needs_manual_input());
    }

    #[test]
    fn matches_run_checks_only_specified_dimensions() {
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            Some("wf_1".into()),
            Some("wfr_1".into()),
            Some("wpid_1".into()),
            None,
            None,
        );

        assert!(stored(None, None, None).matches_run(&ctx));
        assert!(stored(Some("tsk_1"), None, None).matches_run(&ctx));
        assert!(stored(Some("tsk_1"), Some("wf_1"), Some("wfr_1")).matches_run(&ctx));
        assert!(!stored(Some("tsk_2"), None, None).matches_run(&ctx));
        assert!(!stored(None, Some("wf_2"), None).matches_run(&ctx));
        assert!(!stored(None, None, Some("wfr_2")).matches_run(&ctx));
    }

    #[test]
    fn matches_run_fails_when_context_lacks_a_specified_dimension() {
        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        assert!(!stored(Some("tsk_1"), None, Some("wfr_1")).matches_run(&ctx));
    }
}
