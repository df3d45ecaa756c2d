//! The polling state machine. One cooperative task per call; suspends
//! only at the interval sleep and at collaborator I/O. Holds no locks
//! across suspension points and shares no mutable state between
//! concurrent polls.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::OtpConfig;
use crate::error::OtpError;
use crate::resolver::OtpSourceResolver;
use crate::store::OtpStore;
use crate::types::{OtpPollContext, OtpSource, OtpValue};
use crate::waiting::WaitingStateTracker;

/// Token type the webhook precondition looks up.
pub const API_TOKEN_TYPE: &str = "api";

pub struct OtpPoller {
    config: OtpConfig,
    store: Arc<OtpStore>,
    resolver: OtpSourceResolver,
    tracker: Arc<WaitingStateTracker>,
}

impl OtpPoller {
    pub fn new(
        config: OtpConfig,
        store: Arc<OtpStore>,
        resolver: OtpSourceResolver,
        tracker: Arc<WaitingStateTracker>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            tracker,
        }
    }

    /// Poll until a code resolves or the deadline passes.
    ///
    /// `Ok(Some(code))` on resolution; `Ok(None)` when the poll cannot
    /// start (webhook configured but no usable organization API token);
    /// `Err(NoCodeFound)` on timeout; `Err(WebhookFailed)` when the
    /// verification endpoint stays unreachable.
    ///
    /// Whatever waiting state `set` recorded is cleared exactly once on
    /// every exit path. If the poll future itself is cancelled, a drop
    /// guard spawns the clear instead.
    pub async fn poll_otp_value(&self, ctx: &OtpPollContext) -> Result<Option<OtpValue>, OtpError> {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.poll_timeout;

        let api_token = match ctx.source() {
            OtpSource::Webhook { url } => {
                match self
                    .store
                    .get_valid_org_auth_token(&ctx.organization_id, API_TOKEN_TYPE)
                    .await
                {
                    Ok(Some(token)) => Some(token.token),
                    Ok(None) => {
                        error!(
                            "organization {} has no valid API token; cannot sign requests to {url}",
                            ctx.organization_id
                        );
                        return Ok(None);
                    }
                    Err(err) => {
                        error!(
                            "token lookup for organization {} failed: {err:#}",
                            ctx.organization_id
                        );
                        return Ok(None);
                    }
                }
            }
            _ => None,
        };

        self.tracker.set(ctx, started_at).await;
        let mut guard = ClearGuard::armed(Arc::clone(&self.tracker), ctx.clone());

        let result = self.run_loop(ctx, deadline, api_token.as_deref()).await;

        guard.defuse();
        self.tracker.clear(ctx).await;
        result
    }

    async fn run_loop(
        &self,
        ctx: &OtpPollContext,
        deadline: Instant,
        api_token: Option<&str>,
    ) -> Result<Option<OtpValue>, OtpError> {
        info!(
            "polling for verification code (org {}, task {:?}, run {:?})",
            ctx.organization_id, ctx.task_id, ctx.workflow_run_id
        );

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            if Instant::now() > deadline {
                warn!(
                    "gave up waiting for verification code after {}s (org {})",
                    self.config.poll_timeout.as_secs(),
                    ctx.organization_id
                );
                return Err(OtpError::NoCodeFound {
                    waited_secs: self.config.poll_timeout.as_secs(),
                });
            }

            match self.resolver.resolve(ctx, api_token).await? {
                Some(code) => {
                    info!(
                        "verification code resolved (org {}, type {:?})",
                        ctx.organization_id, code.otp_type
                    );
                    return Ok(Some(code));
                }
                None => debug!("no verification code yet, polling again"),
            }
        }
    }
}

/// Runs the waiting-state clear even when the poll future is dropped
/// mid-loop (caller cancellation). Normal exits defuse it first so the
/// clear runs exactly once.
struct ClearGuard {
    tracker: Arc<WaitingStateTracker>,
    ctx: Option<OtpPollContext>,
}

impl ClearGuard {
    fn armed(tracker: Arc<WaitingStateTracker>, ctx: OtpPollContext) -> Self {
        Self {
            tracker,
            ctx: Some(ctx),
        }
    }

    fn defuse(&mut self) {
        self.ctx = None;
    }
}

impl Drop for ClearGuard {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let tracker = Arc::clone(&self.tracker);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tracker.clear(&ctx).await;
            });
        }
    }
}
