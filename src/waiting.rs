//! Keeps the persisted "waiting for verification code" flag and the
//! notification side-channel in step with the poll. Every failure in
//! here is cosmetic to the poll itself, so nothing propagates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::notify::{
    NotificationEvent, NotificationRegistry, VERIFICATION_CODE_REQUIRED,
    VERIFICATION_CODE_RESOLVED,
};
use crate::store::OtpStore;
use crate::types::OtpPollContext;

pub struct WaitingStateTracker {
    store: Arc<OtpStore>,
    notifier: Arc<NotificationRegistry>,
}

/// The poll must survive a failed UI-facing side effect; log and move on.
fn best_effort(what: &str, result: anyhow::Result<()>) {
    if let Err(err) = result {
        warn!("best-effort step failed ({what}): {err:#}");
    }
}

impl WaitingStateTracker {
    pub fn new(store: Arc<OtpStore>, notifier: Arc<NotificationRegistry>) -> Self {
        Self { store, notifier }
    }

    /// Mark the run as blocked on a code and tell the UI. No-op when a
    /// webhook is configured: nobody needs prompting then.
    pub async fn set(&self, ctx: &OtpPollContext, started_at: DateTime<Utc>) {
        if !ctx.needs_manual_input() {
            return;
        }
        best_effort(
            "mark run waiting for verification code",
            self.write_state(ctx, true, Some(started_at)).await,
        );
        self.notifier
            .publish(NotificationEvent::for_poll(VERIFICATION_CODE_REQUIRED, ctx))
            .await;
    }

    /// Mirror of `set`: unmark and retract. Runs on every poll exit path.
    pub async fn clear(&self, ctx: &OtpPollContext) {
        if !ctx.needs_manual_input() {
            return;
        }
        best_effort(
            "clear run waiting for verification code",
            self.write_state(ctx, false, None).await,
        );
        self.notifier
            .publish(NotificationEvent::for_poll(VERIFICATION_CODE_RESOLVED, ctx))
            .await;
    }

    /// The workflow-run row wins when both ids are present; a context
    /// with neither has nowhere to record the flag.
    async fn write_state(
        &self,
        ctx: &OtpPollContext,
        waiting: bool,
        started_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(workflow_run_id) = &ctx.workflow_run_id {
            self.store
                .update_workflow_run_verification_state(
                    &ctx.organization_id,
                    workflow_run_id,
                    ctx.workflow_id.as_deref(),
                    ctx.workflow_permanent_id.as_deref(),
                    waiting,
                    ctx.totp_identifier.as_deref(),
                    started_at,
                )
                .await
        } else if let Some(task_id) = &ctx.task_id {
            self.store
                .update_task_verification_state(
                    &ctx.organization_id,
                    task_id,
                    waiting,
                    ctx.totp_identifier.as_deref(),
                    started_at,
                )
                .await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    async fn tracker() -> (Arc<OtpStore>, Arc<NotificationRegistry>, WaitingStateTracker) {
        let store = Arc::new(test_store().await);
        let notifier = Arc::new(NotificationRegistry::new());
        let tracker = WaitingStateTracker::new(Arc::clone(&store), Arc::clone(&notifier));
        (store, notifier, tracker)
    }

    #[tokio::test]
    async fn set_and_clear_update_task_row_and_publish() {
        let (store, notifier, tracker) = tracker().await;
        let mut rx = notifier.subscribe("org_1").await;
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            None,
            Some("user@example.com".into()),
        );

        tracker.set(&ctx, Utc::now()).await;
        let state = store
            .get_task_verification_state("tsk_1")
            .await
            .unwrap()
            .unwrap();
        assert!(state.waiting);
        assert_eq!(state.totp_identifier.as_deref(), Some("user@example.com"));
        assert!(state.polling_started_at.is_some());
        assert_eq!(rx.recv().await.unwrap().event, VERIFICATION_CODE_REQUIRED);

        tracker.clear(&ctx).await;
        let state = store
            .get_task_verification_state("tsk_1")
            .await
            .unwrap()
            .unwrap();
        assert!(!state.waiting);
        assert_eq!(rx.recv().await.unwrap().event, VERIFICATION_CODE_RESOLVED);
    }

    #[tokio::test]
    async fn workflow_run_row_wins_over_task_row() {
        let (store, _notifier, tracker) = tracker().await;
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            Some("wf_1".into()),
            Some("wfr_1".into()),
            Some("wpid_1".into()),
            None,
            None,
        );

        tracker.set(&ctx, Utc::now()).await;
        assert!(store
            .get_workflow_run_verification_state("wfr_1")
            .await
            .unwrap()
            .unwrap()
            .waiting);
        assert!(store
            .get_task_verification_state("tsk_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn webhook_contexts_skip_waiting_state_entirely() {
        let (store, notifier, tracker) = tracker().await;
        let mut rx = notifier.subscribe("org_1").await;
        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            Some("https://2fa.example.com/code".into()),
            None,
        );

        tracker.set(&ctx, Utc::now()).await;
        tracker.clear(&ctx).await;
        assert!(store
            .get_task_verification_state("tsk_1")
            .await
            .unwrap()
            .is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn contexts_without_run_ids_still_publish() {
        let (_store, notifier, tracker) = tracker().await;
        let mut rx = notifier.subscribe("org_1").await;
        let ctx = OtpPollContext::new("org_1", None, None, None, None, None, None);

        tracker.set(&ctx, Utc::now()).await;
        assert_eq!(rx.recv().await.unwrap().event, VERIFICATION_CODE_REQUIRED);
    }
}
