//! Best-effort notification side-channel. UI surfaces subscribe per
//! organization to learn when a run starts or stops waiting on a
//! verification code. One owned registry object, no module globals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use crate::types::OtpPollContext;

pub const VERIFICATION_CODE_REQUIRED: &str = "verification_code_required";
pub const VERIFICATION_CODE_RESOLVED: &str = "verification_code_resolved";

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event: String,
    pub organization_id: String,
    pub task_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub totp_identifier: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn for_poll(event: &str, ctx: &OtpPollContext) -> Self {
        Self {
            event: event.to_string(),
            organization_id: ctx.organization_id.clone(),
            task_id: ctx.task_id.clone(),
            workflow_run_id: ctx.workflow_run_id.clone(),
            totp_identifier: ctx.totp_identifier.clone(),
            occurred_at: Utc::now(),
        }
    }
}

pub struct NotificationRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<NotificationEvent>>>,
    capacity: usize,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: 64,
        }
    }

    pub async fn subscribe(&self, organization_id: &str) -> broadcast::Receiver<NotificationEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(organization_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Fire-and-forget: an event for an organization nobody subscribed to
    /// is dropped on the floor.
    pub async fn publish(&self, event: NotificationEvent) {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(&event.organization_id) {
            let _ = tx.send(event); // Ignored if no receivers
        }
    }

    pub async fn remove(&self, organization_id: &str) {
        let mut channels = self.channels.lock().await;
        channels.remove(organization_id);
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
