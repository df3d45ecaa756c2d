//! sqlite persistence for submitted codes, organization API tokens,
//! task/workflow-run verification state, and run parameter bundles.

mod codes;
mod params;
mod tokens;
mod waiting;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use tokens::OrgAuthToken;
pub use waiting::VerificationState;

pub struct OtpStore {
    db: Arc<Mutex<Connection>>,
}

impl OtpStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS otp_codes (
                otp_code_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                task_id TEXT,
                workflow_id TEXT,
                workflow_run_id TEXT,
                totp_identifier TEXT,
                code TEXT NOT NULL,
                expired_at TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS org_auth_tokens (
                token_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                token_type TEXT NOT NULL,
                token TEXT NOT NULL,
                valid INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                waiting_for_verification_code INTEGER NOT NULL DEFAULT 0,
                totp_identifier TEXT,
                code_polling_started_at TEXT
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS workflow_runs (
                workflow_run_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                workflow_id TEXT,
                workflow_permanent_id TEXT,
                waiting_for_verification_code INTEGER NOT NULL DEFAULT 0,
                totp_identifier TEXT,
                code_polling_started_at TEXT
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS workflow_run_parameters (
                workflow_run_id TEXT NOT NULL,
                value_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

/// RFC 3339 round-trip for TEXT timestamp columns.
pub(crate) fn datetime_to_sql(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn datetime_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("bad timestamp {raw:?} in store: {err}"))
}

pub(crate) fn optional_datetime_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| datetime_from_sql(&s)).transpose()
}

#[cfg(test)]
pub(crate) async fn test_store() -> OtpStore {
    let db = Connection::open_in_memory().expect("in-memory db");
    let store = OtpStore::new(Arc::new(Mutex::new(db)));
    store.initialize().await.expect("init store schema");
    store
}
