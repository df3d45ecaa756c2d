use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{OtpStore, datetime_to_sql, optional_datetime_from_sql};

/// Persisted "blocked on a verification code" flag on a task or
/// workflow-run row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationState {
    pub waiting: bool,
    pub totp_identifier: Option<String>,
    pub polling_started_at: Option<DateTime<Utc>>,
}

impl OtpStore {
    /// Upsert, so the tracker works even when the task row has not been
    /// registered ahead of time. Idempotent: concurrent polls on the same
    /// task write the same flag.
    pub async fn update_task_verification_state(
        &self,
        organization_id: &str,
        task_id: &str,
        waiting: bool,
        totp_identifier: Option<&str>,
        polling_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO tasks (task_id, organization_id, waiting_for_verification_code, \
             totp_identifier, code_polling_started_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(task_id) DO UPDATE SET \
               waiting_for_verification_code=excluded.waiting_for_verification_code, \
               totp_identifier=excluded.totp_identifier, \
               code_polling_started_at=excluded.code_polling_started_at",
            params![
                task_id,
                organization_id,
                waiting as i32,
                totp_identifier,
                polling_started_at.as_ref().map(datetime_to_sql),
            ],
        )?;
        Ok(())
    }

    pub async fn update_workflow_run_verification_state(
        &self,
        organization_id: &str,
        workflow_run_id: &str,
        workflow_id: Option<&str>,
        workflow_permanent_id: Option<&str>,
        waiting: bool,
        totp_identifier: Option<&str>,
        polling_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO workflow_runs (workflow_run_id, organization_id, workflow_id, \
             workflow_permanent_id, waiting_for_verification_code, totp_identifier, \
             code_polling_started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(workflow_run_id) DO UPDATE SET \
               waiting_for_verification_code=excluded.waiting_for_verification_code, \
               totp_identifier=excluded.totp_identifier, \
               code_polling_started_at=excluded.code_polling_started_at",
            params![
                workflow_run_id,
                organization_id,
                workflow_id,
                workflow_permanent_id,
                waiting as i32,
                totp_identifier,
                polling_started_at.as_ref().map(datetime_to_sql),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task_verification_state(
        &self,
        task_id: &str,
    ) -> Result<Option<VerificationState>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT waiting_for_verification_code, totp_identifier, code_polling_started_at \
             FROM tasks WHERE task_id = ?1",
        )?;
        let mut rows = stmt.query_map([task_id], |row| {
            Ok((
                row.get::<_, i32>(0)? != 0,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (waiting, totp_identifier, started) = row?;
                Ok(Some(VerificationState {
                    waiting,
                    totp_identifier,
                    polling_started_at: optional_datetime_from_sql(started)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_workflow_run_verification_state(
        &self,
        workflow_run_id: &str,
    ) -> Result<Option<VerificationState>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT waiting_for_verification_code, totp_identifier, code_polling_started_at \
             FROM workflow_runs WHERE workflow_run_id = ?1",
        )?;
        let mut rows = stmt.query_map([workflow_run_id], |row| {
            Ok((
                row.get::<_, i32>(0)? != 0,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (waiting, totp_identifier, started) = row?;
                Ok(Some(VerificationState {
                    waiting,
                    totp_identifier,
                    polling_started_at: optional_datetime_from_sql(started)?,
                }))
            }
            None => Ok(None),
        }
    }
}
