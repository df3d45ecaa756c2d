use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::{OtpStore, datetime_to_sql, optional_datetime_from_sql};
use crate::types::{NewOtpCode, StoredOtpCode};

/// Intermediate row with raw timestamp text, converted after the
/// statement is done with the connection.
struct CodeRow {
    otp_code_id: String,
    organization_id: String,
    task_id: Option<String>,
    workflow_id: Option<String>,
    workflow_run_id: Option<String>,
    totp_identifier: Option<String>,
    code: String,
    expired_at: Option<String>,
    created_at: String,
}

const CODE_COLUMNS: &str = "otp_code_id, organization_id, task_id, workflow_id, workflow_run_id, \
     totp_identifier, code, expired_at, created_at";

fn map_code_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CodeRow> {
    Ok(CodeRow {
        otp_code_id: row.get(0)?,
        organization_id: row.get(1)?,
        task_id: row.get(2)?,
        workflow_id: row.get(3)?,
        workflow_run_id: row.get(4)?,
        totp_identifier: row.get(5)?,
        code: row.get(6)?,
        expired_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl TryFrom<CodeRow> for StoredOtpCode {
    type Error = anyhow::Error;

    fn try_from(row: CodeRow) -> Result<Self> {
        Ok(StoredOtpCode {
            otp_code_id: row.otp_code_id,
            organization_id: row.organization_id,
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            workflow_run_id: row.workflow_run_id,
            totp_identifier: row.totp_identifier,
            code: row.code,
            expired_at: optional_datetime_from_sql(row.expired_at)?,
            created_at: super::datetime_from_sql(&row.created_at)?,
        })
    }
}

impl OtpStore {
    /// Record a pushed or manually entered code.
    pub async fn add_otp_code(&self, new_code: NewOtpCode) -> Result<StoredOtpCode> {
        let stored = StoredOtpCode {
            otp_code_id: format!("otp_{}", Uuid::new_v4().simple()),
            organization_id: new_code.organization_id,
            task_id: new_code.task_id,
            workflow_id: new_code.workflow_id,
            workflow_run_id: new_code.workflow_run_id,
            totp_identifier: new_code.totp_identifier,
            code: new_code.code,
            expired_at: new_code.expired_at,
            created_at: Utc::now(),
        };

        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO otp_codes (otp_code_id, organization_id, task_id, workflow_id, \
             workflow_run_id, totp_identifier, code, expired_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.otp_code_id,
                stored.organization_id,
                stored.task_id,
                stored.workflow_id,
                stored.workflow_run_id,
                stored.totp_identifier,
                stored.code,
                stored.expired_at.as_ref().map(datetime_to_sql),
                datetime_to_sql(&stored.created_at),
            ],
        )?;
        Ok(stored)
    }

    /// Non-expired codes for an identifier, freshest first. Run-dimension
    /// filtering is the resolver's job.
    pub async fn get_otp_codes(
        &self,
        organization_id: &str,
        totp_identifier: &str,
    ) -> Result<Vec<StoredOtpCode>> {
        let now = datetime_to_sql(&Utc::now());
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {CODE_COLUMNS} FROM otp_codes \
             WHERE organization_id = ?1 AND totp_identifier = ?2 \
               AND (expired_at IS NULL OR expired_at > ?3) \
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![organization_id, totp_identifier, now], map_code_row)?;

        let mut codes = Vec::new();
        for row in rows {
            codes.push(StoredOtpCode::try_from(row?)?);
        }
        Ok(codes)
    }

    /// Non-expired codes attached directly to a task or workflow run,
    /// freshest first. The manual-entry path for runs with no TOTP
    /// integration configured.
    pub async fn get_otp_codes_by_run(
        &self,
        organization_id: &str,
        task_id: Option<&str>,
        workflow_run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredOtpCode>> {
        let now = datetime_to_sql(&Utc::now());
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {CODE_COLUMNS} FROM otp_codes \
             WHERE organization_id = ?1 \
               AND ((?2 IS NOT NULL AND task_id = ?2) \
                 OR (?3 IS NOT NULL AND workflow_run_id = ?3)) \
               AND (expired_at IS NULL OR expired_at > ?4) \
             ORDER BY created_at DESC LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![organization_id, task_id, workflow_run_id, now, limit as i64],
            map_code_row,
        )?;

        let mut codes = Vec::new();
        for row in rows {
            codes.push(StoredOtpCode::try_from(row?)?);
        }
        Ok(codes)
    }
}
