use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use super::{OtpStore, datetime_to_sql};

impl OtpStore {
    /// Attach one resolved parameter value (usually a credential bundle
    /// object) to a workflow run.
    pub async fn add_run_parameter_value(
        &self,
        workflow_run_id: &str,
        value: &Value,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO workflow_run_parameters (workflow_run_id, value_json, created_at) \
             VALUES (?1, ?2, ?3)",
            params![
                workflow_run_id,
                serde_json::to_string(value)?,
                datetime_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// All parameter values for a run, in insertion order.
    pub async fn get_run_parameter_values(&self, workflow_run_id: &str) -> Result<Vec<Value>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT value_json FROM workflow_run_parameters WHERE workflow_run_id = ?1 \
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([workflow_run_id], |row| row.get::<_, String>(0))?;

        let mut values = Vec::new();
        for raw in rows {
            let raw = raw?;
            values.push(
                serde_json::from_str(&raw)
                    .with_context(|| format!("bad parameter JSON for run {workflow_run_id}"))?,
            );
        }
        Ok(values)
    }
}
