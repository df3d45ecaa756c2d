use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{OtpStore, datetime_to_sql, optional_datetime_from_sql};

/// Organization API key used to sign outgoing webhook requests.
#[derive(Debug, Clone)]
pub struct OrgAuthToken {
    pub token_id: String,
    pub organization_id: String,
    pub token_type: String,
    pub token: String,
    pub valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OtpStore {
    pub async fn create_org_auth_token(
        &self,
        organization_id: &str,
        token_type: &str,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<OrgAuthToken> {
        let record = OrgAuthToken {
            token_id: format!("oat_{}", Uuid::new_v4().simple()),
            organization_id: organization_id.to_string(),
            token_type: token_type.to_string(),
            token: token.to_string(),
            valid: true,
            expires_at,
        };
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO org_auth_tokens (token_id, organization_id, token_type, token, valid, \
             expires_at, created_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
            params![
                record.token_id,
                record.organization_id,
                record.token_type,
                record.token,
                record.expires_at.as_ref().map(datetime_to_sql),
                datetime_to_sql(&Utc::now()),
            ],
        )?;
        Ok(record)
    }

    pub async fn invalidate_org_auth_token(&self, token_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let updated = db.execute(
            "UPDATE org_auth_tokens SET valid = 0 WHERE token_id = ?1",
            [token_id],
        )?;
        Ok(updated > 0)
    }

    /// Newest token of the given type that is flagged valid and not past
    /// its expiry.
    pub async fn get_valid_org_auth_token(
        &self,
        organization_id: &str,
        token_type: &str,
    ) -> Result<Option<OrgAuthToken>> {
        let now = datetime_to_sql(&Utc::now());
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT token_id, organization_id, token_type, token, valid, expires_at \
             FROM org_auth_tokens \
             WHERE organization_id = ?1 AND token_type = ?2 AND valid = 1 \
               AND (expires_at IS NULL OR expires_at > ?3) \
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![organization_id, token_type, now], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i32>(4)? != 0,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        match rows.next() {
            Some(row) => {
                let (token_id, organization_id, token_type, token, valid, expires_at) = row?;
                Ok(Some(OrgAuthToken {
                    token_id,
                    organization_id,
                    token_type,
                    token,
                    valid,
                    expires_at: optional_datetime_from_sql(expires_at)?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn valid_token_is_returned() {
        let store = test_store().await;
        store
            .create_org_auth_token("org_1", "api", "sk_live_abc", None)
            .await
            .unwrap();
        let token = store
            .get_valid_org_auth_token("org_1", "api")
            .await
            .unwrap()
            .expect("token should be found");
        assert_eq!(token.token, "sk_live_abc");
    }

    #[tokio::test]
    async fn expired_or_invalidated_tokens_are_skipped() {
        let store = test_store().await;
        store
            .create_org_auth_token(
                "org_1",
                "api",
                "sk_expired",
                Some(Utc::now() - Duration::hours(1)),
            )
            .await
            .unwrap();
        assert!(store
            .get_valid_org_auth_token("org_1", "api")
            .await
            .unwrap()
            .is_none());

        let live = store
            .create_org_auth_token("org_1", "api", "sk_revoked", None)
            .await
            .unwrap();
        store.invalidate_org_auth_token(&live.token_id).await.unwrap();
        assert!(store
            .get_valid_org_auth_token("org_1", "api")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn token_type_and_org_must_match() {
        let store = test_store().await;
        store
            .create_org_auth_token("org_1", "webhook", "sk_other_type", None)
            .await
            .unwrap();
        assert!(store
            .get_valid_org_auth_token("org_1", "api")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_valid_org_auth_token("org_2", "webhook")
            .await
            .unwrap()
            .is_none());
    }
}
