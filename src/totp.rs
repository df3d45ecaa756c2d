//! Time-based one-time passwords (RFC 6238) derived from credential
//! secrets, so runs with a stored shared secret never wait on a webhook
//! or a human.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use data_encoding::BASE32_NOPAD;
use hmac::Mac;
use sha1::Sha1;
use tracing::warn;

use crate::extract::normalize_key;
use crate::store::OtpStore;
use crate::types::OtpValue;
use crate::vault::CredentialVault;

type HmacSha1 = hmac::Hmac<Sha1>;

pub const TOTP_STEP_SECS: u64 = 30;
pub const TOTP_DIGITS: u32 = 6;

/// Current 6-digit code for a base32-encoded shared secret.
pub fn generate_totp(secret_b32: &str) -> Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    generate_totp_at(secret_b32, now)
}

/// Code for an explicit unix timestamp. Secrets are accepted with
/// whitespace, padding, and either case, as issuers format them all
/// three ways.
pub fn generate_totp_at(secret_b32: &str, unix_secs: u64) -> Result<String> {
    let normalized: String = secret_b32
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(anyhow!("TOTP secret is empty"));
    }
    let key = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|err| anyhow!("TOTP secret is not valid base32: {err}"))?;

    let counter = unix_secs / TOTP_STEP_SECS;
    let mut mac = <HmacSha1 as Mac>::new_from_slice(&key)
        .map_err(|_| anyhow!("TOTP secret decodes to an unusable key"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Derive a code directly from the run's credential bundle, if any entry
/// carries a TOTP secret reference. Checked before any polling, since a
/// locally computable code beats a network round-trip.
///
/// Malformed entries are skipped with a warning; the first secret that
/// generates cleanly wins. `None` run id means there is nothing to look
/// up.
pub async fn try_generate_totp_from_credential(
    store: &OtpStore,
    vault: &CredentialVault,
    workflow_run_id: Option<&str>,
) -> Option<OtpValue> {
    let run_id = workflow_run_id?;
    let bundles = match store.get_run_parameter_values(run_id).await {
        Ok(bundles) => bundles,
        Err(err) => {
            warn!("failed to load parameter values for run {run_id}: {err:#}");
            return None;
        }
    };

    for bundle in &bundles {
        let Some(map) = bundle.as_object() else {
            continue;
        };
        for (key, value) in map {
            if normalize_key(key) != "totp" {
                continue;
            }
            let Some(secret_key) = value.as_str() else {
                continue;
            };
            let Some(secret) = vault.reveal_secret(secret_key).await else {
                continue;
            };
            match generate_totp(&secret) {
                Ok(code) => return Some(OtpValue::totp(code)),
                Err(err) => {
                    warn!("credential TOTP secret {secret_key} failed to generate: {err:#}");
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    // RFC 6238 Appendix B reference secret ("12345678901234567890").
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_sha1_vectors() {
        // Appendix B values, truncated from 8 to 6 digits.
        assert_eq!(generate_totp_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(generate_totp_at(RFC_SECRET, 1111111109).unwrap(), "081804");
        assert_eq!(generate_totp_at(RFC_SECRET, 1234567890).unwrap(), "005924");
        assert_eq!(generate_totp_at(RFC_SECRET, 2000000000).unwrap(), "279037");
    }

    #[test]
    fn secret_formatting_is_tolerated() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq";
        assert_eq!(generate_totp_at(spaced, 59).unwrap(), "287082");
        let padded = format!("{RFC_SECRET}====");
        assert_eq!(generate_totp_at(&padded, 59).unwrap(), "287082");
    }

    #[test]
    fn same_step_same_code() {
        let a = generate_totp_at(RFC_SECRET, 1_700_000_011).unwrap();
        let b = generate_totp_at(RFC_SECRET, 1_700_000_029).unwrap();
        assert_eq!(a, b, "timestamps in one 30s step share a code");
    }

    #[test]
    fn bad_secrets_are_rejected() {
        assert!(generate_totp_at("", 59).is_err());
        assert!(generate_totp_at("   ", 59).is_err());
        assert!(generate_totp_at("not!base32@", 59).is_err());
    }

    async fn test_fixtures() -> (OtpStore, CredentialVault) {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().expect("memory db")));
        let store = OtpStore::new(Arc::clone(&db));
        store.initialize().await.expect("store schema");
        let vault = CredentialVault::new(db);
        vault.initialize().await.expect("vault schema");
        (store, vault)
    }

    #[tokio::test]
    async fn no_run_id_means_no_code() {
        let (store, vault) = test_fixtures().await;
        assert!(try_generate_totp_from_credential(&store, &vault, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn credential_secret_generates_reference_code() {
        let (store, vault) = test_fixtures().await;
        vault.store_secret("cred_totp_1", RFC_SECRET).await.unwrap();
        store
            .add_run_parameter_value(
                "wfr_1",
                &json!({"username": "jdoe", "totp": "cred_totp_1"}),
            )
            .await
            .unwrap();

        let code = try_generate_totp_from_credential(&store, &vault, Some("wfr_1"))
            .await
            .expect("credential secret should yield a code");
        assert_eq!(code.value, generate_totp(RFC_SECRET).unwrap());
    }

    #[tokio::test]
    async fn malformed_secret_is_skipped_for_the_next_candidate() {
        let (store, vault) = test_fixtures().await;
        vault.store_secret("cred_bad", "!!notbase32!!").await.unwrap();
        vault.store_secret("cred_good", RFC_SECRET).await.unwrap();
        store
            .add_run_parameter_value("wfr_2", &json!({"totp": "cred_bad"}))
            .await
            .unwrap();
        store
            .add_run_parameter_value("wfr_2", &json!({"totp": "cred_good"}))
            .await
            .unwrap();

        let code = try_generate_totp_from_credential(&store, &vault, Some("wfr_2"))
            .await
            .expect("second candidate should generate");
        assert_eq!(code.value, generate_totp(RFC_SECRET).unwrap());
    }

    #[tokio::test]
    async fn unrelated_parameters_are_ignored() {
        let (store, vault) = test_fixtures().await;
        store
            .add_run_parameter_value("wfr_3", &json!({"password": "hunter2"}))
            .await
            .unwrap();
        store
            .add_run_parameter_value("wfr_3", &json!("plain string value"))
            .await
            .unwrap();
        assert!(
            try_generate_totp_from_credential(&store, &vault, Some("wfr_3"))
                .await
                .is_none()
        );
    }
}
