//! Encrypted at-rest storage for credential secrets (TOTP shared
//! secrets and friends). Values are AES-256-GCM encrypted with a
//! machine-bound key, so a copied database file is useless elsewhere.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;
use hmac::Mac;
use rusqlite::Connection;
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

type HmacSha256 = hmac::Hmac<Sha256>;

pub struct CredentialVault {
    db: Arc<Mutex<Connection>>,
    cipher: Aes256Gcm,
}

/// HMAC-SHA256(hostname + username, "codegate-credentials-v1"): stable
/// across restarts, tied to the local machine and user.
fn derive_vault_key() -> [u8; 32] {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"codegate-credentials-v1")
        .expect("HMAC can take key of any size");
    mac.update(hostname.as_bytes());
    mac.update(username.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    key
}

impl CredentialVault {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        let key = derive_vault_key();
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is valid for AES-256");
        Self { db, cipher }
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS credential_secrets (
                secret_key TEXT PRIMARY KEY,
                secret_value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// base64(nonce || ciphertext)
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("base64 decode failed: {}", e))?;

        if combined.len() < 13 {
            return Err(anyhow::anyhow!("encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("UTF-8 decode failed: {}", e))
    }

    pub async fn store_secret(&self, secret_key: &str, value: &str) -> Result<()> {
        let encrypted = self.encrypt(value)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credential_secrets (secret_key, secret_value) VALUES (?1, ?2)
             ON CONFLICT(secret_key) DO UPDATE SET secret_value=excluded.secret_value",
            (secret_key, &encrypted),
        )?;
        Ok(())
    }

    /// Original plaintext for a secret reference, or None when the key is
    /// unknown or the stored value cannot be decrypted. Lookup problems
    /// are logged, never raised: a missing secret just means the caller
    /// moves on to the next code source.
    pub async fn reveal_secret(&self, secret_key: &str) -> Option<String> {
        let db = self.db.lock().await;
        let stored: Option<String> = match db
            .query_row(
                "SELECT secret_value FROM credential_secrets WHERE secret_key = ?1",
                [secret_key],
                |row| row.get(0),
            ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                warn!("vault lookup for '{secret_key}' failed: {err}");
                None
            }
        };
        drop(db);

        let stored = stored?;
        match self.decrypt(&stored) {
            Ok(plaintext) => Some(plaintext),
            Err(err) => {
                warn!("vault value for '{secret_key}' failed to decrypt: {err}");
                None
            }
        }
    }

    pub async fn remove_secret(&self, secret_key: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM credential_secrets WHERE secret_key = ?1",
            [secret_key],
        )?;
        Ok(())
    }
}
