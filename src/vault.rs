// =============================================================================
// Credential Vault — encrypted per-user exchange API keys
// =============================================================================
//
// SECURITY: plaintext credentials exist only in memory, on the way in
// (submit) and on the way out (decrypt for signing). At rest each value is
// AES-256-GCM ciphertext with the 12-byte nonce prepended, hex-encoded.
// Nothing in this module logs or serializes plaintext.
// =============================================================================

use std::sync::Arc;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::store::{self, KvStore};

const NONCE_LEN: usize = 12;

/// Persisted credential record. Key material is ciphertext only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub user_id: String,
    pub ciphertext_key: String,
    pub ciphertext_secret: String,
    pub valid: bool,
    pub last_validated_at: Option<String>,
    pub created_at: String,
}

/// Masked view safe to return to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyMeta {
    pub user_id: String,
    pub key_preview: String,
    pub valid: bool,
    pub last_validated_at: Option<String>,
    pub created_at: String,
}

pub struct CredentialVault {
    cipher: Aes256Gcm,
    store: Arc<dyn KvStore>,
}

impl CredentialVault {
    pub fn new(encryption_key: [u8; 32], store: Arc<dyn KvStore>) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&encryption_key));
        Self { cipher, store }
    }

    fn record_key(user_id: &str) -> String {
        format!("apikey:{user_id}")
    }

    // ── Cipher primitives ───────────────────────────────────────────────

    fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::Internal("credential encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    fn decrypt_value(&self, encoded: &str) -> EngineResult<String> {
        let raw = hex::decode(encoded)
            .map_err(|_| EngineError::Credential("stored credential is corrupt".into()))?;
        if raw.len() <= NONCE_LEN {
            return Err(EngineError::Credential("stored credential is corrupt".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EngineError::Credential("credential decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| EngineError::Credential("stored credential is corrupt".into()))
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Encrypt and persist credentials for a user, replacing any existing
    /// record. `valid` reflects the outcome of the caller's validate-on-submit
    /// check against the exchange.
    pub async fn store_credentials(
        &self,
        user_id: &str,
        api_key: &str,
        api_secret: &str,
        valid: bool,
    ) -> EngineResult<()> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(EngineError::Validation("api key and secret are required".into()));
        }

        let now = Utc::now().to_rfc3339();
        let record = ApiKeyRecord {
            user_id: user_id.to_string(),
            ciphertext_key: self.encrypt(api_key)?,
            ciphertext_secret: self.encrypt(api_secret)?,
            valid,
            last_validated_at: valid.then(|| now.clone()),
            created_at: now,
        };

        store::put_json(self.store.as_ref(), &Self::record_key(user_id), &record).await?;
        info!(user_id, valid, "exchange credentials stored");
        Ok(())
    }

    /// Decrypt the credentials for `user_id`. Errors with a credential kind
    /// when no record exists or the record has been marked invalid.
    pub async fn decrypt(&self, user_id: &str) -> EngineResult<(String, String)> {
        let record = self.load(user_id).await?;
        if !record.valid {
            return Err(EngineError::Credential(
                "stored api key failed its last validation".into(),
            ));
        }
        let key = self.decrypt_value(&record.ciphertext_key)?;
        let secret = self.decrypt_value(&record.ciphertext_secret)?;
        Ok((key, secret))
    }

    /// Load the raw record, decrypting nothing.
    pub async fn load(&self, user_id: &str) -> EngineResult<ApiKeyRecord> {
        store::get_json(self.store.as_ref(), &Self::record_key(user_id))
            .await?
            .ok_or_else(|| EngineError::Credential("no api key on file".into()))
    }

    /// Masked metadata for API responses. The preview shows the first four
    /// characters of the decrypted key.
    pub async fn meta(&self, user_id: &str) -> EngineResult<ApiKeyMeta> {
        let record = self.load(user_id).await?;
        let key = self.decrypt_value(&record.ciphertext_key)?;
        let preview: String = key.chars().take(4).collect();
        Ok(ApiKeyMeta {
            user_id: record.user_id,
            key_preview: format!("{preview}****"),
            valid: record.valid,
            last_validated_at: record.last_validated_at,
            created_at: record.created_at,
        })
    }

    /// Record the outcome of a re-validation.
    pub async fn set_valid(&self, user_id: &str, valid: bool) -> EngineResult<()> {
        let mut record = self.load(user_id).await?;
        record.valid = valid;
        record.last_validated_at = Some(Utc::now().to_rfc3339());
        store::put_json(self.store.as_ref(), &Self::record_key(user_id), &record).await
    }

    pub async fn delete(&self, user_id: &str) -> EngineResult<()> {
        self.store.delete(&Self::record_key(user_id)).await?;
        info!(user_id, "exchange credentials deleted");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("cipher", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn vault() -> CredentialVault {
        CredentialVault::new([7u8; 32], Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn store_then_decrypt_roundtrip() {
        let v = vault();
        v.store_credentials("u1", "MYKEY-ABC", "MYSECRET-XYZ", true)
            .await
            .unwrap();

        let (key, secret) = v.decrypt("u1").await.unwrap();
        assert_eq!(key, "MYKEY-ABC");
        assert_eq!(secret, "MYSECRET-XYZ");
    }

    #[tokio::test]
    async fn ciphertext_differs_from_plaintext() {
        let v = vault();
        v.store_credentials("u1", "MYKEY-ABC", "MYSECRET-XYZ", true)
            .await
            .unwrap();

        let record = v.load("u1").await.unwrap();
        assert!(!record.ciphertext_key.contains("MYKEY"));
        assert!(!record.ciphertext_secret.contains("MYSECRET"));
        // Same plaintext encrypts differently under fresh nonces.
        assert_ne!(record.ciphertext_key, record.ciphertext_secret);
    }

    #[tokio::test]
    async fn invalid_record_refuses_decrypt() {
        let v = vault();
        v.store_credentials("u1", "k", "s", false).await.unwrap();
        assert!(matches!(
            v.decrypt("u1").await,
            Err(EngineError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn missing_record_is_credential_error() {
        let v = vault();
        assert!(matches!(
            v.decrypt("nobody").await,
            Err(EngineError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn meta_masks_key() {
        let v = vault();
        v.store_credentials("u1", "ABCDEFGH", "secret", true)
            .await
            .unwrap();
        let meta = v.meta("u1").await.unwrap();
        assert_eq!(meta.key_preview, "ABCD****");
    }

    #[tokio::test]
    async fn wrong_key_fails_decrypt() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let v1 = CredentialVault::new([1u8; 32], store.clone());
        v1.store_credentials("u1", "k", "s", true).await.unwrap();

        let v2 = CredentialVault::new([2u8; 32], store);
        assert!(matches!(
            v2.decrypt("u1").await,
            Err(EngineError::Credential(_))
        ));
    }
}
