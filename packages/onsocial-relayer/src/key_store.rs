//! Pool credential loading: plaintext JSON for dev, AES-256-GCM at rest for
//! production.
//!
//! The file is an ordered list of `{account_id, public_key, secret_key}`
//! entries, one per pool slot, all for the same relayer account.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use near_crypto::{PublicKey, SecretKey};
use near_primitives::types::AccountId;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Env var holding the credential JSON directly (takes precedence over the file).
pub const KEYS_JSON_ENV: &str = "RELAYER_KEYS_JSON";
/// Env var holding the base64 AES-256 key for an encrypted credential file.
pub const ENCRYPTION_SECRET_ENV: &str = "RELAYER_KEY_ENCRYPTION_SECRET";

const AES_NONCE_LEN: usize = 12;

/// One validated pool credential.
#[derive(Clone)]
pub struct Credential {
    pub account_id: AccountId,
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(serde::Deserialize)]
struct CredentialEntry {
    account_id: String,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(alias = "private_key")]
    secret_key: String,
}

/// Credential source: a file (optionally encrypted) or inline JSON.
pub struct KeyStore {
    path: PathBuf,
    encryption_key: Option<[u8; 32]>,
}

impl KeyStore {
    pub fn new_plaintext(path: PathBuf) -> Self {
        Self {
            path,
            encryption_key: None,
        }
    }

    pub fn new_encrypted(path: PathBuf, key_b64: &str) -> Result<Self, crate::Error> {
        let key_bytes = B64
            .decode(key_b64)
            .map_err(|e| crate::Error::Config(format!("Invalid encryption key base64: {e}")))?;

        let key: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
            crate::Error::Config(format!(
                "Encryption key must be 32 bytes, got {}",
                key_bytes.len()
            ))
        })?;

        Ok(Self {
            path,
            encryption_key: Some(key),
        })
    }

    /// Pick plaintext or encrypted mode from the environment.
    pub fn from_env(path: PathBuf) -> Result<Self, crate::Error> {
        match std::env::var(ENCRYPTION_SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => Self::new_encrypted(path, &secret),
            _ => {
                warn!("No {ENCRYPTION_SECRET_ENV} set, reading plaintext credentials (dev mode)");
                Ok(Self::new_plaintext(path))
            }
        }
    }

    /// Load the pool credentials. `RELAYER_KEYS_JSON` wins over the file.
    pub fn load(&self) -> Result<Vec<Credential>, crate::Error> {
        if let Ok(json) = std::env::var(KEYS_JSON_ENV) {
            if !json.trim().is_empty() {
                info!("Loading pool credentials from {KEYS_JSON_ENV}");
                return parse_credentials(json.as_bytes());
            }
        }

        let data = std::fs::read(&self.path).map_err(|e| {
            crate::Error::Config(format!(
                "Failed to read credential file {}: {e}",
                self.path.display()
            ))
        })?;

        let json_bytes = match &self.encryption_key {
            Some(key) => decrypt_aes256gcm(key, &data)?,
            None => data,
        };

        let credentials = parse_credentials(&json_bytes)?;
        info!(
            path = %self.path.display(),
            count = credentials.len(),
            "Pool credentials loaded"
        );
        Ok(credentials)
    }

    /// Validate plaintext credential JSON and write it to this store's path,
    /// encrypted when the store has a key. Returns the number of keys.
    pub fn seal(&self, plaintext_json: &[u8]) -> Result<usize, crate::Error> {
        let count = parse_credentials(plaintext_json)?.len();

        let data = match &self.encryption_key {
            Some(key) => encrypt_aes256gcm(key, plaintext_json)?,
            None => plaintext_json.to_vec(),
        };

        // Atomic write: tmp + rename
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = tmp.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::Error::Config(format!("Failed to create key store directory: {e}"))
            })?;
        }
        std::fs::write(&tmp, &data)
            .map_err(|e| crate::Error::Config(format!("Failed to write key store: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| crate::Error::Config(format!("Failed to rename key store: {e}")))?;

        info!(
            path = %self.path.display(),
            count,
            encrypted = self.encryption_key.is_some(),
            "Credential file written"
        );
        Ok(count)
    }
}

/// Parse and validate credential JSON: an array of entries, or a single
/// near-cli style object treated as a pool of one.
pub fn parse_credentials(json: &[u8]) -> Result<Vec<Credential>, crate::Error> {
    let value: serde_json::Value = serde_json::from_slice(json)
        .map_err(|e| crate::Error::Config(format!("Invalid credential JSON: {e}")))?;

    let entries: Vec<CredentialEntry> = if value.is_array() {
        serde_json::from_value::<Vec<CredentialEntry>>(value)
    } else {
        serde_json::from_value::<CredentialEntry>(value).map(|entry| vec![entry])
    }
    .map_err(|e| crate::Error::Config(format!("Invalid credential entry: {e}")))?;

    if entries.is_empty() {
        return Err(crate::Error::Config(
            "Credential file contains no keys; the pool cannot be empty".into(),
        ));
    }

    let mut seen = HashSet::new();
    let mut credentials = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        let account_id: AccountId = entry
            .account_id
            .parse()
            .map_err(|e| crate::Error::Config(format!("Entry {i}: invalid account: {e}")))?;

        if let Some(first) = credentials.first().map(|c: &Credential| &c.account_id) {
            if *first != account_id {
                return Err(crate::Error::Config(format!(
                    "Entry {i}: account {account_id} differs from pool account {first}"
                )));
            }
        }

        // Never echo the secret itself in the error.
        let secret_key: SecretKey = entry.secret_key.parse().map_err(|_| {
            crate::Error::Config(format!("Entry {i}: invalid secret key format"))
        })?;
        let public_key = secret_key.public_key();

        if let Some(declared) = entry.public_key {
            let declared: PublicKey = declared
                .parse()
                .map_err(|e| crate::Error::Config(format!("Entry {i}: invalid public key: {e}")))?;
            if declared != public_key {
                return Err(crate::Error::Config(format!(
                    "Entry {i}: public key {declared} does not match its secret key"
                )));
            }
        }

        if !seen.insert(public_key.clone()) {
            return Err(crate::Error::Config(format!(
                "Entry {i}: duplicate key {public_key}"
            )));
        }

        credentials.push(Credential {
            account_id,
            public_key,
            secret_key,
        });
    }

    Ok(credentials)
}

fn encrypt_aes256gcm(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, crate::Error> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};
    use rand::RngCore;

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| crate::Error::Config(format!("AES init failed: {e}")))?;

    let mut nonce_bytes = [0u8; AES_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| crate::Error::Config(format!("Encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(AES_NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn decrypt_aes256gcm(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, crate::Error> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};

    if data.len() < AES_NONCE_LEN {
        return Err(crate::Error::Config(
            "Encrypted data too short (missing nonce)".into(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| crate::Error::Config(format!("AES init failed: {e}")))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| crate::Error::Config(format!("Decryption failed (wrong key?): {e}")))
}
