use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Context, Result};
use argon2::Argon2;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::WegentDirs;

const NONCE_LEN: usize = 12;
/// Per-install salt, stored hex-encoded next to the token file.
const SALT_LEN: usize = 32;

/// Encrypted at-rest storage for the bearer token.
///
/// A single token lives in one file, AES-256-GCM encrypted and hex-encoded.
/// The key never touches disk: it is re-derived on startup from the local
/// user identity plus a per-install random salt, so copying the token file
/// to another machine or account yields nothing decryptable.
pub struct TokenStore {
    cipher: Aes256Gcm,
    token_path: PathBuf,
}

impl TokenStore {
    /// Create a store rooted at the default `~/.wegent` locations.
    pub fn new() -> Result<Self> {
        Self::at(&WegentDirs::token_path()?, &WegentDirs::salt_path()?)
    }

    /// Create a store with explicit token and salt paths (tests).
    pub fn at(token_path: &Path, salt_path: &Path) -> Result<Self> {
        let salt = read_or_init_salt(salt_path)?;

        // Key = Argon2id(local identity, salt). The crate's default cost
        // parameters are tuned for interactive logins, which is exactly the
        // cadence here: once per process start.
        let identity = format!(
            "wegent:{}:{}",
            whoami::username(),
            dirs::home_dir().unwrap_or_default().display()
        );
        let mut key_bytes = [0u8; 32];
        Argon2::default()
            .hash_password_into(identity.as_bytes(), &salt, &mut key_bytes)
            .map_err(|e| anyhow::anyhow!("Key derivation failed: {e}"))?;

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
            token_path: token_path.to_path_buf(),
        })
    }

    /// Persist the bearer token, replacing any previous one.
    pub fn save(&self, token: &str) -> Result<()> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, token.as_bytes())
            .map_err(|e| anyhow::anyhow!("Token encryption failed: {e}"))?;

        // File layout: hex(nonce || ciphertext).
        let mut record = Vec::with_capacity(NONCE_LEN + sealed.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&sealed);

        if let Some(parent) = self.token_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(&self.token_path, hex::encode(record))
            .with_context(|| format!("Failed to write token file {}", self.token_path.display()))?;
        Ok(())
    }

    /// The stored bearer token, or `None` if missing or undecryptable.
    pub fn load(&self) -> Option<String> {
        let text = fs::read_to_string(&self.token_path).ok()?;
        match self.open_record(text.trim()) {
            Ok(token) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(e) => {
                warn!("Stored token could not be decrypted: {e}");
                None
            }
        }
    }

    /// Remove the stored token. Missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        if self.token_path.exists() {
            fs::remove_file(&self.token_path).with_context(|| {
                format!("Failed to remove token file {}", self.token_path.display())
            })?;
        }
        Ok(())
    }

    fn open_record(&self, hex_record: &str) -> Result<String> {
        let record = hex::decode(hex_record).context("Token file is not valid hex")?;
        if record.len() <= NONCE_LEN {
            anyhow::bail!("Token record truncated");
        }
        let (nonce_bytes, sealed) = record.split_at(NONCE_LEN);

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| anyhow::anyhow!("Token decryption failed: {e}"))?;
        String::from_utf8(plain).context("Decrypted token is not valid UTF-8")
    }
}

/// The per-install salt, hex-encoded on disk. Anything unreadable (missing
/// file, bad hex, wrong length) is replaced with a fresh salt: the only cost
/// is that a previously stored token stops decrypting, which the caller
/// already treats as "signed out".
fn read_or_init_salt(path: &Path) -> Result<Vec<u8>> {
    if let Ok(text) = fs::read_to_string(path) {
        if let Ok(salt) = hex::decode(text.trim()) {
            if salt.len() == SALT_LEN {
                return Ok(salt);
            }
        }
        warn!("Salt file {} is malformed; regenerating", path.display());
    }

    let fresh: [u8; SALT_LEN] = rand::random();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(path, hex::encode(fresh))
        .with_context(|| format!("Failed to write salt file {}", path.display()))?;
    Ok(fresh.to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
