//! Cryptographic operations module
//!
//! This module handles at-rest protection of message bodies:
//! - Per-thread symmetric keys, versioned so rotation never orphans history
//! - Key wrapping under a server-held master key
//! - XChaCha20-Poly1305 envelope encryption/decryption
//!
//! Keys live in the `thread_keys` table, apart from message content.

use crate::{now_millis, storage::Database, Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Length of a symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Encrypted envelope containing ciphertext and nonce
///
/// The 16-byte Poly1305 authentication tag is appended to the ciphertext by
/// the AEAD cipher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// 24-byte nonce for XChaCha20-Poly1305
    pub nonce: [u8; 24],
    /// Encrypted data + 16-byte Poly1305 authentication tag (appended)
    pub ciphertext: Vec<u8>,
}

/// Ciphertext of a message body together with the key version that sealed it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ciphertext {
    /// Thread key version active at encryption time
    pub key_version: u32,
    /// Sealed content
    pub envelope: EncryptedEnvelope,
}

/// Generate a random 256-bit key
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt with XChaCha20-Poly1305, binding `aad` into the tag
///
/// # Example
///
/// ```
/// use threadsync::crypto::{encrypt_message, decrypt_message};
///
/// # fn example() -> threadsync::Result<()> {
/// let key = [7u8; 32];
/// let envelope = encrypt_message(&key, b"hello", b"thread-1")?;
/// let plain = decrypt_message(&key, &envelope, b"thread-1")?;
/// assert_eq!(plain, b"hello");
/// # Ok(())
/// # }
/// ```
pub fn encrypt_message(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedEnvelope> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt an envelope; fails if the key, `aad` or ciphertext do not match
pub fn decrypt_message(key: &[u8; KEY_LEN], envelope: &EncryptedEnvelope, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from(envelope.nonce);

    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: envelope.ciphertext.as_ref(),
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Decryption failed (auth tag mismatch or corrupted data): {}", e)))
}

/// Server-held key-encryption key
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random master key
    pub fn generate() -> Self {
        Self(generate_key())
    }

    /// Parse a 64-character hex string
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::Crypto(format!("Invalid master key hex: {}", e)))?;
        let bytes: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("Master key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

fn key_aad(thread_id: &str, version: u32) -> Vec<u8> {
    format!("thread-key:{}:{}", thread_id, version).into_bytes()
}

fn content_aad(thread_id: &str, version: u32) -> Vec<u8> {
    format!("content:{}:{}", thread_id, version).into_bytes()
}

/// Per-thread encryption with versioned keys
#[derive(Clone)]
pub struct EncryptionService {
    db: Database,
    master: MasterKey,
    cache: Arc<Mutex<HashMap<(String, u32), [u8; KEY_LEN]>>>,
}

impl EncryptionService {
    /// Create a service storing its keys in `db`
    pub fn new(db: Database, master: MasterKey) -> Self {
        Self {
            db,
            master,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Highest key version for a thread, if any key exists
    pub fn active_version(&self, thread_id: &str) -> Result<Option<u32>> {
        self.db.with_conn(|conn| {
            let version: Option<u32> = conn
                .query_row(
                    "SELECT MAX(version) FROM thread_keys WHERE thread_id = ?1",
                    params![thread_id],
                    |row| row.get::<_, Option<u32>>(0),
                )
                .optional()?
                .flatten();
            Ok(version)
        })
    }

    /// Create version 1 of the thread key if the thread has none
    ///
    /// Returns the active version. Safe to call concurrently.
    pub fn ensure_key(&self, thread_id: &str) -> Result<u32> {
        if let Some(version) = self.active_version(thread_id)? {
            return Ok(version);
        }

        let key = generate_key();
        let wrapped = encrypt_message(&self.master.0, &key, &key_aad(thread_id, 1))?;
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO thread_keys (thread_id, version, wrapped_key, nonce, created_at)
                 VALUES (?1, 1, ?2, ?3, ?4)",
                params![thread_id, wrapped.ciphertext, wrapped.nonce.to_vec(), now_millis()],
            )?)
        })?;
        if inserted > 0 {
            debug!("Generated key version 1 for thread {}", thread_id);
        }

        self.active_version(thread_id)?
            .ok_or_else(|| Error::Crypto(format!("No key for thread {}", thread_id)))
    }

    /// Generate a new key version; future writes use it
    ///
    /// Existing ciphertext keeps its recorded version and stays decryptable.
    /// Fails with `NotFound` for a thread that does not exist.
    pub fn rotate_key(&self, thread_id: &str) -> Result<u32> {
        let key = generate_key();
        let version = self.db.transaction(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM threads WHERE id = ?1)",
                params![thread_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::NotFound(format!("thread {}", thread_id)));
            }

            let current: Option<u32> = tx.query_row(
                "SELECT MAX(version) FROM thread_keys WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )?;
            let next = current.unwrap_or(0) + 1;
            let wrapped = encrypt_message(&self.master.0, &key, &key_aad(thread_id, next))?;
            tx.execute(
                "INSERT INTO thread_keys (thread_id, version, wrapped_key, nonce, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![thread_id, next, wrapped.ciphertext, wrapped.nonce.to_vec(), now_millis()],
            )?;
            Ok(next)
        })?;

        info!("Rotated key for thread {} to version {}", thread_id, version);
        Ok(version)
    }

    /// Encrypt message content with the thread's active key
    pub fn encrypt(&self, thread_id: &str, plaintext: &str) -> Result<Ciphertext> {
        let version = self.ensure_key(thread_id)?;
        let key = self.load_key(thread_id, version)?;
        let envelope = encrypt_message(&key, plaintext.as_bytes(), &content_aad(thread_id, version))?;
        Ok(Ciphertext {
            key_version: version,
            envelope,
        })
    }

    /// Decrypt message content with the key version recorded in `ciphertext`
    pub fn decrypt(&self, thread_id: &str, ciphertext: &Ciphertext) -> Result<String> {
        let key = self.load_key(thread_id, ciphertext.key_version)?;
        let plain = decrypt_message(
            &key,
            &ciphertext.envelope,
            &content_aad(thread_id, ciphertext.key_version),
        )?;
        String::from_utf8(plain).map_err(|e| Error::Crypto(format!("Decrypted content is not UTF-8: {}", e)))
    }

    fn load_key(&self, thread_id: &str, version: u32) -> Result<[u8; KEY_LEN]> {
        let cache_key = (thread_id.to_string(), version);
        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| Error::Crypto("Key cache mutex poisoned".to_string()))?;
            if let Some(key) = cache.get(&cache_key) {
                return Ok(*key);
            }
        }

        let row: Option<(Vec<u8>, Vec<u8>)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT wrapped_key, nonce FROM thread_keys WHERE thread_id = ?1 AND version = ?2",
                    params![thread_id, version],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        let (wrapped_key, nonce) = row.ok_or_else(|| {
            Error::Crypto(format!("Missing key version {} for thread {}", version, thread_id))
        })?;

        let nonce: [u8; 24] = nonce
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("Invalid wrapped key nonce length".to_string()))?;
        let envelope = EncryptedEnvelope {
            nonce,
            ciphertext: wrapped_key,
        };
        let raw = decrypt_message(&self.master.0, &envelope, &key_aad(thread_id, version))?;
        let key: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("Invalid unwrapped key length".to_string()))?;

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Crypto("Key cache mutex poisoned".to_string()))?;
        cache.insert(cache_key, key);
        Ok(key)
    }
}
