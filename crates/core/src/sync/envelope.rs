//! Payload envelope: optional gzip, then AEAD encryption, applied
//! uniformly to everything that crosses an adapter boundary.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::{Read, Write};
use std::sync::Mutex;

use crate::errors::{Result, SyncError};

/// One-byte prefix marking enveloped payloads. Plain JSON containers start
/// with `{`, so the prefix never collides.
pub const ENVELOPE_VERSION: u8 = 1;

/// Passphrase stretching rounds (PBKDF2-HMAC-SHA256).
pub const PBKDF2_ITERATIONS: u32 = 600_000;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Envelope flags controlled by the sync config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeConfig {
    pub is_encryption_enabled: bool,
    pub is_compression_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeBody {
    is_encrypted: bool,
    is_compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    ciphertext: String,
}

/// Derive a symmetric key from a user passphrase and a per-account salt.
pub fn derive_key(passphrase: &str, salt: &str) -> [u8; KEY_LEN] {
    let mut key = [0_u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| SyncError::envelope(format!("compression failed: {}", e)))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SyncError::envelope(format!("decompression failed: {}", e)))?;
    Ok(out)
}

/// Seals and opens payloads according to the current envelope config.
///
/// The derived key is cached in memory; changing the passphrase or the
/// salt invalidates the cache.
pub struct PayloadProtector {
    cfg: Mutex<EnvelopeConfig>,
    passphrase: Mutex<Option<String>>,
    salt: String,
    key_cache: Mutex<Option<[u8; KEY_LEN]>>,
}

impl PayloadProtector {
    pub fn new(cfg: EnvelopeConfig, salt: impl Into<String>) -> Self {
        Self {
            cfg: Mutex::new(cfg),
            passphrase: Mutex::new(None),
            salt: salt.into(),
            key_cache: Mutex::new(None),
        }
    }

    pub fn config(&self) -> EnvelopeConfig {
        *self.cfg.lock().expect("envelope config mutex")
    }

    pub fn set_config(&self, cfg: EnvelopeConfig) {
        *self.cfg.lock().expect("envelope config mutex") = cfg;
    }

    /// Set or clear the passphrase. Always drops the cached key.
    pub fn set_passphrase(&self, passphrase: Option<String>) {
        *self.passphrase.lock().expect("passphrase mutex") = passphrase;
        *self.key_cache.lock().expect("key cache mutex") = None;
    }

    fn key(&self) -> Result<[u8; KEY_LEN]> {
        if let Some(key) = *self.key_cache.lock().expect("key cache mutex") {
            return Ok(key);
        }
        let passphrase = self
            .passphrase
            .lock()
            .expect("passphrase mutex")
            .clone()
            .ok_or_else(|| SyncError::auth("encryption enabled but no passphrase set"))?;
        let key = derive_key(&passphrase, &self.salt);
        *self.key_cache.lock().expect("key cache mutex") = Some(key);
        Ok(key)
    }

    /// True when `data` looks like an envelope rather than a raw payload.
    pub fn is_envelope(data: &[u8]) -> bool {
        data.first() == Some(&ENVELOPE_VERSION) && data.get(1) == Some(&b'{')
    }

    /// Protect a payload for upload.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cfg = self.config();
        if !cfg.is_encryption_enabled && !cfg.is_compression_enabled {
            return Ok(plaintext.to_vec());
        }

        let staged = if cfg.is_compression_enabled {
            gzip(plaintext)?
        } else {
            plaintext.to_vec()
        };

        let body = if cfg.is_encryption_enabled {
            let key = self.key()?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
            let mut nonce = [0_u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), staged.as_ref())
                .map_err(|_| SyncError::envelope("encryption failed"))?;
            EnvelopeBody {
                is_encrypted: true,
                is_compressed: cfg.is_compression_enabled,
                nonce: Some(BASE64.encode(nonce)),
                ciphertext: BASE64.encode(ciphertext),
            }
        } else {
            EnvelopeBody {
                is_encrypted: false,
                is_compressed: true,
                nonce: None,
                ciphertext: BASE64.encode(&staged),
            }
        };

        let mut out = vec![ENVELOPE_VERSION];
        out.extend(serde_json::to_vec(&body)?);
        Ok(out)
    }

    /// Open a downloaded payload, enforcing that its encryption state
    /// matches the local config.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cfg = self.config();

        if !Self::is_envelope(data) {
            if cfg.is_encryption_enabled {
                return Err(SyncError::EncryptionStateMismatch {
                    remote_encrypted: false,
                    local_encrypted: true,
                });
            }
            return Ok(data.to_vec());
        }

        let body: EnvelopeBody = serde_json::from_slice(&data[1..])?;
        if body.is_encrypted != cfg.is_encryption_enabled {
            return Err(SyncError::EncryptionStateMismatch {
                remote_encrypted: body.is_encrypted,
                local_encrypted: cfg.is_encryption_enabled,
            });
        }

        let raw = BASE64
            .decode(&body.ciphertext)
            .map_err(|e| SyncError::envelope(format!("invalid ciphertext encoding: {}", e)))?;

        let staged = if body.is_encrypted {
            let nonce_bytes = body
                .nonce
                .as_deref()
                .ok_or_else(|| SyncError::envelope("encrypted envelope without nonce"))
                .and_then(|n| {
                    BASE64
                        .decode(n)
                        .map_err(|e| SyncError::envelope(format!("invalid nonce encoding: {}", e)))
                })?;
            if nonce_bytes.len() != NONCE_LEN {
                return Err(SyncError::envelope("invalid nonce length"));
            }
            let key = self.key()?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), raw.as_ref())
                .map_err(|_| SyncError::envelope("decryption failed (wrong passphrase?)"))?
        } else {
            raw
        };

        if body.is_compressed {
            gunzip(&staged)
        } else {
            Ok(staged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"syncVersion":1,"recentOps":[]}"#;

    fn protector(encrypt: bool, compress: bool) -> PayloadProtector {
        let p = PayloadProtector::new(
            EnvelopeConfig {
                is_encryption_enabled: encrypt,
                is_compression_enabled: compress,
            },
            "account-salt",
        );
        if encrypt {
            p.set_passphrase(Some("correct horse".to_string()));
        }
        p
    }

    #[test]
    fn plaintext_mode_is_passthrough() {
        let p = protector(false, false);
        let sealed = p.seal(PAYLOAD).expect("seal");
        assert_eq!(sealed, PAYLOAD);
        assert_eq!(p.open(&sealed).expect("open"), PAYLOAD);
    }

    #[test]
    fn compressed_round_trip() {
        let p = protector(false, true);
        let sealed = p.seal(PAYLOAD).expect("seal");
        assert!(PayloadProtector::is_envelope(&sealed));
        assert_eq!(p.open(&sealed).expect("open"), PAYLOAD);
    }

    #[test]
    fn encrypted_round_trip_with_random_nonce() {
        let p = protector(true, true);
        let a = p.seal(PAYLOAD).expect("seal a");
        let b = p.seal(PAYLOAD).expect("seal b");
        assert_ne!(a, b);
        assert_eq!(p.open(&a).expect("open a"), PAYLOAD);
        assert_eq!(p.open(&b).expect("open b"), PAYLOAD);
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let sealed = {
            let p = protector(true, false);
            p.seal(PAYLOAD).expect("seal")
        };
        let p = protector(true, false);
        p.set_passphrase(Some("wrong".to_string()));
        let err = p.open(&sealed).expect_err("must fail");
        assert!(matches!(err, SyncError::Envelope(_)));
    }

    #[test]
    fn encryption_state_mismatch_is_detected_both_ways() {
        let encrypted = protector(true, false).seal(PAYLOAD).expect("seal");
        let plain_reader = protector(false, false);
        assert!(matches!(
            plain_reader.open(&encrypted),
            Err(SyncError::EncryptionStateMismatch {
                remote_encrypted: true,
                local_encrypted: false,
            })
        ));

        let encrypted_reader = protector(true, false);
        assert!(matches!(
            encrypted_reader.open(PAYLOAD),
            Err(SyncError::EncryptionStateMismatch {
                remote_encrypted: false,
                local_encrypted: true,
            })
        ));
    }

    #[test]
    fn passphrase_change_invalidates_cached_key() {
        let p = protector(true, false);
        let sealed = p.seal(PAYLOAD).expect("seal");
        p.set_passphrase(Some("different".to_string()));
        assert!(p.open(&sealed).is_err());
    }
}
