//! AES-256-GCM envelope encryption with HKDF-derived keys.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::keys::KeyRing;
use crate::error::{Error, IntegrityErrorKind, Result};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Size of generated key salts in bytes.
pub const SALT_SIZE: usize = 16;

/// Algorithm label written into every envelope.
pub const ALGORITHM: &str = "AES-256-GCM";

const HKDF_INFO: &[u8] = b"carebook-backup-key-v1";

/// Derived AES-256 key together with the salt it came from.
///
/// The key bytes are zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    id: String,
    salt: Vec<u8>,
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Key id for a salt: first 8 bytes of its SHA-256, hex encoded.
#[must_use]
pub fn key_id_for_salt(salt: &[u8]) -> String {
    hex::encode(&Sha256::digest(salt)[..8])
}

/// Fresh random salt for a new key.
#[must_use]
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Encrypted blob envelope, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub algorithm: String,
    pub key_id: String,
    /// Key derivation salt (base64)
    pub salt: String,
    /// GCM nonce (base64)
    pub iv: String,
    /// Ciphertext without tag (base64)
    pub ciphertext: String,
    /// GCM tag (base64)
    pub tag: String,
    /// SHA-256 of `ciphertext || tag` (hex)
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

impl EncryptedPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|error| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("encrypted envelope is not valid JSON: {error}"),
            )
        })
    }

    /// Check the envelope checksum without a key.
    pub fn verify_checksum(&self) -> Result<()> {
        let sealed = self.sealed_bytes()?;
        if CryptoEngine::validate_integrity(&sealed, &self.checksum) {
            Ok(())
        } else {
            Err(Error::integrity(
                IntegrityErrorKind::ChecksumMismatch,
                format!("encrypted payload checksum mismatch (key {})", self.key_id),
            ))
        }
    }

    fn sealed_bytes(&self) -> Result<Vec<u8>> {
        let mut sealed = decode_field("ciphertext", &self.ciphertext)?;
        sealed.extend(decode_field("tag", &self.tag)?);
        Ok(sealed)
    }
}

/// Key derivation and authenticated encryption for backup payloads.
#[derive(Clone, Default)]
pub struct CryptoEngine {
    master_secret: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("master_secret", &self.master_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CryptoEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mix a clinic-wide secret into every derived key.
    #[must_use]
    pub fn with_master_secret(secret: impl AsRef<[u8]>) -> Self {
        Self {
            master_secret: Some(Zeroizing::new(secret.as_ref().to_vec())),
        }
    }

    /// Derive the key for a clinic and salt using HKDF-SHA256.
    ///
    /// Deterministic: the same clinic, salt, and master secret always yield
    /// the same key, so only salts need to be stored.
    pub fn derive_key(&self, clinic_id: &str, salt: &[u8]) -> Result<EncryptionKey> {
        if clinic_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "clinic id is required for key derivation".to_string(),
            ));
        }

        let mut ikm = Zeroizing::new(Vec::with_capacity(clinic_id.len() + 32));
        if let Some(secret) = &self.master_secret {
            ikm.extend_from_slice(secret);
            ikm.push(0);
        }
        ikm.extend_from_slice(clinic_id.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut bytes)
            .map_err(|_| Error::InvalidInput("HKDF expand failed".to_string()))?;

        Ok(EncryptionKey {
            id: key_id_for_salt(salt),
            salt: salt.to_vec(),
            bytes,
        })
    }

    /// Encrypt bytes into a self-describing envelope.
    ///
    /// The key id is bound as associated data, so an envelope cannot be
    /// relabelled to another key.
    pub fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<EncryptedPayload> {
        let cipher = Self::cipher(key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: key.id.as_bytes(),
                },
            )
            .map_err(|_| Error::InvalidInput("AES-GCM encryption failed".to_string()))?;

        let checksum = Self::checksum(&sealed);
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(EncryptedPayload {
            algorithm: ALGORITHM.to_string(),
            key_id: key.id.clone(),
            salt: STANDARD.encode(&key.salt),
            iv: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(&sealed),
            tag: STANDARD.encode(tag),
            checksum,
            timestamp: Utc::now(),
        })
    }

    pub fn encrypt_json<T: Serialize>(
        &self,
        value: &T,
        key: &EncryptionKey,
    ) -> Result<EncryptedPayload> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        self.encrypt(&plaintext, key)
    }

    /// Decrypt an envelope, failing on any tampering.
    pub fn decrypt(&self, payload: &EncryptedPayload, key: &EncryptionKey) -> Result<Vec<u8>> {
        if payload.algorithm != ALGORITHM {
            return Err(Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("unsupported algorithm '{}'", payload.algorithm),
            ));
        }
        if payload.key_id != key.id {
            return Err(decryption_failed(&format!(
                "payload was sealed with key {} but key {} was supplied",
                payload.key_id, key.id
            )));
        }

        payload.verify_checksum()?;

        let nonce = decode_field("iv", &payload.iv)?;
        if nonce.len() != NONCE_SIZE {
            return Err(Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("nonce must be {NONCE_SIZE} bytes, got {}", nonce.len()),
            ));
        }

        let sealed = payload.sealed_bytes()?;
        Self::cipher(key)?
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: payload.key_id.as_bytes(),
                },
            )
            .map_err(|_| decryption_failed("authentication tag verification failed"))
    }

    pub fn decrypt_json<T: DeserializeOwned>(
        &self,
        payload: &EncryptedPayload,
        key: &EncryptionKey,
    ) -> Result<T> {
        let plaintext = Zeroizing::new(self.decrypt(payload, key)?);
        serde_json::from_slice(&plaintext).map_err(|error| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("decrypted payload is not valid JSON: {error}"),
            )
        })
    }

    /// Find the key that sealed `payload`.
    ///
    /// Keys from the local ring are preferred; unknown ids are re-derived from
    /// the salt carried in the envelope (backups from other devices).
    pub fn key_for_payload(
        &self,
        clinic_id: &str,
        payload: &EncryptedPayload,
        ring: &KeyRing,
    ) -> Result<EncryptionKey> {
        if let Some(key) = ring.key_by_id(self, clinic_id, &payload.key_id)? {
            return Ok(key);
        }

        let salt = decode_field("salt", &payload.salt)?;
        if key_id_for_salt(&salt) != payload.key_id {
            return Err(decryption_failed(&format!(
                "salt does not match key id {}",
                payload.key_id
            )));
        }
        self.derive_key(clinic_id, &salt)
    }

    /// SHA-256 of `data`, hex encoded.
    #[must_use]
    pub fn checksum(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[must_use]
    pub fn validate_integrity(data: &[u8], checksum: &str) -> bool {
        Self::checksum(data).eq_ignore_ascii_case(checksum.trim())
    }

    fn cipher(key: &EncryptionKey) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|_| Error::InvalidInput("invalid AES-256 key length".to_string()))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|error| {
        Error::integrity(
            IntegrityErrorKind::InvalidFormat,
            format!("envelope field '{name}' is not valid base64: {error}"),
        )
    })
}

fn decryption_failed(message: &str) -> Error {
    Error::integrity(IntegrityErrorKind::DecryptionFailed, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(engine: &CryptoEngine) -> EncryptionKey {
        engine.derive_key("clinic-1", b"0123456789abcdef").unwrap()
    }

    #[test]
    fn derive_key_is_deterministic() {
        let engine = CryptoEngine::new();
        let first = engine.derive_key("clinic-1", b"salt-a").unwrap();
        let second = engine.derive_key("clinic-1", b"salt-a").unwrap();
        let other_salt = engine.derive_key("clinic-1", b"salt-b").unwrap();
        let other_clinic = engine.derive_key("clinic-2", b"salt-a").unwrap();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.id(), second.id());
        assert_ne!(first.bytes, other_salt.bytes);
        assert_ne!(first.bytes, other_clinic.bytes);
    }

    #[test]
    fn master_secret_changes_derived_key() {
        let plain = CryptoEngine::new().derive_key("clinic-1", b"salt").unwrap();
        let secret = CryptoEngine::with_master_secret("s3cret")
            .derive_key("clinic-1", b"salt")
            .unwrap();
        assert_ne!(plain.bytes, secret.bytes);
        assert_eq!(plain.id(), secret.id());
    }

    #[test]
    fn derive_key_requires_clinic() {
        assert!(CryptoEngine::new().derive_key("  ", b"salt").is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let value = json!({"patients": [{"id": "p-1", "name": "Ada"}]});

        let payload = engine.encrypt_json(&value, &key).unwrap();
        assert_eq!(payload.algorithm, ALGORITHM);
        assert_eq!(payload.key_id, key.id());

        let decrypted: serde_json::Value = engine.decrypt_json(&payload, &key).unwrap();
        assert_eq!(decrypted, value);
    }

    #[test]
    fn envelope_survives_byte_roundtrip() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let payload = engine.encrypt(b"hello clinic", &key).unwrap();

        let restored = EncryptedPayload::from_bytes(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(engine.decrypt(&restored, &key).unwrap(), b"hello clinic");
    }

    #[test]
    fn flipping_any_ciphertext_byte_fails() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let payload = engine.encrypt(b"visit notes for p-1", &key).unwrap();
        let ciphertext = STANDARD.decode(&payload.ciphertext).unwrap();

        for index in 0..ciphertext.len() {
            let mut tampered_bytes = ciphertext.clone();
            tampered_bytes[index] ^= 0x01;
            let tampered = EncryptedPayload {
                ciphertext: STANDARD.encode(&tampered_bytes),
                ..payload.clone()
            };

            let error = engine.decrypt(&tampered, &key).unwrap_err();
            assert!(error.is_integrity(), "byte {index} was not detected");
        }
    }

    #[test]
    fn tampering_with_tag_and_matching_checksum_fails_decryption() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let payload = engine.encrypt(b"prescription", &key).unwrap();

        let mut tag = STANDARD.decode(&payload.tag).unwrap();
        tag[0] ^= 0xff;
        let mut sealed = STANDARD.decode(&payload.ciphertext).unwrap();
        sealed.extend_from_slice(&tag);
        let tampered = EncryptedPayload {
            tag: STANDARD.encode(&tag),
            checksum: CryptoEngine::checksum(&sealed),
            ..payload
        };

        let error = engine.decrypt(&tampered, &key).unwrap_err();
        assert!(matches!(
            error,
            Error::DataIntegrity {
                kind: IntegrityErrorKind::DecryptionFailed,
                ..
            }
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let other = engine.derive_key("clinic-1", b"another-salt").unwrap();
        let payload = engine.encrypt(b"data", &key).unwrap();

        assert!(engine.decrypt(&payload, &other).is_err());
    }

    #[test]
    fn relabelled_key_id_fails_authentication() {
        let engine = CryptoEngine::new();
        let key = key(&engine);
        let payload = engine.encrypt(b"data", &key).unwrap();

        let mut impostor = key.clone();
        impostor.id = "0000000000000000".to_string();
        let relabelled = EncryptedPayload {
            key_id: impostor.id.clone(),
            ..payload
        };

        assert!(engine.decrypt(&relabelled, &impostor).is_err());
    }

    #[test]
    fn validate_integrity_detects_changes() {
        let data = b"backup bytes".to_vec();
        let checksum = CryptoEngine::checksum(&data);
        assert!(CryptoEngine::validate_integrity(&data, &checksum));
        assert!(CryptoEngine::validate_integrity(
            &data,
            &checksum.to_uppercase()
        ));

        let mut altered = data;
        altered[3] ^= 0x20;
        assert!(!CryptoEngine::validate_integrity(&altered, &checksum));
    }

    #[test]
    fn key_debug_is_redacted() {
        let engine = CryptoEngine::with_master_secret("top-secret");
        let key = key(&engine);
        assert!(format!("{key:?}").contains("[REDACTED]"));
        assert!(!format!("{engine:?}").contains("top-secret"));
    }

    #[test]
    fn unknown_key_is_rederived_from_envelope_salt() {
        let engine = CryptoEngine::new();
        let key = engine.derive_key("clinic-1", &generate_salt()).unwrap();
        let payload = engine.encrypt(b"from another device", &key).unwrap();

        let empty_ring = KeyRing::default();
        let found = engine
            .key_for_payload("clinic-1", &payload, &empty_ring)
            .unwrap();
        assert_eq!(engine.decrypt(&payload, &found).unwrap(), b"from another device");
    }
}
