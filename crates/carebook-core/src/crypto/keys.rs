//! Key ring with rotation.
//!
//! Only salts are stored; keys are re-derived on demand from the clinic id
//! and salt, so a persisted ring never contains key material.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cipher::{generate_salt, key_id_for_salt, CryptoEngine, EncryptionKey};
use crate::error::{Error, IntegrityErrorKind, Result};

/// One generation of the clinic key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    /// Derivation salt (base64)
    pub salt: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    fn from_salt(salt: &[u8]) -> Self {
        Self {
            key_id: key_id_for_salt(salt),
            salt: STANDARD.encode(salt),
            created_at: Utc::now(),
            active: true,
            retired_at: None,
        }
    }

    fn salt_bytes(&self) -> Result<Vec<u8>> {
        STANDARD.decode(&self.salt).map_err(|error| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("stored salt for key {} is invalid: {error}", self.key_id),
            )
        })
    }
}

/// All key generations known to this device, at most one active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    keys: Vec<KeyRecord>,
}

impl KeyRing {
    /// New ring with a single active key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            keys: vec![KeyRecord::from_salt(&generate_salt())],
        }
    }

    #[must_use]
    pub fn records(&self) -> &[KeyRecord] {
        &self.keys
    }

    #[must_use]
    pub fn active(&self) -> Option<&KeyRecord> {
        self.keys.iter().rev().find(|record| record.active)
    }

    #[must_use]
    pub fn get(&self, key_id: &str) -> Option<&KeyRecord> {
        self.keys.iter().find(|record| record.key_id == key_id)
    }

    /// Start a new key generation; older keys stay retrievable.
    pub fn rotate(&mut self) -> &KeyRecord {
        let now = Utc::now();
        for record in self.keys.iter_mut().filter(|record| record.active) {
            record.active = false;
            record.retired_at = Some(now);
        }
        self.keys.push(KeyRecord::from_salt(&generate_salt()));
        &self.keys[self.keys.len() - 1]
    }

    /// Derive the active key, generating a first key if the ring is empty.
    pub fn active_key(&mut self, engine: &CryptoEngine, clinic_id: &str) -> Result<EncryptionKey> {
        if self.active().is_none() {
            self.rotate();
        }
        let record = self
            .active()
            .ok_or_else(|| Error::InvalidInput("key ring has no active key".to_string()))?;
        engine.derive_key(clinic_id, &record.salt_bytes()?)
    }

    /// Derive a key by id, active or retired.
    pub fn key_by_id(
        &self,
        engine: &CryptoEngine,
        clinic_id: &str,
        key_id: &str,
    ) -> Result<Option<EncryptionKey>> {
        self.get(key_id)
            .map(|record| engine.derive_key(clinic_id, &record.salt_bytes()?))
            .transpose()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
