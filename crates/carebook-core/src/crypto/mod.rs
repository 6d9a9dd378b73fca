//! Crypto engine: key derivation, AEAD envelopes, checksums, key rotation.

mod cipher;
mod keys;

pub use cipher::{
    generate_salt, key_id_for_salt, CryptoEngine, EncryptedPayload, EncryptionKey, ALGORITHM,
    KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
pub use keys::{KeyRecord, KeyRing};
