// ABOUTME: Deterministic authenticated encryption and canonical hashing of payloads
// ABOUTME: XChaCha20-Poly1305 with a nonce derived from the key and the plaintext

//! Payload codec.
//!
//! Ciphertext format: `0x01 || nonce (24 bytes) || ciphertext || tag (16 bytes)`.
//!
//! The nonce is `SHA-256(key || canonical_json)[..24]`, so encrypting the same
//! value twice with the same key yields identical bytes. Re-enqueueing an
//! unchanged record therefore produces an identical queue row, and identical
//! plaintexts are linkable by ciphertext equality under one key.
//!
//! Canonical JSON sorts object keys recursively, so the hash and the
//! ciphertext do not depend on field insertion order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

pub const KEY_SIZE: usize = 32;
const FORMAT_V1: u8 = 0x01;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("no encryption key configured")]
    MissingKey,
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("ciphertext too short ({0} bytes)")]
    CiphertextTooShort(usize),
    #[error("unsupported ciphertext format 0x{0:02x}")]
    UnsupportedFormat(u8),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication failed: data corrupted or wrong key")]
    AuthenticationFailed,
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// 256-bit payload key. Zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse a standard base64 encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CodecError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE, len
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

/// Encrypts, decrypts and hashes record payloads.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    key: Option<EncryptionKey>,
}

impl Codec {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Some(key) }
    }

    /// A codec that can only hash; `encrypt`/`decrypt` fail with `MissingKey`.
    pub fn without_key() -> Self {
        Self { key: None }
    }

    /// Load the key from an environment variable holding base64.
    ///
    /// An unset variable yields a keyless codec. A set but malformed value is
    /// an error.
    pub fn from_env(var: &str) -> Result<Self, CodecError> {
        match std::env::var(var) {
            Ok(encoded) => Ok(Self::new(EncryptionKey::from_base64(&encoded)?)),
            Err(_) => {
                tracing::debug!("{} not set; encrypted entity types are unavailable", var);
                Ok(Self::without_key())
            }
        }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let key = self.key.as_ref().ok_or(CodecError::MissingKey)?;
        let mut plaintext = canonical_bytes(value)?;

        let nonce_bytes = synthetic_nonce(key, &plaintext);
        let cipher = XChaCha20Poly1305::new((&key.bytes).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| CodecError::EncryptionFailed);
        plaintext.zeroize();
        let ciphertext = ciphertext?;

        let mut output = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        output.push(FORMAT_V1);
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    pub fn decrypt<T: DeserializeOwned>(&self, ciphertext: &[u8]) -> Result<T, CodecError> {
        let key = self.key.as_ref().ok_or(CodecError::MissingKey)?;
        if ciphertext.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::CiphertextTooShort(ciphertext.len()));
        }
        if ciphertext[0] != FORMAT_V1 {
            return Err(CodecError::UnsupportedFormat(ciphertext[0]));
        }

        let (nonce_bytes, sealed) = ciphertext[1..].split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&key.bytes).into());
        let mut plaintext = cipher
            .decrypt(XNonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CodecError::AuthenticationFailed)?;

        let value = serde_json::from_slice(&plaintext)
            .map_err(|e| CodecError::Serialization(e.to_string()));
        plaintext.zeroize();
        value
    }
}

/// Hex SHA-256 of the canonical JSON form of `value`.
///
/// Keyless. Used for provenance digests and change detection.
pub fn hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Serialization(e.to_string()))?;
    serde_json::to_vec(&canonicalize(&value)).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn synthetic_nonce(key: &EncryptionKey, plaintext: &[u8]) -> [u8; NONCE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(key.bytes);
    hasher.update(plaintext);
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn codec() -> Codec {
        Codec::new(EncryptionKey::from_bytes([7u8; KEY_SIZE]))
    }

    #[test]
    fn encryption_is_deterministic() {
        let value = json!({"id": "m1", "plate": "ABC-123"});
        let first = codec().encrypt(&value).unwrap();
        let second = codec().encrypt(&value).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], FORMAT_V1);
    }

    #[test]
    fn encryption_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"id":"m1","plate":"ABC"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"plate":"ABC","id":"m1"}"#).unwrap();
        assert_eq!(codec().encrypt(&a).unwrap(), codec().encrypt(&b).unwrap());
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn different_keys_produce_different_ciphertexts() {
        let value = json!({"id": "m1"});
        let other = Codec::new(EncryptionKey::from_bytes([8u8; KEY_SIZE]));
        assert_ne!(codec().encrypt(&value).unwrap(), other.encrypt(&value).unwrap());
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let mut ciphertext = codec().encrypt(&json!({"id": "m1"})).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert_eq!(
            codec().decrypt::<Value>(&ciphertext),
            Err(CodecError::AuthenticationFailed)
        );
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ciphertext = codec().encrypt(&json!({"id": "m1"})).unwrap();
        let other = Codec::new(EncryptionKey::from_bytes([9u8; KEY_SIZE]));
        assert_eq!(
            other.decrypt::<Value>(&ciphertext),
            Err(CodecError::AuthenticationFailed)
        );
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert_eq!(
            codec().decrypt::<Value>(&[FORMAT_V1, 1, 2]),
            Err(CodecError::CiphertextTooShort(3))
        );
        let mut ciphertext = codec().encrypt(&json!({"id": "m1"})).unwrap();
        ciphertext[0] = 0x7f;
        assert_eq!(
            codec().decrypt::<Value>(&ciphertext),
            Err(CodecError::UnsupportedFormat(0x7f))
        );
    }

    #[test]
    fn keyless_codec_refuses_to_encrypt() {
        let codec = Codec::without_key();
        assert!(!codec.has_key());
        assert_eq!(
            codec.encrypt(&json!({"id": "m1"})),
            Err(CodecError::MissingKey)
        );
    }

    #[test]
    fn key_round_trips_through_base64() {
        let key = EncryptionKey::generate();
        let parsed = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        let value = json!({"id": "m1"});
        assert_eq!(
            Codec::new(key).encrypt(&value).unwrap(),
            Codec::new(parsed).encrypt(&value).unwrap()
        );
        assert!(matches!(
            EncryptionKey::from_base64("c2hvcnQ="),
            Err(CodecError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_output_redacts_key() {
        let rendered = format!("{:?}", EncryptionKey::from_bytes([1u8; KEY_SIZE]));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn floats_survive_exactly() {
        let value = json!({"x": 7.514872226016191e155, "y": [0.1, -2.5e-308, 1.0]});
        let decoded: Value = codec().decrypt(&codec().encrypt(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded["x"].as_f64(), Some(7.514872226016191e155));
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<f64>().prop_filter_map("finite", |f| {
                serde_json::Number::from_f64(f).map(Value::Number)
            }),
            "[a-zA-Z0-9 _-]{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(value in json_value()) {
            let codec = codec();
            let ciphertext = codec.encrypt(&value).unwrap();
            let decoded: Value = codec.decrypt(&ciphertext).unwrap();
            prop_assert_eq!(&decoded, &value);
            prop_assert_eq!(codec.encrypt(&decoded).unwrap(), ciphertext);
        }
    }
}
