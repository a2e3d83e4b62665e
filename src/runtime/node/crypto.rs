//! Room-derived authenticated encryption.
//!
//! Every room derives a 32-byte AES-256-GCM key from its canonical name via
//! PBKDF2-HMAC-SHA-256 with a fixed salt, so two nodes that join the same
//! room compute the same key without ever talking to each other. Envelope
//! payloads are sealed with a fresh random 12-byte nonce per call and a
//! fixed associated-data string; nonce, ciphertext, and tag travel as
//! lowercase hex.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Fixed PBKDF2 salt shared by every node.
const KEY_SALT: &[u8] = b"localchat2024salt";

/// PBKDF2 iteration count.
const KEY_ROUNDS: u32 = 100_000;

/// Associated data bound into every sealed payload.
const SEAL_AAD: &[u8] = b"localchat";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag verification failed or the ciphertext is malformed.
    #[error("payload authentication failed")]
    AeadFailure,
    /// A hex field could not be decoded or has the wrong length.
    #[error("malformed hex field")]
    BadEncoding,
}

/// The symmetric key shared by every member of a room.
#[derive(Clone)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    /// Derive the key for a canonical room name. Deterministic: every node
    /// that joins the same room arrives at the same key.
    pub fn derive(room: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(room.as_bytes(), KEY_SALT, KEY_ROUNDS, &mut key);
        Self(key)
    }

    /// Seal `plaintext` under this key with a fresh random nonce.
    ///
    /// Returns `(nonce, ciphertext, tag)`, each lowercase hex.
    pub fn seal(&self, plaintext: &[u8]) -> (String, String, String) {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new((&self.0).into());
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: SEAL_AAD,
                },
            )
            .expect("AES-GCM encryption is infallible for valid key and nonce sizes");

        let split = sealed.len() - TAG_LEN;
        (
            hex::encode(nonce_bytes),
            hex::encode(&sealed[..split]),
            hex::encode(&sealed[split..]),
        )
    }

    /// Open a sealed payload. Fails when any field is malformed or the tag
    /// does not verify.
    pub fn open(&self, iv: &str, ciphertext: &str, tag: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = hex::decode(iv).map_err(|_| CryptoError::BadEncoding)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::BadEncoding);
        }
        let mut sealed = hex::decode(ciphertext).map_err(|_| CryptoError::BadEncoding)?;
        let tag_bytes = hex::decode(tag).map_err(|_| CryptoError::BadEncoding)?;
        if tag_bytes.len() != TAG_LEN {
            return Err(CryptoError::BadEncoding);
        }
        sealed.extend_from_slice(&tag_bytes);

        let cipher = Aes256Gcm::new((&self.0).into());
        cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| CryptoError::AeadFailure)
    }
}
