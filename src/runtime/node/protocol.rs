//! Wire protocol: the JSON envelope carried by every datagram.
//!
//! Each UDP payload is one UTF-8 JSON object with the identity fields
//! (`type`, `messageId`, `peerId`, `displayName`, `timestamp`) always in the
//! clear, plus an optional typed `content` object. When a room key is
//! present the codec seals `content` on encode and the field is replaced by
//! `encrypted` (`{iv, encrypted, authTag}`, lowercase hex); decode reverses
//! the swap. Anything unparseable is dropped by the caller with a log line,
//! never treated as fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::crypto::{CryptoError, RoomKey};

/// Discriminant of every envelope on the wire.
///
/// `Ack` and `StatusRequest` are reserved for future reliable-delivery work;
/// they parse and dedup like everything else but route to a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Join,
    Message,
    FileChunk,
    Ack,
    HistoryRequest,
    StatusRequest,
    Leave,
}

/// The sealed form of `content` after encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedContent {
    pub iv: String,
    pub encrypted: String,
    pub auth_tag: String,
}

/// One datagram, before JSON framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub message_id: String,
    pub peer_id: String,
    pub display_name: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<SealedContent>,
}

/// One ordered part of a chat message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    /// Literal text.
    Text { content: String },
    /// Reference to a file announced in the same message.
    File { id: String },
}

/// Metadata for a file announced by a `message` envelope. The payload
/// itself follows as `file_chunk` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    /// Length of the pre-encoded payload in bytes.
    pub size: u64,
    pub total_chunks: u32,
}

/// `content` of a `message` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub structure: Vec<MessagePart>,
    #[serde(default)]
    pub files: Vec<FileMeta>,
}

/// `content` of a `file_chunk` envelope. `chunk_data` is a slice of the
/// sender's pre-encoded (base64 text) payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkContent {
    pub file_id: String,
    pub chunk_index: u32,
    pub chunk_data: String,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Serialize an envelope, sealing `content` when a room key is present.
pub fn encode(mut env: Envelope, key: Option<&RoomKey>) -> Vec<u8> {
    if let (Some(content), Some(key)) = (env.content.take(), key) {
        let plain =
            serde_json::to_vec(&content).expect("JSON value serialisation is infallible");
        let (iv, encrypted, auth_tag) = key.seal(&plain);
        env.encrypted = Some(SealedContent {
            iv,
            encrypted,
            auth_tag,
        });
    }
    serde_json::to_vec(&env).expect("envelope serialisation is infallible")
}

/// Parse a datagram into an envelope without touching the sealed payload.
///
/// Kept separate from [`open_content`] so the dedup check can run on the
/// plaintext `messageId` before any decryption work is spent.
pub fn decode(datagram: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(datagram)?)
}

/// Open the sealed payload, if any, and reinstall `content`.
pub fn open_content(env: &mut Envelope, key: Option<&RoomKey>) -> Result<(), CodecError> {
    if let (Some(sealed), Some(key)) = (env.encrypted.take(), key) {
        let plain = key.open(&sealed.iv, &sealed.encrypted, &sealed.auth_tag)?;
        env.content = Some(serde_json::from_slice(&plain)?);
    }
    Ok(())
}

impl Envelope {
    /// Typed view of a `message` envelope's content.
    pub fn message_content(&self) -> Result<MessageContent, CodecError> {
        Ok(serde_json::from_value(
            self.content.clone().unwrap_or(Value::Null),
        )?)
    }

    /// Typed view of a `file_chunk` envelope's content.
    pub fn chunk_content(&self) -> Result<ChunkContent, CodecError> {
        Ok(serde_json::from_value(
            self.content.clone().unwrap_or(Value::Null),
        )?)
    }
}
