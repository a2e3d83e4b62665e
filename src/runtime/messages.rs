//! Data shapes crossing the boundary between the node runtime and its
//! shell. Everything here is plain owned data; no state is shared across
//! the boundary.

use serde::{Deserialize, Serialize};

pub use super::node::protocol::{FileMeta, MessagePart};

/// One entry of the room's in-memory chat log, as delivered to the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    /// Self-asserted display name of the sender.
    pub sender: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Ordered message body: text runs and file references.
    pub structure: Vec<MessagePart>,
    /// Metadata of the files referenced by `structure`.
    pub files: Vec<FileMeta>,
}

/// A file handed over for sending. `data` is the pre-encoded payload
/// (base64 text by convention); the node treats it as an opaque sequence
/// and never looks inside.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub id: String,
    pub name: String,
    pub data: String,
}

/// Boundary view of one peer-table record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    /// Unix milliseconds of the last datagram from this peer.
    pub last_seen: u64,
}
