//! The joined-room session: identity, peer table, message log, dedup cache,
//! file buffers, and the envelope router.
//!
//! A [`Session`] exists only between a successful join and the matching
//! leave. It is owned by the runtime worker task and never shared, so every
//! state mutation is serialized by construction; the socket receive loop
//! and the delayed history kick feed it through a channel instead of
//! touching it directly.

pub mod crypto;
pub mod dedup;
pub mod files;
pub mod peers;
pub mod port;
pub mod protocol;
pub mod transport;

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crypto::RoomKey;
use dedup::DedupCache;
use files::{ChunkOutcome, FileStore};
use peers::{PeerTable, Sighting};
use protocol::{ChunkContent, Envelope, EnvelopeKind, FileMeta, MessageContent, MessagePart};
use transport::{TransportError, UdpTransport};

use super::messages::{ChatMessage, FilePayload, PeerInfo};
use super::RuntimeEvent;

/// Delay between the join announcement and the history request, giving the
/// join datagram a head start so peers already know the requester.
const HISTORY_REQUEST_DELAY: Duration = Duration::from_millis(500);

/// Pacing between consecutive outbound file chunks.
const CHUNK_PACING: Duration = Duration::from_millis(5);

/// How long `leave` lets the goodbye datagram drain before the socket goes
/// away.
const LEAVE_DRAIN: Duration = Duration::from_millis(100);

/// Display name used when the caller provides none.
const ANONYMOUS: &str = "Anonymous";

/// Errors surfaced through the boundary API.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("room name is empty or contains unsupported characters")]
    InvalidRoom,
    #[error("no free port for the room: {base}..={last} all in use")]
    BindExhausted { base: u16, last: u16 },
    #[error("not in a room")]
    NotInRoom,
    #[error("socket error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("bind attempt timed out")]
    BindTimeout,
    #[error("runtime is shut down")]
    Closed,
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::BindExhausted { base } => NodeError::BindExhausted {
                base,
                last: base + transport::BIND_ATTEMPTS - 1,
            },
            TransportError::Socket(io) => NodeError::Transport(io),
            TransportError::Timeout => NodeError::BindTimeout,
        }
    }
}

/// Work fed into the session by its background tasks.
#[derive(Debug)]
pub enum SessionInput {
    /// A raw datagram from the socket receive loop.
    Datagram(Vec<u8>, SocketAddr),
    /// Fires once, [`HISTORY_REQUEST_DELAY`] after the join announcement.
    HistoryKick,
}

/// Canonical form of a room name: trimmed, spaces to dashes, lowercased,
/// first letter upper-cased. Both the key and the port derive from this
/// form, so every node must agree on it.
pub fn normalize_room(raw: &str) -> Result<String, NodeError> {
    let lowered = raw.trim().replace(' ', "-").to_lowercase();
    let mut chars = lowered.chars();
    let name = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => return Err(NodeError::InvalidRoom),
    };
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(NodeError::InvalidRoom);
    }
    Ok(name)
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Everything that exists only while the node is joined to a room.
pub struct Session {
    room: String,
    peer_id: String,
    display_name: String,
    key: RoomKey,
    transport: UdpTransport,
    peers: PeerTable,
    log: Vec<ChatMessage>,
    dedup: DedupCache,
    files: FileStore,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    recv_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Join a room: derive key and port, bind with fallback, announce
    /// ourselves, and schedule the history request. Background tasks report
    /// through `inbound`; the caller must keep draining it into
    /// [`Session::handle`].
    pub async fn join(
        raw_room: &str,
        display_name: &str,
        events: mpsc::Sender<RuntimeEvent>,
        inbound: mpsc::Sender<SessionInput>,
    ) -> Result<Self, NodeError> {
        let room = normalize_room(raw_room)?;
        let display_name = match display_name.trim() {
            "" => ANONYMOUS.to_string(),
            name => name.to_string(),
        };
        let peer_id = format!("{:016x}", rand::random::<u64>());
        let key = RoomKey::derive(&room);
        let transport = UdpTransport::bind(port::room_port(&room)).await?;

        let cancel = CancellationToken::new();
        let recv_task = transport.spawn_receiver(inbound.clone(), cancel.clone());

        let session = Self {
            room,
            peer_id,
            display_name,
            key,
            transport,
            peers: PeerTable::new(),
            log: Vec::new(),
            dedup: DedupCache::new(),
            files: FileStore::new(),
            events,
            cancel,
            recv_task,
        };

        session.broadcast(EnvelopeKind::Join, None).await;

        let kick = inbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HISTORY_REQUEST_DELAY).await;
            let _ = kick.send(SessionInput::HistoryKick).await;
        });

        log::info!(
            "joined room '{}' as {} ({}) on port {}",
            session.room,
            session.display_name,
            session.peer_id,
            session.transport.port()
        );
        Ok(session)
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    /// Boundary snapshot of the live peers.
    pub fn peer_snapshot(&self) -> Vec<PeerInfo> {
        self.peers
            .iter_live()
            .map(|(peer_id, record)| PeerInfo {
                peer_id: peer_id.clone(),
                display_name: record.display_name.clone(),
                last_seen: record.last_seen,
            })
            .collect()
    }

    /// Announce the goodbye, give it a moment to drain, and tear the
    /// session down. All room state dies with `self`.
    pub async fn close(self) {
        self.broadcast(EnvelopeKind::Leave, None).await;
        tokio::time::sleep(LEAVE_DRAIN).await;
        self.cancel.cancel();
        // The receive loop holds a clone of the socket; wait it out so the
        // port is actually free when a rejoin tries to bind it again.
        let _ = self.recv_task.await;
        log::info!("left room '{}'", self.room);
    }

    /// Local send: append to the log, announce the message, then stream any
    /// file payloads chunk by chunk.
    pub async fn send_message(
        &mut self,
        structure: Vec<MessagePart>,
        files: Vec<FilePayload>,
    ) -> ChatMessage {
        let metas: Vec<FileMeta> = files
            .iter()
            .map(|file| FileMeta {
                id: file.id.clone(),
                name: file.name.clone(),
                size: file.data.len() as u64,
                total_chunks: files::chunk_count(file.data.len() as u64),
            })
            .collect();

        let content = MessageContent {
            structure: structure.clone(),
            files: metas.clone(),
        };
        let env = self.envelope(
            EnvelopeKind::Message,
            Some(to_value(&content)),
        );
        let message = ChatMessage {
            message_id: env.message_id.clone(),
            sender: self.display_name.clone(),
            timestamp: env.timestamp,
            structure,
            files: metas,
        };

        self.log.push(message.clone());
        for file in files {
            self.files.insert_complete(&file.id, file.data);
        }

        self.fan_out(protocol::encode(env, Some(&self.key))).await;

        for meta in &message.files {
            if let Some(payload) = self.files.payload(&meta.id) {
                self.stream_chunks(&meta.id, payload, None).await;
            }
        }

        message
    }

    /// Wrap one externally produced chunk and fan it out. Delivery is
    /// best-effort: no retry, dedup-protected, reassembly-verified by the
    /// receiver.
    pub async fn send_file_chunk(&self, file_id: String, chunk_index: u32, chunk_data: String) {
        let content = ChunkContent {
            file_id,
            chunk_index,
            chunk_data,
        };
        self.broadcast(EnvelopeKind::FileChunk, Some(to_value(&content)))
            .await;
    }

    /// Periodic peer eviction pass.
    pub async fn sweep(&mut self) {
        let timed_out = self.peers.sweep(now_millis());
        if timed_out.is_empty() {
            return;
        }
        for peer_id in &timed_out {
            log::info!("peer {peer_id} timed out");
        }
        self.emit_peers().await;
    }

    /// Entry point for everything the background tasks feed in.
    pub async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::HistoryKick => {
                self.broadcast(EnvelopeKind::HistoryRequest, None).await;
            }
            SessionInput::Datagram(bytes, source) => self.handle_datagram(&bytes, source).await,
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr) {
        let mut env = match protocol::decode(bytes) {
            Ok(env) => env,
            Err(err) => {
                log::debug!("dropping malformed datagram from {source}: {err}");
                return;
            }
        };

        // Our own broadcasts loop back; nothing below may see them.
        if env.peer_id == self.peer_id {
            return;
        }

        // Any valid foreign datagram counts as a liveness signal, even one
        // the dedup cache is about to drop.
        match self
            .peers
            .observe(&env.peer_id, source, &env.display_name, now_millis())
        {
            Sighting::New | Sighting::Updated => self.emit_peers().await,
            Sighting::Refreshed => {}
        }

        // Dedup runs on the plaintext id, before any decryption work.
        if !self.dedup.insert(&env.message_id) {
            return;
        }

        if let Err(err) = protocol::open_content(&mut env, Some(&self.key)) {
            log::debug!("dropping undecryptable datagram from {source}: {err}");
            return;
        }

        match env.kind {
            EnvelopeKind::Join => {
                log::info!("{} ({}) joined the room", env.display_name, env.peer_id);
            }
            EnvelopeKind::Leave => {
                if self.peers.remove(&env.peer_id) {
                    log::info!("{} ({}) left the room", env.display_name, env.peer_id);
                    self.emit_peers().await;
                }
            }
            EnvelopeKind::HistoryRequest => self.replay_history(source).await,
            EnvelopeKind::Message => self.handle_message(env).await,
            EnvelopeKind::FileChunk => self.handle_chunk(env).await,
            // Reserved for future reliable-delivery work.
            EnvelopeKind::Ack | EnvelopeKind::StatusRequest => {}
        }
    }

    async fn handle_message(&mut self, env: Envelope) {
        let content = match env.message_content() {
            Ok(content) => content,
            Err(err) => {
                log::debug!("dropping message with bad content: {err}");
                return;
            }
        };

        for meta in &content.files {
            self.files.announce(meta);
        }

        let message = ChatMessage {
            message_id: env.message_id,
            sender: env.display_name,
            timestamp: env.timestamp,
            structure: content.structure,
            files: content.files,
        };
        self.log.push(message.clone());
        let _ = self.events.send(RuntimeEvent::NewMessage(message)).await;
    }

    async fn handle_chunk(&mut self, env: Envelope) {
        let chunk = match env.chunk_content() {
            Ok(chunk) => chunk,
            Err(err) => {
                log::debug!("dropping file chunk with bad content: {err}");
                return;
            }
        };

        match self
            .files
            .accept_chunk(&chunk.file_id, chunk.chunk_index, chunk.chunk_data)
        {
            ChunkOutcome::Stored { received, total } => {
                let _ = self
                    .events
                    .send(RuntimeEvent::FileChunkReceived {
                        file_id: chunk.file_id,
                        chunk_index: chunk.chunk_index,
                        received,
                        total_chunks: total,
                    })
                    .await;
            }
            ChunkOutcome::Completed { name, data } => {
                log::info!(
                    "file '{}' ({}) reassembled, {} bytes",
                    name,
                    chunk.file_id,
                    data.len()
                );
                let _ = self
                    .events
                    .send(RuntimeEvent::FileReceived {
                        file_id: chunk.file_id,
                        name,
                        data,
                    })
                    .await;
            }
            ChunkOutcome::Ignored => {
                log::trace!("discarding chunk for unknown file {}", chunk.file_id);
            }
        }
    }

    /// Replay the whole room log to a late joiner, one message envelope per
    /// entry, each followed by the chunks of any payload we hold.
    ///
    /// Replayed messages keep their original id: several peers may answer
    /// the same request, and the duplicates collapse in the requester's
    /// dedup cache.
    async fn replay_history(&self, requester: SocketAddr) {
        if self.log.is_empty() {
            return;
        }
        log::info!(
            "replaying {} messages to {requester}",
            self.log.len()
        );
        for message in &self.log {
            let content = MessageContent {
                structure: message.structure.clone(),
                files: message.files.clone(),
            };
            let env = Envelope {
                kind: EnvelopeKind::Message,
                message_id: message.message_id.clone(),
                peer_id: self.peer_id.clone(),
                display_name: message.sender.clone(),
                timestamp: message.timestamp,
                content: Some(to_value(&content)),
                encrypted: None,
            };
            self.transport
                .send_to(&protocol::encode(env, Some(&self.key)), requester)
                .await;

            for meta in &message.files {
                if let Some(payload) = self.files.payload(&meta.id) {
                    self.stream_chunks(&meta.id, payload, Some(requester)).await;
                }
            }
        }
    }

    /// Emit the chunk envelopes for one payload, paced so a large file does
    /// not flood the segment. With a `target` the chunks go to that peer
    /// alone (history replay); otherwise they fan out like any envelope.
    async fn stream_chunks(&self, file_id: &str, payload: &str, target: Option<SocketAddr>) {
        let total = files::chunk_count(payload.len() as u64);
        for index in 0..total {
            let slice = files::chunk_slice(payload.as_bytes(), index);
            let content = ChunkContent {
                file_id: file_id.to_string(),
                chunk_index: index,
                chunk_data: String::from_utf8_lossy(slice).into_owned(),
            };
            let env = self.envelope(EnvelopeKind::FileChunk, Some(to_value(&content)));
            let datagram = protocol::encode(env, Some(&self.key));
            match target {
                Some(addr) => self.transport.send_to(&datagram, addr).await,
                None => self.fan_out(datagram).await,
            }
            tokio::time::sleep(CHUNK_PACING).await;
        }
    }

    /// Build, seal, and fan out one envelope. Returns its message id.
    async fn broadcast(&self, kind: EnvelopeKind, content: Option<Value>) -> String {
        let env = self.envelope(kind, content);
        let message_id = env.message_id.clone();
        self.fan_out(protocol::encode(env, Some(&self.key))).await;
        message_id
    }

    /// Unicast to every live peer's last observed address, then the room's
    /// limited-broadcast address. The union converges on a LAN while the
    /// dedup cache absorbs the overlap.
    async fn fan_out(&self, datagram: Vec<u8>) {
        for addr in self.peers.live_addrs() {
            self.transport.send_to(&datagram, addr).await;
        }
        self.transport.send_broadcast(&datagram).await;
    }

    fn envelope(&self, kind: EnvelopeKind, content: Option<Value>) -> Envelope {
        Envelope {
            kind,
            message_id: Uuid::new_v4().simple().to_string(),
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            timestamp: now_millis(),
            content,
            encrypted: None,
        }
    }

    async fn emit_peers(&self) {
        let _ = self
            .events
            .send(RuntimeEvent::PeersChanged(self.peer_snapshot()))
            .await;
    }
}

fn to_value<T: serde::Serialize>(content: &T) -> Value {
    serde_json::to_value(content).expect("content serialisation is infallible")
}
