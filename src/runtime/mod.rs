//! The node runtime: one worker task that owns all session state and talks
//! to the shell through a command/event channel pair.
//!
//! [`spawn_runtime`] starts the worker and returns a cloneable
//! [`RuntimeHandle`] plus the event stream. Request/response calls travel
//! as commands carrying a oneshot reply channel; everything asynchronous
//! (messages, file progress, peer changes) arrives as [`RuntimeEvent`]s.
//! The worker is the only task that ever touches the [`Session`], so state
//! mutations are serialized without any locking.

pub mod messages;
pub mod node;

use tokio::sync::{mpsc, oneshot};

use messages::{ChatMessage, FilePayload, PeerInfo};
use node::peers::SWEEP_INTERVAL;
use node::protocol::MessagePart;
use node::{NodeError, Session, SessionInput};

/// Asynchronous events emitted by the node for the shell.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A chat message entered the log (live send or history replay).
    NewMessage(ChatMessage),
    /// Reassembly progress for an announced file.
    FileChunkReceived {
        file_id: String,
        chunk_index: u32,
        received: u32,
        total_chunks: u32,
    },
    /// A file finished reassembling. `data` is the sender's pre-encoded
    /// payload; decoding it is the shell's business.
    FileReceived {
        file_id: String,
        name: String,
        data: String,
    },
    /// The peer table changed: sighting, rename, leave, or timeout.
    PeersChanged(Vec<PeerInfo>),
    /// Human-readable status line.
    Status(String),
    /// Non-fatal trouble the shell may want to surface.
    Error(String),
}

enum RuntimeCommand {
    Join {
        room: String,
        display_name: String,
        reply: oneshot::Sender<Result<u16, NodeError>>,
    },
    SendMessage {
        structure: Vec<MessagePart>,
        files: Vec<FilePayload>,
        reply: oneshot::Sender<Result<ChatMessage, NodeError>>,
    },
    SendFileChunk {
        file_id: String,
        chunk_index: u32,
        chunk_data: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
    Leave {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle for driving the runtime worker.
#[derive(Clone)]
pub struct RuntimeHandle {
    command_tx: mpsc::Sender<RuntimeCommand>,
}

impl RuntimeHandle {
    /// Join a room. Resolves with the UDP port the session bound.
    pub async fn join_room(&self, room: &str, display_name: &str) -> Result<u16, NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(RuntimeCommand::Join {
            room: room.to_string(),
            display_name: display_name.to_string(),
            reply,
        })
        .await?;
        response.await.map_err(|_| NodeError::Closed)?
    }

    /// Send a chat message, optionally carrying file payloads that will be
    /// streamed as chunks after the announcement.
    pub async fn send_message(
        &self,
        structure: Vec<MessagePart>,
        files: Vec<FilePayload>,
    ) -> Result<ChatMessage, NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(RuntimeCommand::SendMessage {
            structure,
            files,
            reply,
        })
        .await?;
        response.await.map_err(|_| NodeError::Closed)?
    }

    /// Broadcast one externally produced file chunk.
    pub async fn send_file_chunk(
        &self,
        file_id: String,
        chunk_index: u32,
        chunk_data: String,
    ) -> Result<(), NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(RuntimeCommand::SendFileChunk {
            file_id,
            chunk_index,
            chunk_data,
            reply,
        })
        .await?;
        response.await.map_err(|_| NodeError::Closed)?
    }

    /// Snapshot of the live peers. Empty when not joined.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(RuntimeCommand::GetPeers(reply)).await?;
        response.await.map_err(|_| NodeError::Closed)
    }

    /// Leave the current room, if any. Always succeeds.
    pub async fn leave_room(&self) -> Result<(), NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(RuntimeCommand::Leave { reply }).await?;
        response.await.map_err(|_| NodeError::Closed)
    }

    /// Stop the worker. The current room is left gracefully.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.send(RuntimeCommand::Shutdown).await
    }

    async fn send(&self, command: RuntimeCommand) -> Result<(), NodeError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| NodeError::Closed)
    }
}

/// Start the runtime worker. Returns the command handle and the event
/// stream; dropping the handle (or calling [`RuntimeHandle::shutdown`])
/// stops the worker.
pub fn spawn_runtime() -> (RuntimeHandle, mpsc::Receiver<RuntimeEvent>) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(512);

    tokio::spawn(async move {
        RuntimeWorker::new(event_tx).run(command_rx).await;
    });

    (RuntimeHandle { command_tx }, event_rx)
}

struct RuntimeWorker {
    events: mpsc::Sender<RuntimeEvent>,
    session: Option<Session>,
    inbound_rx: Option<mpsc::Receiver<SessionInput>>,
}

impl RuntimeWorker {
    fn new(events: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            events,
            session: None,
            inbound_rx: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<RuntimeCommand>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                input = Self::next_input(&mut self.inbound_rx) => match input {
                    Some(input) => {
                        if let Some(session) = self.session.as_mut() {
                            session.handle(input).await;
                        }
                    }
                    // Receive loop went away; stop polling the dead channel.
                    None => self.inbound_rx = None,
                },
                _ = sweep.tick() => {
                    if let Some(session) = self.session.as_mut() {
                        session.sweep().await;
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        log::debug!("runtime worker stopped");
    }

    /// Returns `true` when the worker should shut down.
    async fn handle_command(&mut self, command: RuntimeCommand) -> bool {
        match command {
            RuntimeCommand::Join {
                room,
                display_name,
                reply,
            } => {
                // Rejoining drops the old session first, so the same port
                // is free to be taken again.
                self.drop_session().await;

                let (inbound_tx, inbound_rx) = mpsc::channel(256);
                match Session::join(&room, &display_name, self.events.clone(), inbound_tx).await {
                    Ok(session) => {
                        let port = session.port();
                        self.inbound_rx = Some(inbound_rx);
                        self.session = Some(session);
                        self.emit(RuntimeEvent::Status(format!(
                            "joined '{room}' on port {port}"
                        )))
                        .await;
                        let _ = reply.send(Ok(port));
                    }
                    Err(err) => {
                        self.emit(RuntimeEvent::Error(format!("join failed: {err}")))
                            .await;
                        let _ = reply.send(Err(err));
                    }
                }
            }
            RuntimeCommand::SendMessage {
                structure,
                files,
                reply,
            } => match self.session.as_mut() {
                Some(session) => {
                    let message = session.send_message(structure, files).await;
                    let _ = reply.send(Ok(message));
                }
                None => {
                    let _ = reply.send(Err(NodeError::NotInRoom));
                }
            },
            RuntimeCommand::SendFileChunk {
                file_id,
                chunk_index,
                chunk_data,
                reply,
            } => match self.session.as_mut() {
                Some(session) => {
                    session.send_file_chunk(file_id, chunk_index, chunk_data).await;
                    let _ = reply.send(Ok(()));
                }
                None => {
                    let _ = reply.send(Err(NodeError::NotInRoom));
                }
            },
            RuntimeCommand::GetPeers(reply) => {
                let peers = self
                    .session
                    .as_ref()
                    .map(Session::peer_snapshot)
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            RuntimeCommand::Leave { reply } => {
                if self.session.is_some() {
                    self.drop_session().await;
                    self.emit(RuntimeEvent::Status("left the room".into())).await;
                }
                let _ = reply.send(());
            }
            RuntimeCommand::Shutdown => return true,
        }
        false
    }

    async fn drop_session(&mut self) {
        self.inbound_rx = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event).await;
    }

    async fn next_input(rx: &mut Option<mpsc::Receiver<SessionInput>>) -> Option<SessionInput> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}
