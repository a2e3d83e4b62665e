//! UDP socket ownership: bind with sequential port fallback, fire-and-forget
//! sends, and the receive loop.
//!
//! The socket is configured through `socket2` before it is handed to tokio
//! (socket2 → std → tokio), so broadcast and non-blocking mode are set
//! before the first packet can arrive.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SessionInput;

/// Watchdog for a single bind attempt.
const BIND_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequential ports tried per join before giving up.
pub const BIND_ATTEMPTS: u16 = 5;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Every port in `base..base + BIND_ATTEMPTS` was taken.
    #[error("no free port: {base}..={last} all in use", last = .base + BIND_ATTEMPTS - 1)]
    BindExhausted { base: u16 },
    /// A bind attempt hit a non-recoverable socket error.
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
    /// The bind watchdog expired.
    #[error("bind attempt timed out")]
    Timeout,
}

/// Owner of the session's datagram socket. Nothing else in the node calls
/// `send` or `recv`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
    broadcast_target: SocketAddr,
}

impl UdpTransport {
    /// Bind the room socket, walking `base_port..base_port + BIND_ATTEMPTS`
    /// past address collisions. Each attempt runs under a watchdog so a
    /// wedged bind cannot hang the join.
    pub async fn bind(base_port: u16) -> Result<Self, TransportError> {
        for port in base_port..base_port + BIND_ATTEMPTS {
            match tokio::time::timeout(BIND_TIMEOUT, bind_broadcast_socket(port)).await {
                Ok(Ok(socket)) => {
                    log::info!("bound room socket on udp port {port}");
                    return Ok(Self {
                        socket: Arc::new(socket),
                        port,
                        broadcast_target: SocketAddr::V4(SocketAddrV4::new(
                            Ipv4Addr::BROADCAST,
                            base_port,
                        )),
                    });
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::AddrInUse => {
                    log::debug!("udp port {port} in use, trying the next one");
                }
                Ok(Err(err)) => return Err(TransportError::Socket(err)),
                Err(_) => return Err(TransportError::Timeout),
            }
        }
        Err(TransportError::BindExhausted { base: base_port })
    }

    /// The port this session actually bound (base port or a fallback).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fire-and-forget unicast. `PermissionDenied` is expected on hosts
    /// that forbid limited broadcast and is ignored; everything else is
    /// logged and otherwise swallowed — a lost datagram is never an error
    /// at this layer.
    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) {
        if let Err(err) = self.socket.send_to(payload, dest).await {
            if err.kind() != io::ErrorKind::PermissionDenied {
                log::warn!("udp send to {dest} failed: {err}");
            }
        }
    }

    /// Send to the room's limited-broadcast address (`255.255.255.255` on
    /// the room base port).
    pub async fn send_broadcast(&self, payload: &[u8]) {
        self.send_to(payload, self.broadcast_target).await;
    }

    /// Spawn the receive loop. Each datagram is forwarded into `inbound`;
    /// the task ends when `cancel` fires.
    pub fn spawn_receiver(
        &self,
        inbound: mpsc::Sender<SessionInput>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            let datagram = SessionInput::Datagram(buf[..len].to_vec(), source);
                            // The forward must stay cancellable: a full
                            // channel during shutdown would otherwise pin
                            // the socket open forever.
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                sent = inbound.send(datagram) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            log::warn!("udp receive error: {err}");
                        }
                    }
                }
            }
            log::debug!("udp receive loop stopped");
        })
    }
}

/// Create, configure, and bind one broadcast-capable datagram socket.
async fn bind_broadcast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_broadcast(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_falls_back_on_collision() {
        let first = UdpTransport::bind(46200).await.unwrap();
        assert_eq!(first.port(), 46200);

        let second = UdpTransport::bind(46200).await.unwrap();
        assert_eq!(second.port(), 46201);
    }

    #[tokio::test]
    async fn test_bind_exhaustion() {
        let mut held = Vec::new();
        for _ in 0..BIND_ATTEMPTS {
            held.push(UdpTransport::bind(46300).await.unwrap());
        }
        assert!(matches!(
            UdpTransport::bind(46300).await,
            Err(TransportError::BindExhausted { base: 46300 })
        ));
    }

    #[tokio::test]
    async fn test_unicast_reaches_receiver() {
        let transport = UdpTransport::bind(46400).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        transport.spawn_receiver(tx, cancel.clone());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"ping", ("127.0.0.1", transport.port()))
            .await
            .unwrap();

        let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match input {
            SessionInput::Datagram(bytes, _) => assert_eq!(bytes, b"ping"),
            other => panic!("unexpected input: {other:?}"),
        }
        cancel.cancel();
    }
}
