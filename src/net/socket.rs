//! Shared async socket layer: framed TCP sessions plus a broadcast-capable
//! UDP endpoint.
//!
//! TCP frames are length-prefixed: a `u32` big-endian byte count followed by
//! the payload. Each connection gets a reader task (delivers frames in wire
//! order) and a writer task draining an ordered queue, so concurrent senders
//! never interleave partial frames. Connections are keyed by their remote
//! `"ip:port"` endpoint string.
//!
//! EOF and connection resets surface as `Disconnected`; every other I/O
//! failure surfaces as `Error` with a message.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::utils::shutdown::Shutdown;

/// Upper bound on a single frame. A 1 MiB chunk grows to ~1.4 MiB as base64
/// plus envelope overhead; anything past this is a broken or hostile peer.
pub const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

/// Connection lifecycle notifications delivered alongside frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Error,
}

pub type FrameCallback = Arc<dyn Fn(Vec<u8>, String) + Send + Sync>;
pub type LinkCallback = Arc<dyn Fn(LinkState, String, Option<String>) + Send + Sync>;
pub type DatagramCallback = Arc<dyn Fn(Vec<u8>, SocketAddr) + Send + Sync>;

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<usize>>,
}

struct Connection {
    writer_tx: mpsc::UnboundedSender<WriteRequest>,
}

pub struct SocketService {
    connections: Mutex<HashMap<String, Connection>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: Shutdown,
}

impl SocketService {
    pub fn new(shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            udp: Mutex::new(None),
            shutdown,
        })
    }

    // ── TCP ──────────────────────────────────────────────────────────────

    /// Bind a TCP listener and accept sessions until shutdown.
    ///
    /// Returns the actually bound port (useful with port 0).
    pub async fn listen_tcp(
        self: &Arc<Self>,
        port: u16,
        on_frame: FrameCallback,
        on_link: LinkCallback,
    ) -> Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed to bind TCP listener on port {port}"))?;
        let bound = listener.local_addr()?.port();
        info!(event = "tcp_listener_bound", port = bound, "TCP listener started");

        let service = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let endpoint = remote.to_string();
                            debug!(event = "tcp_accepted", endpoint = %endpoint, "Inbound connection");
                            service.adopt_stream(stream, endpoint, on_frame.clone(), on_link.clone());
                        }
                        Err(e) => {
                            warn!(event = "tcp_accept_failure", error = %e, "Accept failed");
                        }
                    }
                }
            }
            debug!(event = "tcp_listener_stopped", port = bound, "TCP listener stopped");
        });

        Ok(bound)
    }

    /// Dial a remote transfer endpoint. Returns the connection's endpoint key.
    pub async fn dial_tcp(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        on_frame: FrameCallback,
        on_link: LinkCallback,
    ) -> Result<String> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        let endpoint = stream.peer_addr()?.to_string();
        debug!(event = "tcp_dialed", endpoint = %endpoint, "Outbound connection established");
        self.adopt_stream(stream, endpoint.clone(), on_frame, on_link);
        Ok(endpoint)
    }

    pub fn has_connection(&self, endpoint: &str) -> bool {
        self.connections.lock().contains_key(endpoint)
    }

    /// Enqueue one frame for `endpoint`. Resolves once the write completed.
    ///
    /// Writes to the same endpoint are applied in submission order. Sending
    /// to an unknown or closed endpoint resolves with an error.
    pub async fn send_tcp(&self, endpoint: &str, bytes: Vec<u8>) -> Result<usize> {
        let writer_tx = self
            .connections
            .lock()
            .get(endpoint)
            .map(|c| c.writer_tx.clone())
            .ok_or_else(|| anyhow!("no connection to {endpoint}"))?;

        let (done_tx, done_rx) = oneshot::channel();
        writer_tx
            .send(WriteRequest {
                bytes,
                done: done_tx,
            })
            .map_err(|_| anyhow!("connection to {endpoint} is closed"))?;

        done_rx
            .await
            .map_err(|_| anyhow!("connection to {endpoint} closed during send"))?
    }

    fn adopt_stream(
        self: &Arc<Self>,
        stream: TcpStream,
        endpoint: String,
        on_frame: FrameCallback,
        on_link: LinkCallback,
    ) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .insert(endpoint.clone(), Connection { writer_tx });

        tokio::spawn(write_loop(writer, writer_rx));

        on_link(LinkState::Connected, endpoint.clone(), None);

        let service = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(Some(bytes)) => on_frame(bytes, endpoint.clone()),
                        Ok(None) => {
                            debug!(event = "tcp_disconnected", endpoint = %endpoint, "Connection closed");
                            service.drop_connection(&endpoint);
                            on_link(LinkState::Disconnected, endpoint.clone(), None);
                            break;
                        }
                        Err(e) => {
                            warn!(event = "tcp_read_failure", endpoint = %endpoint, error = %e, "Connection error");
                            service.drop_connection(&endpoint);
                            on_link(LinkState::Error, endpoint.clone(), Some(e.to_string()));
                            break;
                        }
                    }
                }
            }
        });
    }

    fn drop_connection(&self, endpoint: &str) {
        self.connections.lock().remove(endpoint);
    }

    // ── UDP ──────────────────────────────────────────────────────────────

    /// Open the discovery datagram socket with broadcast permitted.
    ///
    /// Returns the actually bound port (useful with port 0).
    pub async fn bind_udp(
        self: &Arc<Self>,
        port: u16,
        on_datagram: DatagramCallback,
    ) -> Result<u16> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;

        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("failed to bind UDP socket on port {port}"))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let bound = socket.local_addr()?.port();
        info!(event = "udp_socket_bound", port = bound, "Discovery socket started");

        *self.udp.lock() = Some(Arc::clone(&socket));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, source)) => on_datagram(buf[..len].to_vec(), source),
                        Err(e) => {
                            warn!(event = "udp_recv_failure", error = %e, "Datagram receive failed");
                        }
                    }
                }
            }
            debug!(event = "udp_socket_stopped", port = bound, "Discovery socket stopped");
        });

        Ok(bound)
    }

    /// Broadcast a datagram to the whole segment on `port`.
    pub async fn broadcast_udp(&self, port: u16, bytes: &[u8]) -> Result<usize> {
        let socket = self.udp_socket()?;
        socket
            .send_to(bytes, SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
            .await
            .context("broadcast send failed")
    }

    /// Send a datagram to one specific host.
    pub async fn send_udp(&self, host: &str, port: u16, bytes: &[u8]) -> Result<usize> {
        let socket = self.udp_socket()?;
        socket
            .send_to(bytes, (host, port))
            .await
            .with_context(|| format!("datagram send to {host}:{port} failed"))
    }

    fn udp_socket(&self) -> Result<Arc<UdpSocket>> {
        self.udp
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("UDP socket not bound"))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Close the listener, all connections, and the UDP socket. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.lock().clear();
        *self.udp.lock() = None;
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        let total = request.bytes.len();
        let outcome = async {
            writer.write_u32(total as u32).await?;
            writer.write_all(&request.bytes).await?;
            writer.flush().await?;
            Ok::<usize, std::io::Error>(total)
        }
        .await;

        let failed = outcome.is_err();
        let _ = request.done.send(outcome.map_err(Into::into));
        if failed {
            // The connection is broken; the reader side reports the status.
            break;
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed cleanly.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if is_disconnect(&e) => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    };

    if len > MAX_FRAME_LEN {
        bail!("oversized frame: {len} bytes");
    }

    let mut buf = vec![0u8; len as usize];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(buf)),
        Err(e) if is_disconnect(&e) => Ok(None),
        Err(e) => Err(e).context("failed to read frame body"),
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
