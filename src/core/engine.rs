//! TransferEngine: sole coordinator of all file transfer logic.
//!
//! This is the single source of truth for:
//! - Transfer lifecycle management (the state machine in `transfer.rs`)
//! - Wire-message routing by transfer id
//! - Chunked streaming with cancellation observed at chunk boundaries
//! - Consent (accept/reject) handling for inbound requests
//! - Encryption, reassembly, and integrity verification on the receive path
//!
//! All inbound frames and link-status events funnel through one ordered
//! event loop, which preserves per-connection wire order. Long-running work
//! (file reads, crypto, hashing) runs on per-transfer tasks or the blocking
//! pool, never on the event loop's reactor thread.
//!
//! No mutex is ever held across a user callback.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::discovery::DiscoveryService;
use crate::core::transfer::{
    chunk_count, ChunkBuffer, TransferDirection, TransferRecord, TransferStatus,
};
use crate::net::protocol::{
    FileData, Message, TransferCancel, TransferComplete, TransferRequest, TransferResponse,
};
use crate::net::socket::{FrameCallback, LinkCallback, LinkState, SocketService};
use crate::utils::shutdown::Shutdown;
use crate::utils::{crypto, files, hash};

/// Fired on every status or progress change of a transfer.
pub type TransferStatusCallback = Arc<dyn Fn(TransferRecord) + Send + Sync>;

/// Consent hook for inbound requests; returning `false` rejects. Absent
/// hook means accept.
pub type TransferRequestCallback = Arc<dyn Fn(TransferRecord) -> bool + Send + Sync>;

/// Everything the engine reacts to, in arrival order.
enum EngineEvent {
    Frame { bytes: Vec<u8>, endpoint: String },
    Link {
        state: LinkState,
        endpoint: String,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
struct EncryptionSettings {
    enabled: bool,
    password: String,
}

impl EncryptionSettings {
    fn in_use(&self) -> bool {
        self.enabled && !self.password.is_empty()
    }
}

pub struct TransferEngine {
    socket: Arc<SocketService>,
    discovery: Arc<DiscoveryService>,
    chunk_size: usize,
    chunk_pause: Duration,
    handshake_timeout: Option<Duration>,
    configured_port: u16,
    bound_port: AtomicU16,
    /// All live and historical transfers, keyed by transfer id.
    transfers: Mutex<HashMap<String, TransferRecord>>,
    /// Reassembly buffers for incoming transfers. Separate lock so large
    /// chunk moves never contend with the transfer table.
    chunk_buffers: Mutex<HashMap<String, ChunkBuffer>>,
    /// Plaintext hash of each outgoing file, sent with the completion notice.
    source_hashes: Mutex<HashMap<String, String>>,
    download_dir: Mutex<PathBuf>,
    encryption: Mutex<EncryptionSettings>,
    on_status: Mutex<Option<TransferStatusCallback>>,
    on_request: Mutex<Option<TransferRequestCallback>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    shutdown: Shutdown,
}

impl TransferEngine {
    pub fn new(
        socket: Arc<SocketService>,
        discovery: Arc<DiscoveryService>,
        config: &Config,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let download_dir = config
            .download_dir
            .clone()
            .unwrap_or_else(files::default_download_dir);

        Arc::new(Self {
            socket,
            discovery,
            chunk_size: config.chunk_size,
            chunk_pause: config.chunk_pause,
            handshake_timeout: config.handshake_timeout,
            configured_port: config.transfer_port,
            bound_port: AtomicU16::new(0),
            transfers: Mutex::new(HashMap::new()),
            chunk_buffers: Mutex::new(HashMap::new()),
            source_hashes: Mutex::new(HashMap::new()),
            download_dir: Mutex::new(download_dir),
            encryption: Mutex::new(EncryptionSettings::default()),
            on_status: Mutex::new(None),
            on_request: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        })
    }

    /// Bind the transfer listener and spawn the event loop.
    ///
    /// Returns the actually bound TCP port (what discovery must advertise).
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("transfer engine already started"))?;

        let port = self
            .socket
            .listen_tcp(
                self.configured_port,
                self.frame_callback(),
                self.link_callback(),
            )
            .await?;
        self.bound_port.store(port, Ordering::Release);

        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events_rx.recv() => match event {
                        Some(EngineEvent::Frame { bytes, endpoint }) => {
                            engine.handle_frame(bytes, &endpoint).await;
                        }
                        Some(EngineEvent::Link { state, endpoint, error }) => {
                            engine.handle_link(state, &endpoint, error);
                        }
                        None => break,
                    }
                }
            }
            debug!(event = "engine_loop_stopped", "Transfer engine event loop stopped");
        });

        info!(event = "engine_started", port, "Transfer engine started");
        Ok(port)
    }

    pub fn transfer_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    fn frame_callback(&self) -> FrameCallback {
        let tx = self.events_tx.clone();
        Arc::new(move |bytes, endpoint| {
            let _ = tx.send(EngineEvent::Frame { bytes, endpoint });
        })
    }

    fn link_callback(&self) -> LinkCallback {
        let tx = self.events_tx.clone();
        Arc::new(move |state, endpoint, error| {
            let _ = tx.send(EngineEvent::Link {
                state,
                endpoint,
                error,
            });
        })
    }

    // ── Settings & callbacks ─────────────────────────────────────────────

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.lock().clone()
    }

    pub fn set_download_dir(&self, dir: PathBuf) {
        debug!(event = "download_dir_changed", dir = %dir.display(), "Download directory updated");
        *self.download_dir.lock() = dir;
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.encryption.lock().enabled = enabled;
    }

    pub fn set_encryption_password(&self, password: &str) {
        self.encryption.lock().password = password.to_string();
    }

    pub fn on_status(&self, callback: TransferStatusCallback) {
        *self.on_status.lock() = Some(callback);
    }

    pub fn on_request(&self, callback: TransferRequestCallback) {
        *self.on_request.lock() = Some(callback);
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.transfers.lock().values().cloned().collect()
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.transfers.lock().get(transfer_id).cloned()
    }

    // ── Outgoing transfers ───────────────────────────────────────────────

    /// Offer `file_path` to `peer_id`. Returns the new transfer id; the
    /// transfer itself proceeds asynchronously and reports through the
    /// status callback.
    pub async fn send_file(self: &Arc<Self>, peer_id: &str, file_path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(file_path)
            .await
            .with_context(|| format!("file not found: {}", file_path.display()))?;
        if !metadata.is_file() {
            bail!("not a regular file: {}", file_path.display());
        }
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("invalid file name: {}", file_path.display()))?;

        let peer = self
            .discovery
            .peer(peer_id)
            .ok_or_else(|| anyhow!("unknown peer: {peer_id}"))?;
        let endpoint = peer.endpoint();

        if !self.socket.has_connection(&endpoint) {
            self.socket
                .dial_tcp(
                    &peer.ip_address,
                    peer.port,
                    self.frame_callback(),
                    self.link_callback(),
                )
                .await
                .with_context(|| format!("failed to connect to {}", peer.display_name))?;
        }

        let transfer_id = Uuid::new_v4().to_string();
        let record = TransferRecord::new_outgoing(
            transfer_id.clone(),
            &peer,
            file_path.to_path_buf(),
            file_name.clone(),
            metadata.len(),
        );
        self.transfers
            .lock()
            .insert(transfer_id.clone(), record.clone());

        info!(
            event = "transfer_initiated",
            transfer_id = %transfer_id,
            peer = %peer.display_name,
            file = %file_name,
            size = metadata.len(),
            "Outgoing transfer initiated"
        );
        self.notify_status(record);

        let hash_path = file_path.to_path_buf();
        let file_hash =
            match tokio::task::spawn_blocking(move || hash::file_sha256(&hash_path)).await {
                Ok(Ok(digest)) => digest,
                Ok(Err(e)) => {
                    self.fail_transfer(&transfer_id, &format!("Failed to hash file: {e}"));
                    return Err(e.context("failed to hash file"));
                }
                Err(e) => {
                    self.fail_transfer(&transfer_id, "Failed to hash file");
                    bail!("hashing task failed: {e}");
                }
            };
        self.source_hashes
            .lock()
            .insert(transfer_id.clone(), file_hash.clone());

        let request = Message::TransferRequest(TransferRequest {
            transfer_id: transfer_id.clone(),
            sender_id: self.discovery.peer_id().to_string(),
            sender_name: self.discovery.display_name(),
            file_name,
            file_size: metadata.len(),
            file_hash,
        });
        if let Err(e) = self.send_message(&endpoint, &request).await {
            self.fail_transfer(&transfer_id, "Failed to send transfer request");
            return Err(e.context("failed to send transfer request"));
        }

        self.update_status(&transfer_id, TransferStatus::Waiting, None);

        if let Some(timeout) = self.handshake_timeout {
            let engine = Arc::clone(self);
            let pending_id = transfer_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let still_waiting = engine
                    .transfers
                    .lock()
                    .get(&pending_id)
                    .map(|r| r.status == TransferStatus::Waiting)
                    .unwrap_or(false);
                if still_waiting {
                    engine.fail_transfer(&pending_id, "Handshake timed out");
                }
            });
        }

        Ok(transfer_id)
    }

    /// Stream the (possibly encrypted) file body as FileData chunks.
    ///
    /// Runs on its own task. Cancellation and failures are observed at each
    /// chunk boundary.
    async fn stream_file(self: Arc<Self>, transfer_id: String, endpoint: String) {
        let Some((file_path, file_size)) = self
            .transfers
            .lock()
            .get(&transfer_id)
            .map(|r| (r.file_path.clone(), r.file_size))
        else {
            return;
        };

        let data = match tokio::fs::read(&file_path).await {
            Ok(data) => data,
            Err(e) => {
                self.fail_transfer(&transfer_id, &format!("Failed to read file: {e}"));
                self.send_cancel_best_effort(&endpoint, &transfer_id, "sender failed to read file")
                    .await;
                return;
            }
        };

        let encryption = self.encryption.lock().clone();
        let payload = if encryption.in_use() {
            let password = encryption.password.clone();
            match tokio::task::spawn_blocking(move || crypto::encrypt(&data, &password)).await {
                Ok(Ok(sealed)) => sealed,
                Ok(Err(e)) => {
                    self.fail_transfer(&transfer_id, &format!("Encryption failed: {e}"));
                    return;
                }
                Err(e) => {
                    self.fail_transfer(&transfer_id, &format!("Encryption task failed: {e}"));
                    return;
                }
            }
        } else {
            data
        };

        let total_chunks = chunk_count(payload.len() as u64, self.chunk_size);
        debug!(
            event = "stream_started",
            transfer_id = %transfer_id,
            chunks = total_chunks,
            payload_len = payload.len(),
            encrypted = encryption.in_use(),
            "Streaming file body"
        );

        for index in 0..total_chunks {
            // Stop at the chunk boundary once the transfer left InProgress
            // (local cancel, peer cancel, or link failure).
            let still_running = self
                .transfers
                .lock()
                .get(&transfer_id)
                .map(|r| r.status == TransferStatus::InProgress)
                .unwrap_or(false);
            if !still_running {
                debug!(event = "stream_aborted", transfer_id = %transfer_id, sent = index, "Streaming stopped");
                return;
            }

            let start = index as usize * self.chunk_size;
            let end = (start + self.chunk_size).min(payload.len());
            let chunk = payload.get(start..end).unwrap_or(&[]).to_vec();

            let message = Message::FileData(FileData {
                transfer_id: transfer_id.clone(),
                chunk_index: index,
                total_chunks,
                data: chunk,
            });
            if self.send_message(&endpoint, &message).await.is_err() {
                self.fail_transfer(&transfer_id, "Failed to send file data");
                return;
            }

            let bytes_done =
                (file_size as f64 * (index + 1) as f64 / total_chunks as f64) as u64;
            self.update_progress(&transfer_id, bytes_done);

            tokio::time::sleep(self.chunk_pause).await;
        }

        let file_hash = self
            .source_hashes
            .lock()
            .get(&transfer_id)
            .cloned()
            .unwrap_or_default();
        let complete = Message::TransferComplete(TransferComplete {
            transfer_id: transfer_id.clone(),
            success: true,
            file_hash,
        });
        if self.send_message(&endpoint, &complete).await.is_err() {
            self.fail_transfer(&transfer_id, "Failed to send transfer complete message");
            return;
        }

        // Completed is entered when the receiver's acknowledgement arrives.
        debug!(event = "stream_finished", transfer_id = %transfer_id, "Awaiting receiver acknowledgement");
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Cancel a transfer. Idempotent; `false` when the id is unknown or the
    /// transfer already terminated.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let endpoint = self
            .transfers
            .lock()
            .get(transfer_id)
            .filter(|r| r.status.is_active())
            .map(|r| r.peer_endpoint.clone());
        let Some(endpoint) = endpoint else {
            return false;
        };

        // Local transition first: streaming observes it at the next chunk.
        if self
            .update_status(transfer_id, TransferStatus::Canceled, Some("Canceled by user"))
            .is_none()
        {
            return false;
        }

        info!(event = "transfer_canceled", transfer_id = %transfer_id, "Transfer canceled by user");
        self.send_cancel_best_effort(&endpoint, transfer_id, "Canceled by user")
            .await;
        true
    }

    /// Best-effort cancel of everything still active (shutdown path).
    pub async fn cancel_all(&self) {
        let active: Vec<String> = self
            .transfers
            .lock()
            .values()
            .filter(|r| r.status.is_active())
            .map(|r| r.transfer_id.clone())
            .collect();
        for transfer_id in active {
            self.cancel_transfer(&transfer_id).await;
        }
    }

    async fn send_cancel_best_effort(&self, endpoint: &str, transfer_id: &str, reason: &str) {
        let message = Message::TransferCancel(TransferCancel {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
        if let Err(e) = self.send_message(endpoint, &message).await {
            debug!(event = "cancel_notice_failed", transfer_id = %transfer_id, error = %e, "Cancel notice not delivered");
        }
    }

    // ── Inbound message handling ─────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, bytes: Vec<u8>, endpoint: &str) {
        let message = match Message::deserialize(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(event = "frame_malformed", endpoint = %endpoint, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            Message::TransferRequest(m) => self.handle_request(m, endpoint).await,
            Message::TransferResponse(m) => self.handle_response(m).await,
            Message::FileData(m) => self.handle_file_data(m, endpoint).await,
            Message::TransferComplete(m) => self.handle_complete(m),
            Message::TransferCancel(m) => self.handle_cancel(m),
        }
    }

    async fn handle_request(self: &Arc<Self>, request: TransferRequest, endpoint: &str) {
        if self.transfers.lock().contains_key(&request.transfer_id) {
            warn!(
                event = "duplicate_transfer_request",
                transfer_id = %request.transfer_id,
                "Dropping request for existing transfer"
            );
            return;
        }

        // Only the final path component of the offered name is honored.
        let file_name = Path::new(&request.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download")
            .to_string();
        let file_path = files::unique_destination(&self.download_dir(), &file_name);

        let record = TransferRecord::new_incoming(
            request.transfer_id.clone(),
            request.sender_id,
            request.sender_name,
            endpoint.to_string(),
            file_path.clone(),
            file_name.clone(),
            request.file_size,
            request.file_hash,
        );
        self.transfers
            .lock()
            .insert(request.transfer_id.clone(), record.clone());

        info!(
            event = "transfer_requested",
            transfer_id = %request.transfer_id,
            peer = %record.peer_name,
            file = %file_name,
            size = request.file_size,
            "Incoming transfer request"
        );
        self.notify_status(record.clone());

        let accepted = {
            let callback = self.on_request.lock().clone();
            match callback {
                Some(callback) => callback(record),
                None => true,
            }
        };

        let response = Message::TransferResponse(TransferResponse {
            transfer_id: request.transfer_id.clone(),
            accepted,
            receiver_id: self.discovery.peer_id().to_string(),
            receiver_name: self.discovery.display_name(),
            file_path: file_path.display().to_string(),
        });
        if let Err(e) = self.send_message(endpoint, &response).await {
            warn!(event = "response_send_failure", transfer_id = %request.transfer_id, error = %e, "Failed to answer request");
            self.fail_transfer(&request.transfer_id, "Failed to send transfer response");
            return;
        }

        if accepted {
            debug!(event = "transfer_accepted", transfer_id = %request.transfer_id, "Waiting for file data");
        } else {
            info!(event = "transfer_rejected", transfer_id = %request.transfer_id, "Transfer rejected by user");
            self.update_status(
                &request.transfer_id,
                TransferStatus::Canceled,
                Some("Transfer rejected by user"),
            );
        }
    }

    async fn handle_response(self: &Arc<Self>, response: TransferResponse) {
        let context = self
            .transfers
            .lock()
            .get(&response.transfer_id)
            .map(|r| (r.direction, r.status, r.peer_endpoint.clone()));
        let Some((direction, status, endpoint)) = context else {
            debug!(event = "unknown_transfer_frame", kind = "response", transfer_id = %response.transfer_id, "Dropping");
            return;
        };
        // Initializing is possible when the response races the sender task
        // between the request write completing and the Waiting transition.
        let awaiting = matches!(
            status,
            TransferStatus::Waiting | TransferStatus::Initializing
        );
        if direction != TransferDirection::Outgoing || !awaiting {
            debug!(event = "unexpected_response", transfer_id = %response.transfer_id, "Dropping response in wrong state");
            return;
        }

        if !response.accepted {
            info!(event = "transfer_peer_rejected", transfer_id = %response.transfer_id, "Peer rejected transfer");
            self.update_status(
                &response.transfer_id,
                TransferStatus::Canceled,
                Some("Transfer rejected by recipient"),
            );
            return;
        }

        info!(
            event = "transfer_peer_accepted",
            transfer_id = %response.transfer_id,
            receiver = %response.receiver_name,
            "Peer accepted, streaming file"
        );
        if self
            .update_status(&response.transfer_id, TransferStatus::InProgress, None)
            .is_none()
        {
            return;
        }

        let engine = Arc::clone(self);
        let transfer_id = response.transfer_id;
        tokio::spawn(async move { engine.stream_file(transfer_id, endpoint).await });
    }

    async fn handle_file_data(self: &Arc<Self>, data: FileData, endpoint: &str) {
        let context = self
            .transfers
            .lock()
            .get(&data.transfer_id)
            .map(|r| (r.direction, r.status, r.file_size));
        let Some((direction, status, file_size)) = context else {
            debug!(event = "unknown_transfer_frame", kind = "file_data", transfer_id = %data.transfer_id, "Dropping");
            return;
        };
        if direction != TransferDirection::Incoming {
            warn!(event = "misdirected_file_data", transfer_id = %data.transfer_id, "Dropping chunk for outgoing transfer");
            return;
        }

        match status {
            TransferStatus::Waiting => {
                if data.total_chunks == 0 {
                    self.fail_transfer(&data.transfer_id, "Protocol error: zero chunk count");
                    return;
                }
                self.chunk_buffers
                    .lock()
                    .insert(data.transfer_id.clone(), ChunkBuffer::new(data.total_chunks));
                self.update_status(&data.transfer_id, TransferStatus::InProgress, None);
            }
            TransferStatus::InProgress => {}
            _ => {
                // Late chunks after termination carry no meaning.
                debug!(event = "late_chunk", transfer_id = %data.transfer_id, "Dropping chunk for terminated transfer");
                return;
            }
        }

        let inserted = {
            let mut buffers = self.chunk_buffers.lock();
            match buffers.get_mut(&data.transfer_id) {
                Some(buffer) if buffer.total() == data.total_chunks => {
                    buffer.insert(data.chunk_index, data.data)
                }
                Some(buffer) => Err(anyhow!(
                    "chunk count changed mid-transfer ({} then {})",
                    buffer.total(),
                    data.total_chunks
                )),
                None => Err(anyhow!("no chunk buffer allocated")),
            }
        };
        if let Err(e) = inserted {
            self.fail_transfer(&data.transfer_id, &format!("Protocol error: {e}"));
            self.send_cancel_best_effort(endpoint, &data.transfer_id, "protocol error")
                .await;
            return;
        }

        let progress = {
            let buffers = self.chunk_buffers.lock();
            buffers
                .get(&data.transfer_id)
                .map(|b| (b.received(), b.total(), b.is_complete()))
        };
        let Some((received, total, complete)) = progress else {
            return;
        };

        let bytes_done = (file_size as f64 * received as f64 / total as f64) as u64;
        self.update_progress(&data.transfer_id, bytes_done);

        if complete {
            self.finish_incoming(&data.transfer_id, endpoint).await;
        }
    }

    /// All chunks arrived: reassemble, decrypt if configured, verify, write,
    /// and acknowledge.
    async fn finish_incoming(self: &Arc<Self>, transfer_id: &str, endpoint: &str) {
        let Some(buffer) = self.chunk_buffers.lock().remove(transfer_id) else {
            return;
        };
        let payload = match buffer.assemble() {
            Ok(payload) => payload,
            Err(e) => {
                self.fail_transfer(transfer_id, &format!("Reassembly failed: {e}"));
                return;
            }
        };

        let encryption = self.encryption.lock().clone();
        let body = if encryption.in_use() {
            let password = encryption.password.clone();
            match tokio::task::spawn_blocking(move || crypto::decrypt(&payload, &password)).await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    warn!(event = "decryption_failure", transfer_id = %transfer_id, error = %e, "Rejecting received data");
                    self.update_status(
                        transfer_id,
                        TransferStatus::Failed,
                        Some(&e.to_string()),
                    );
                    self.send_cancel_best_effort(endpoint, transfer_id, "decryption failed")
                        .await;
                    return;
                }
                Err(e) => {
                    self.fail_transfer(transfer_id, &format!("Decryption task failed: {e}"));
                    return;
                }
            }
        } else {
            payload
        };

        let Some((file_path, expected_hash)) = self
            .transfers
            .lock()
            .get(transfer_id)
            .map(|r| (r.file_path.clone(), r.expected_hash.clone()))
        else {
            return;
        };

        let expected = expected_hash.clone();
        let write_path = file_path.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(String, bool)> {
            let digest = hash::sha256_hex(&body);
            if !expected.is_empty() && digest != expected {
                return Ok((digest, false));
            }
            files::write_file_atomic(&write_path, &body)?;
            Ok((digest, true))
        })
        .await;

        let (digest, verified) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.fail_transfer(transfer_id, &format!("Failed to write file: {e}"));
                return;
            }
            Err(e) => {
                self.fail_transfer(transfer_id, &format!("File write task failed: {e}"));
                return;
            }
        };

        if !verified {
            self.fail_transfer(transfer_id, "File hash verification failed");
            let notice = Message::TransferComplete(TransferComplete {
                transfer_id: transfer_id.to_string(),
                success: false,
                file_hash: digest,
            });
            if let Err(e) = self.send_message(endpoint, &notice).await {
                debug!(event = "failure_notice_failed", transfer_id = %transfer_id, error = %e, "Failure notice not delivered");
            }
            return;
        }

        let acknowledgement = Message::TransferComplete(TransferComplete {
            transfer_id: transfer_id.to_string(),
            success: true,
            file_hash: digest,
        });
        if let Err(e) = self.send_message(endpoint, &acknowledgement).await {
            warn!(event = "ack_send_failure", transfer_id = %transfer_id, error = %e, "Failed to acknowledge completion");
            self.fail_transfer(transfer_id, "Failed to send transfer complete message");
            return;
        }

        info!(
            event = "transfer_complete",
            transfer_id = %transfer_id,
            path = %file_path.display(),
            "Incoming transfer complete"
        );
        self.update_status(transfer_id, TransferStatus::Completed, None);
    }

    fn handle_complete(&self, complete: TransferComplete) {
        let context = self
            .transfers
            .lock()
            .get(&complete.transfer_id)
            .map(|r| (r.direction, r.status));
        let Some((direction, status)) = context else {
            debug!(event = "unknown_transfer_frame", kind = "complete", transfer_id = %complete.transfer_id, "Dropping");
            return;
        };

        match (direction, status) {
            (TransferDirection::Outgoing, TransferStatus::InProgress) => {
                if complete.success {
                    info!(event = "transfer_complete", transfer_id = %complete.transfer_id, "Outgoing transfer acknowledged");
                    self.update_status(&complete.transfer_id, TransferStatus::Completed, None);
                } else {
                    self.fail_transfer(&complete.transfer_id, "Transfer failed on receiving side");
                }
            }
            _ => {
                // The sender's own completion notice reaches the receiver
                // after its final chunk; the record is already terminal.
                debug!(event = "ignored_completion_notice", transfer_id = %complete.transfer_id, "Dropping");
            }
        }
    }

    fn handle_cancel(&self, cancel: TransferCancel) {
        let reason = if cancel.reason.is_empty() {
            "Canceled by peer".to_string()
        } else {
            cancel.reason
        };
        if self
            .update_status(&cancel.transfer_id, TransferStatus::Canceled, Some(&reason))
            .is_some()
        {
            info!(event = "transfer_canceled_by_peer", transfer_id = %cancel.transfer_id, reason = %reason, "Transfer canceled");
        } else {
            debug!(event = "unknown_transfer_frame", kind = "cancel", transfer_id = %cancel.transfer_id, "Dropping");
        }
    }

    // ── Link status coupling ─────────────────────────────────────────────

    fn handle_link(&self, state: LinkState, endpoint: &str, error: Option<String>) {
        let message = match state {
            LinkState::Connected => {
                debug!(event = "link_up", endpoint = %endpoint, "Connection established");
                return;
            }
            LinkState::Disconnected => "Connection closed unexpectedly".to_string(),
            LinkState::Error => {
                format!("Connection error: {}", error.unwrap_or_default())
            }
        };

        let affected: Vec<String> = self
            .transfers
            .lock()
            .values()
            .filter(|r| r.peer_endpoint == endpoint && r.status.is_active())
            .map(|r| r.transfer_id.clone())
            .collect();
        for transfer_id in affected {
            self.fail_transfer(&transfer_id, &message);
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    async fn send_message(&self, endpoint: &str, message: &Message) -> Result<usize> {
        let bytes = message.serialize()?;
        self.socket.send_tcp(endpoint, bytes).await
    }

    /// Apply a status transition, releasing per-transfer resources on
    /// terminal entry, and notify. Returns the updated record, or `None`
    /// when the id is unknown or the record was already terminal.
    fn update_status(
        &self,
        transfer_id: &str,
        status: TransferStatus,
        error: Option<&str>,
    ) -> Option<TransferRecord> {
        let updated = {
            let mut transfers = self.transfers.lock();
            match transfers.get_mut(transfer_id) {
                Some(record) => {
                    if record.transition(status, error) {
                        Some(record.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(record) = &updated {
            if record.status.is_terminal() {
                self.chunk_buffers.lock().remove(transfer_id);
                self.source_hashes.lock().remove(transfer_id);
            }
            self.notify_status(record.clone());
        }
        updated
    }

    fn fail_transfer(&self, transfer_id: &str, message: &str) {
        warn!(event = "transfer_failed", transfer_id = %transfer_id, reason = %message, "Transfer failed");
        self.update_status(transfer_id, TransferStatus::Failed, Some(message));
    }

    fn update_progress(&self, transfer_id: &str, bytes: u64) {
        let updated = {
            let mut transfers = self.transfers.lock();
            match transfers.get_mut(transfer_id) {
                Some(record) if record.status.is_active() => {
                    record.set_progress(bytes);
                    Some(record.clone())
                }
                _ => None,
            }
        };
        if let Some(record) = updated {
            self.notify_status(record);
        }
    }

    fn notify_status(&self, record: TransferRecord) {
        let callback = self.on_status.lock().clone();
        if let Some(callback) = callback {
            callback(record);
        }
    }
}
