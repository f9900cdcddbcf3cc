//! Controller façade: the single surface an embedding front-end talks to.
//!
//! `Controller::start` wires the socket layer, discovery, and the transfer
//! engine together on the current tokio runtime. Everything a UI needs
//! (peer and transfer snapshots, initiating and cancelling transfers,
//! settings, event callbacks) goes through here; the subsystems stay
//! internal.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::core::config::Config;
use crate::core::discovery::DiscoveryService;
use crate::core::engine::TransferEngine;
use crate::core::peer_table::PeerRecord;
use crate::core::transfer::TransferRecord;
use crate::net::socket::SocketService;
use crate::utils::files::{self, FileInfo};
use crate::utils::shutdown::Shutdown;

pub struct Controller {
    socket: Arc<SocketService>,
    discovery: Arc<DiscoveryService>,
    engine: Arc<TransferEngine>,
    shutdown: Shutdown,
}

impl Controller {
    /// Bring up a node: bind the transfer listener, start discovery, and
    /// spawn all background tasks.
    pub async fn start(config: Config) -> Result<Self> {
        let shutdown = Shutdown::new();
        let socket = SocketService::new(shutdown.clone());
        let discovery = DiscoveryService::new(Arc::clone(&socket), &config, shutdown.clone());
        let engine = TransferEngine::new(
            Arc::clone(&socket),
            Arc::clone(&discovery),
            &config,
            shutdown.clone(),
        );

        // The engine binds first: its actual TCP port is what discovery
        // must advertise.
        let transfer_port = engine.start().await?;
        discovery.start(transfer_port).await?;

        info!(
            event = "node_started",
            peer_id = %discovery.peer_id(),
            transfer_port,
            discovery_port = discovery.discovery_port(),
            "Node started"
        );

        Ok(Self {
            socket,
            discovery,
            engine,
            shutdown,
        })
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub fn peer_id(&self) -> &str {
        self.discovery.peer_id()
    }

    pub fn display_name(&self) -> String {
        self.discovery.display_name()
    }

    pub fn set_display_name(&self, name: &str) {
        self.discovery.set_display_name(name);
    }

    pub fn transfer_port(&self) -> u16 {
        self.engine.transfer_port()
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery.discovery_port()
    }

    // ── Peers ────────────────────────────────────────────────────────────

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.discovery.peers()
    }

    /// Send one announcement directly to a host, for segments where
    /// broadcast does not reach.
    pub async fn announce_to(&self, host: &str, port: u16) -> Result<()> {
        self.discovery.announce_to(host, port).await
    }

    // ── Transfers ────────────────────────────────────────────────────────

    /// Offer a file to a discovered peer. Returns the transfer id; progress
    /// and the outcome arrive through the status callback.
    pub async fn send_file(&self, peer_id: &str, file_path: impl AsRef<Path>) -> Result<String> {
        self.engine.send_file(peer_id, file_path.as_ref()).await
    }

    /// Cancel a transfer. Idempotent; `false` when the id is unknown or the
    /// transfer already terminated.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> bool {
        self.engine.cancel_transfer(transfer_id).await
    }

    pub fn list_transfers(&self) -> Vec<TransferRecord> {
        self.engine.transfers()
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.engine.transfer(transfer_id)
    }

    /// Stat a local file (size, modification time, MIME type), for front-ends
    /// presenting a picker.
    pub fn file_info(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        files::file_info(path.as_ref())
    }

    // ── Settings ─────────────────────────────────────────────────────────

    pub fn download_dir(&self) -> PathBuf {
        self.engine.download_dir()
    }

    pub fn set_download_dir(&self, dir: impl Into<PathBuf>) {
        self.engine.set_download_dir(dir.into());
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.engine.set_encryption_enabled(enabled);
    }

    pub fn set_encryption_password(&self, password: &str) {
        self.engine.set_encryption_password(password);
    }

    // ── Callback registration ────────────────────────────────────────────

    /// Status and progress feed; fired on every change of any transfer.
    pub fn on_status(&self, callback: impl Fn(TransferRecord) + Send + Sync + 'static) {
        self.engine.on_status(Arc::new(callback));
    }

    /// Consent hook for inbound requests. Without one, requests are accepted.
    pub fn on_request(&self, callback: impl Fn(TransferRecord) -> bool + Send + Sync + 'static) {
        self.engine.on_request(Arc::new(callback));
    }

    pub fn on_peer_discovered(&self, callback: impl Fn(PeerRecord, bool) + Send + Sync + 'static) {
        self.discovery.on_peer_discovered(Arc::new(callback));
    }

    pub fn on_peer_lost(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.discovery.on_peer_lost(Arc::new(callback));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop the node: cancel active transfers best-effort, then close all
    /// sockets and background tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(event = "node_stopping", peer_id = %self.discovery.peer_id(), "Shutting down");
        self.engine.cancel_all().await;
        self.socket.shutdown();
    }
}
