//! LAN peer discovery over UDP broadcast announcements.
//!
//! Every announcement interval the service broadcasts a JSON datagram
//! advertising the local node; received announcements keep the peer table
//! fresh. A 1 s sweep drops peers whose last announcement is older than the
//! timeout interval. Peer identity is a UUIDv4 string generated once per
//! process.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::{Config, SWEEP_INTERVAL};
use crate::core::peer_table::{PeerRecord, PeerTable};
use crate::net::socket::{DatagramCallback, SocketService};
use crate::utils::shutdown::Shutdown;
use crate::utils::time::now_millis;

pub type PeerDiscoveredCallback = Arc<dyn Fn(PeerRecord, bool) + Send + Sync>;
pub type PeerLostCallback = Arc<dyn Fn(String) + Send + Sync>;

/// On-wire announcement datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Announcement {
    #[serde(rename = "type")]
    kind: String,
    peer_id: String,
    name: String,
    /// TCP transfer port peers must dial, not the discovery port.
    port: u16,
    platform: String,
    version: String,
    timestamp: i64,
}

pub struct DiscoveryService {
    socket: Arc<SocketService>,
    announcement_interval: Duration,
    timeout_interval: Duration,
    configured_port: u16,
    /// Discovery port actually bound (differs from configured when 0).
    bound_port: AtomicU16,
    /// Transfer port advertised in announcements; set at start.
    advertised_port: AtomicU16,
    peer_id: String,
    display_name: Mutex<String>,
    peers: Mutex<PeerTable>,
    on_discovered: Mutex<Option<PeerDiscoveredCallback>>,
    on_lost: Mutex<Option<PeerLostCallback>>,
    shutdown: Shutdown,
}

impl DiscoveryService {
    pub fn new(socket: Arc<SocketService>, config: &Config, shutdown: Shutdown) -> Arc<Self> {
        let peer_id = Uuid::new_v4().to_string();
        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| format!("User on {}", std::env::consts::OS));

        Arc::new(Self {
            socket,
            announcement_interval: config.announcement_interval,
            timeout_interval: config.timeout_interval,
            configured_port: config.discovery_port,
            bound_port: AtomicU16::new(0),
            advertised_port: AtomicU16::new(0),
            peer_id,
            display_name: Mutex::new(display_name),
            peers: Mutex::new(PeerTable::new()),
            on_discovered: Mutex::new(None),
            on_lost: Mutex::new(None),
            shutdown,
        })
    }

    /// Bind the discovery socket and spawn the announce and sweep loops.
    ///
    /// `advertised_port` is the bound TCP transfer port peers must dial.
    /// Returns the bound discovery port.
    pub async fn start(self: &Arc<Self>, advertised_port: u16) -> Result<u16> {
        self.advertised_port.store(advertised_port, Ordering::Release);

        let ingest = Arc::clone(self);
        let on_datagram: DatagramCallback =
            Arc::new(move |bytes, source| ingest.ingest_datagram(&bytes, source));
        let bound = self.socket.bind_udp(self.configured_port, on_datagram).await?;
        self.bound_port.store(bound, Ordering::Release);

        info!(
            event = "discovery_started",
            peer_id = %self.peer_id,
            discovery_port = bound,
            advertised_port,
            "Discovery service started"
        );

        // Announce loop.
        let announcer = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.announcement_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => announcer.announce_now().await,
                }
            }
            debug!(event = "announce_loop_stopped", "Announcement loop stopped");
        });

        // Timeout sweep.
        let sweeper = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => sweeper.sweep_expired(),
                }
            }
            debug!(event = "sweep_loop_stopped", "Timeout sweep stopped");
        });

        Ok(bound)
    }

    // ── Identity & settings ──────────────────────────────────────────────

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().clone()
    }

    /// Change the display name; peers learn it through an immediate
    /// announcement.
    pub fn set_display_name(self: &Arc<Self>, name: &str) {
        *self.display_name.lock() = name.to_string();
        debug!(event = "display_name_changed", name = %name, "Display name updated");

        if self.bound_port.load(Ordering::Acquire) != 0 {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.announce_now().await });
        }
    }

    pub fn discovery_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    // ── Peer queries ─────────────────────────────────────────────────────

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().snapshot()
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.lock().get(peer_id)
    }

    // ── Callback registration ────────────────────────────────────────────

    pub fn on_peer_discovered(&self, callback: PeerDiscoveredCallback) {
        *self.on_discovered.lock() = Some(callback);
    }

    pub fn on_peer_lost(&self, callback: PeerLostCallback) {
        *self.on_lost.lock() = Some(callback);
    }

    // ── Announcements ────────────────────────────────────────────────────

    fn build_announcement(&self) -> Announcement {
        Announcement {
            kind: "announcement".to_string(),
            peer_id: self.peer_id.clone(),
            name: self.display_name(),
            port: self.advertised_port.load(Ordering::Acquire),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now_millis(),
        }
    }

    /// Broadcast one announcement. Send failures are logged, never fatal.
    pub async fn announce_now(&self) {
        let announcement = self.build_announcement();
        let bytes = match serde_json::to_vec(&announcement) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(event = "announcement_encode_failure", error = %e, "Failed to encode announcement");
                return;
            }
        };

        let port = self.bound_port.load(Ordering::Acquire);
        if let Err(e) = self.socket.broadcast_udp(port, &bytes).await {
            debug!(event = "announcement_send_failure", error = %e, "Broadcast failed");
        }
    }

    /// Send one announcement to a specific host instead of broadcasting,
    /// for segments where broadcast does not reach.
    pub async fn announce_to(&self, host: &str, port: u16) -> Result<()> {
        let bytes = serde_json::to_vec(&self.build_announcement())?;
        self.socket.send_udp(host, port, &bytes).await?;
        Ok(())
    }

    // ── Reception ────────────────────────────────────────────────────────

    fn ingest_datagram(&self, bytes: &[u8], source: SocketAddr) {
        let announcement: Announcement = match serde_json::from_slice(bytes) {
            Ok(a) => a,
            Err(e) => {
                debug!(event = "discovery_datagram_invalid", source = %source, error = %e, "Dropping datagram");
                return;
            }
        };

        if announcement.kind != "announcement" {
            return;
        }
        if announcement.peer_id == self.peer_id {
            return;
        }

        // The contact IP comes from where the datagram actually originated;
        // only the port is trusted from the payload.
        let record = PeerRecord {
            peer_id: announcement.peer_id,
            display_name: announcement.name,
            ip_address: source.ip().to_string(),
            port: announcement.port,
            platform: announcement.platform,
            version: announcement.version,
            last_seen: now_millis(),
        };

        let is_new = self.peers.lock().upsert(record.clone());
        if is_new {
            info!(
                event = "peer_discovered",
                peer_id = %record.peer_id,
                name = %record.display_name,
                endpoint = %record.endpoint(),
                "New peer discovered"
            );
        } else {
            debug!(event = "peer_refreshed", peer_id = %record.peer_id, "Peer announcement refreshed");
        }

        let callback = self.on_discovered.lock().clone();
        if let Some(callback) = callback {
            callback(record, is_new);
        }
    }

    fn sweep_expired(&self) {
        let lost = self
            .peers
            .lock()
            .evict_expired(now_millis(), self.timeout_interval);
        if lost.is_empty() {
            return;
        }

        let callback = self.on_lost.lock().clone();
        for peer_id in lost {
            info!(event = "peer_lost", peer_id = %peer_id, "Peer timed out");
            if let Some(callback) = &callback {
                callback(peer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_wire_shape() {
        let shutdown = Shutdown::new();
        let socket = SocketService::new(shutdown.clone());
        let service = DiscoveryService::new(socket, &Config::default(), shutdown);
        service.advertised_port.store(34568, Ordering::Release);

        let text = serde_json::to_string(&service.build_announcement()).unwrap();
        assert!(text.contains("\"type\":\"announcement\""), "{text}");
        assert!(text.contains("\"peerId\""), "{text}");
        assert!(text.contains("\"port\":34568"), "{text}");
        assert!(text.contains("\"timestamp\""), "{text}");
    }

    #[test]
    fn own_announcements_are_ignored() {
        let shutdown = Shutdown::new();
        let socket = SocketService::new(shutdown.clone());
        let service = DiscoveryService::new(socket, &Config::default(), shutdown);

        let own = serde_json::to_vec(&service.build_announcement()).unwrap();
        service.ingest_datagram(&own, "127.0.0.1:40000".parse().unwrap());
        assert!(service.peers().is_empty());
    }

    #[test]
    fn foreign_announcement_upserts_with_source_ip() {
        let shutdown = Shutdown::new();
        let socket = SocketService::new(shutdown.clone());
        let service = DiscoveryService::new(socket, &Config::default(), shutdown);

        let foreign = Announcement {
            kind: "announcement".into(),
            peer_id: "other-peer".into(),
            name: "Bob".into(),
            port: 40123,
            platform: "linux".into(),
            version: "0.1.0".into(),
            timestamp: now_millis(),
        };
        let bytes = serde_json::to_vec(&foreign).unwrap();
        service.ingest_datagram(&bytes, "192.168.1.7:51000".parse().unwrap());

        let peer = service.peer("other-peer").expect("peer recorded");
        // IP from the datagram source, port from the payload.
        assert_eq!(peer.ip_address, "192.168.1.7");
        assert_eq!(peer.port, 40123);
        assert_eq!(peer.endpoint(), "192.168.1.7:40123");
    }

    #[test]
    fn malformed_and_unknown_datagrams_are_dropped() {
        let shutdown = Shutdown::new();
        let socket = SocketService::new(shutdown.clone());
        let service = DiscoveryService::new(socket, &Config::default(), shutdown);

        service.ingest_datagram(b"not json", "127.0.0.1:1".parse().unwrap());
        service.ingest_datagram(
            br#"{"type":"gossip","peerId":"x","name":"n","port":1,"platform":"p","version":"v","timestamp":0}"#,
            "127.0.0.1:1".parse().unwrap(),
        );
        assert!(service.peers().is_empty());
    }
}
