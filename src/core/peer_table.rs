//! In-memory table of peers currently visible on the LAN.
//!
//! Populated and refreshed from discovery announcements, pruned by the
//! timeout sweep. Deliberately not persisted: a restart starts from an
//! empty table and repopulates within one announcement interval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Identity and contact endpoint of another node, as last announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Stable for the lifetime of the remote process.
    pub peer_id: String,
    pub display_name: String,
    pub ip_address: String,
    /// TCP transfer port to dial, taken from the announcement payload.
    pub port: u16,
    pub platform: String,
    pub version: String,
    /// Unix milliseconds of the most recent announcement.
    pub last_seen: i64,
}

impl PeerRecord {
    /// `"ip:port"` key used for TCP sessions with this peer.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Peer table keyed by peer id. Callers copy snapshots out; the table itself
/// lives behind the discovery service's mutex.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record. Returns `true` when the peer was new.
    pub fn upsert(&mut self, record: PeerRecord) -> bool {
        self.peers.insert(record.peer_id.clone(), record).is_none()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove peers unheard from for longer than `timeout`; returns their ids.
    pub fn evict_expired(&mut self, now_ms: i64, timeout: Duration) -> Vec<String> {
        let cutoff = timeout.as_millis() as i64;
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now_ms - p.last_seen > cutoff)
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }
}
