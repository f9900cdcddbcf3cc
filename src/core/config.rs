//! Centralized configuration for a node.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (frame caps, crypto sizes) stay in
//! their respective modules.

use std::path::PathBuf;
use std::time::Duration;

/// UDP port announcements are broadcast on and listened for.
pub const DEFAULT_DISCOVERY_PORT: u16 = 34567;

/// TCP port the transfer listener binds.
pub const DEFAULT_TRANSFER_PORT: u16 = 34568;

/// How often the local node announces itself.
pub const DEFAULT_ANNOUNCEMENT_INTERVAL: Duration = Duration::from_millis(5_000);

/// A peer unheard from for this long is dropped from the peer table.
pub const DEFAULT_TIMEOUT_INTERVAL: Duration = Duration::from_millis(15_000);

/// Cadence of the peer-expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(1_000);

/// File body slice carried per FileData message (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Pause between chunk sends. Bounds cancellation latency and keeps one
/// transfer from monopolizing the link.
pub const DEFAULT_CHUNK_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Discovery port. Port 0 lets the OS pick (single-machine testing).
    pub discovery_port: u16,
    /// Transfer listener port. Port 0 lets the OS pick; the actually bound
    /// port is what gets announced to peers.
    pub transfer_port: u16,
    pub announcement_interval: Duration,
    pub timeout_interval: Duration,
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    /// When set, an outgoing transfer still waiting for the peer's response
    /// after this long fails. Off by default.
    pub handshake_timeout: Option<Duration>,
    /// Initial display name. Defaults to "User on <os>".
    pub display_name: Option<String>,
    /// Initial download directory. Defaults to the platform downloads folder.
    pub download_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            announcement_interval: DEFAULT_ANNOUNCEMENT_INTERVAL,
            timeout_interval: DEFAULT_TIMEOUT_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pause: DEFAULT_CHUNK_PAUSE,
            handshake_timeout: None,
            display_name: None,
            download_dir: None,
        }
    }
}
