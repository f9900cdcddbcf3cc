//! LAN-local peer-to-peer file transfer.
//!
//! Nodes on the same broadcast domain discover each other through periodic
//! UDP announcements, negotiate consent per file, and stream file bodies
//! over framed TCP sessions with optional password-based authenticated
//! encryption and SHA-256 integrity verification.
//!
//! The crate is consumed through [`Controller`]:
//!
//! ```no_run
//! use landrop::{Config, Controller};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node = Controller::start(Config::default()).await?;
//! node.on_request(|transfer| {
//!     println!("incoming: {} ({} bytes)", transfer.file_name, transfer.file_size);
//!     true
//! });
//! node.on_status(|transfer| {
//!     println!("{}: {:?} {:.0}%", transfer.transfer_id, transfer.status, transfer.progress_pct);
//! });
//!
//! if let Some(peer) = node.list_peers().first() {
//!     node.send_file(&peer.peer_id, "/tmp/report.pdf").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod core;
pub mod net;
pub mod utils;

pub use crate::controller::Controller;
pub use crate::core::config::Config;
pub use crate::core::peer_table::PeerRecord;
pub use crate::core::transfer::{TransferDirection, TransferRecord, TransferStatus};
pub use crate::utils::files::FileInfo;
