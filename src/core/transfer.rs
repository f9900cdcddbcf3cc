//! Transfer records and their lifecycle state machine.
//!
//! One `TransferRecord` exists per transfer id on each endpoint of a
//! session. Records survive in the table after termination for history
//! until the process exits.
//!
//! ```text
//! Initializing ─► Waiting ─► InProgress ─► Completed
//!                    │            │   └──► Failed
//!                    └────────────┴──────► Canceled
//! ```
//!
//! Terminal states (Completed, Failed, Canceled) are final: a transition
//! attempt out of one is a no-op, and entering one fixes `end_time`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::core::peer_table::PeerRecord;
use crate::utils::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    /// Outgoing only: created, request not yet on the wire.
    Initializing,
    /// Request sent (outgoing) or received (incoming); awaiting consent/data.
    Waiting,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// One file-transfer session, as exposed to callers and callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub transfer_id: String,
    pub peer_id: String,
    pub peer_name: String,
    /// `"ip:port"` of the TCP session carrying this transfer.
    pub peer_endpoint: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub progress_pct: f32,
    /// Unix milliseconds.
    pub start_time: i64,
    /// Unix milliseconds; 0 while the transfer is active.
    pub end_time: i64,
    /// Human-readable; non-empty only in Failed/Canceled.
    pub error_message: String,
    /// Incoming: sender-provided SHA-256 to verify against. Else empty.
    pub expected_hash: String,
}

impl TransferRecord {
    pub fn new_outgoing(
        transfer_id: String,
        peer: &PeerRecord,
        file_path: PathBuf,
        file_name: String,
        file_size: u64,
    ) -> Self {
        let mut record = Self {
            transfer_id,
            peer_id: peer.peer_id.clone(),
            peer_name: peer.display_name.clone(),
            peer_endpoint: peer.endpoint(),
            direction: TransferDirection::Outgoing,
            status: TransferStatus::Initializing,
            file_path,
            file_name,
            file_size,
            bytes_transferred: 0,
            progress_pct: 0.0,
            start_time: now_millis(),
            end_time: 0,
            error_message: String::new(),
            expected_hash: String::new(),
        };
        record.set_progress(0);
        record
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_incoming(
        transfer_id: String,
        peer_id: String,
        peer_name: String,
        peer_endpoint: String,
        file_path: PathBuf,
        file_name: String,
        file_size: u64,
        expected_hash: String,
    ) -> Self {
        let mut record = Self {
            transfer_id,
            peer_id,
            peer_name,
            peer_endpoint,
            direction: TransferDirection::Incoming,
            status: TransferStatus::Waiting,
            file_path,
            file_name,
            file_size,
            bytes_transferred: 0,
            progress_pct: 0.0,
            start_time: now_millis(),
            end_time: 0,
            error_message: String::new(),
            expected_hash,
        };
        record.set_progress(0);
        record
    }

    /// Apply a status transition. Returns `false` (and changes nothing) when
    /// the record is already terminal.
    pub fn transition(&mut self, status: TransferStatus, error: Option<&str>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if let Some(message) = error {
            self.error_message = message.to_string();
        }
        if status.is_terminal() {
            self.end_time = now_millis();
        }
        true
    }

    /// Update progress, clamped so `bytes_transferred` never exceeds the
    /// file size (the encrypted payload is slightly longer than the file).
    pub fn set_progress(&mut self, bytes: u64) {
        self.bytes_transferred = bytes.min(self.file_size);
        self.progress_pct = if self.file_size == 0 {
            100.0
        } else {
            self.bytes_transferred as f32 * 100.0 / self.file_size as f32
        };
    }
}

/// Number of chunks a payload of `len` bytes occupies. Never zero: an empty
/// payload still travels as one empty chunk so the receive path is uniform.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    ((len as f64) / (chunk_size as f64)).ceil().max(1.0) as u32
}

// ── Chunk reassembly ─────────────────────────────────────────────────────────

/// Sparse reassembly buffer for an incoming transfer.
///
/// Indices outside `0..total` and duplicate writes are protocol errors.
/// Reassembly is only permitted once every index is filled.
#[derive(Debug)]
pub struct ChunkBuffer {
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
}

impl ChunkBuffer {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            chunks: vec![None; total_chunks as usize],
            received: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total()
    }

    pub fn insert(&mut self, index: u32, data: Vec<u8>) -> Result<()> {
        let total = self.total();
        if index >= total {
            bail!("chunk index {index} out of range (total {total})");
        }
        let slot = &mut self.chunks[index as usize];
        if slot.is_some() {
            bail!("duplicate chunk index {index}");
        }
        *slot = Some(data);
        self.received += 1;
        Ok(())
    }

    /// Concatenate all chunks in index order.
    pub fn assemble(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            bail!(
                "reassembly before completion: {}/{} chunks",
                self.received,
                self.chunks.len()
            );
        }
        let mut out = Vec::with_capacity(self.chunks.iter().flatten().map(Vec::len).sum());
        for chunk in self.chunks.into_iter().flatten() {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
