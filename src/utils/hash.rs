//! SHA-256 digests for transfer integrity verification.
//!
//! Both sides of a transfer hash the plaintext file body; the digest travels
//! in the request and completion messages as a lowercase hex string.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Read-block size for whole-file hashing.
const READ_BLOCK: usize = 8 * 1024;

/// SHA-256 of an in-memory buffer, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a file's contents, read in fixed-size blocks, lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BLOCK];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
