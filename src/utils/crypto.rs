//! Password-based authenticated encryption for transfer payloads.
//!
//! Layout of an encrypted payload:
//!
//! ```text
//! salt(8) || iv(12) || ciphertext(n) || tag(16)
//! ```
//!
//! Key and IV are derived with PBKDF2-HMAC-SHA256 over the password and the
//! random salt (10 000 iterations, 44 output bytes: 32-byte AES-256 key
//! followed by the 96-bit GCM IV). A fresh salt per encryption means a fresh
//! key/IV pair, so the nonce is never reused under one key.
//!
//! All functions are stateless and thread-safe.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Result};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

pub const SALT_LEN: usize = 8;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 10_000;

/// Length of a well-formed encrypted payload with empty plaintext.
pub const MIN_PAYLOAD_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;

fn derive_key_iv(password: &str, salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut okm = [0u8; KEY_LEN + IV_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut okm);

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&okm[..KEY_LEN]);
    iv.copy_from_slice(&okm[KEY_LEN..]);
    (key, iv)
}

/// Encrypt `plaintext` under a key derived from `password` and a random salt.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let (key, iv) = derive_key_iv(password, &salt);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("invalid AES key length: {e}"))?;

    // The AEAD appends the 16-byte tag to the ciphertext.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;

    let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// Fails on truncated input and on tag mismatch (wrong password or
/// corrupted data).
pub fn decrypt(payload: &[u8], password: &str) -> Result<Vec<u8>> {
    if payload.len() < MIN_PAYLOAD_LEN {
        bail!("encrypted payload too short: {} bytes", payload.len());
    }

    let (salt, rest) = payload.split_at(SALT_LEN);
    let (iv, sealed) = rest.split_at(IV_LEN);

    let (key, _) = derive_key_iv(password, salt);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("invalid AES key length: {e}"))?;

    cipher
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|_| anyhow!("decryption failed: authentication failed or corrupted data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let plaintext = b"some file body worth protecting";
        let sealed = encrypt(plaintext, "s3cret").unwrap();
        assert_eq!(sealed.len(), plaintext.len() + MIN_PAYLOAD_LEN);
        let opened = decrypt(&sealed, "s3cret").unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_password_fails_auth() {
        let sealed = encrypt(b"payload", "s3cret").unwrap();
        let err = decrypt(&sealed, "other").unwrap_err();
        assert!(err.to_string().contains("decryption failed"), "{err}");
    }

    #[test]
    fn empty_plaintext_round_trip() {
        let sealed = encrypt(b"", "pw").unwrap();
        assert_eq!(sealed.len(), MIN_PAYLOAD_LEN);
        assert_eq!(decrypt(&sealed, "pw").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn truncated_payload_rejected() {
        assert!(decrypt(&[0u8; MIN_PAYLOAD_LEN - 1], "pw").is_err());
        assert!(decrypt(&[], "pw").is_err());
    }

    #[test]
    fn corrupted_ciphertext_fails_auth() {
        let mut sealed = encrypt(b"untampered", "pw").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&sealed, "pw").is_err());
    }

    #[test]
    fn fresh_salt_per_encryption() {
        let a = encrypt(b"same input", "pw").unwrap();
        let b = encrypt(b"same input", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let (k1, iv1) = derive_key_iv("pw", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let (k2, iv2) = derive_key_iv("pw", &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);

        let (k3, _) = derive_key_iv("pw", &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_ne!(k1, k3);
    }
}
