//! Transparent file encryption
//!
//! The key is derived from the storage password with Argon2 and a per-storage
//! salt. Each file gets a random nonce stored in a small plaintext header;
//! the payload is XORed with a ChaCha20 keystream that restarts every
//! `BLOCK_SIZE` bytes (the block index is mixed into the nonce), so any byte
//! range can be read or written without touching its neighbours.

use std::fmt;

use argon2::Argon2;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use rand::RngCore;

use crate::error::{AoError, Result};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const CHECK_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Keystream restart granularity
pub const BLOCK_SIZE: u64 = 4096;

/// Symmetric key shared by every file of one storage
#[derive(Clone)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    /// Derive a key from a password and salt (Argon2id, default params)
    pub fn derive(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(password, salt, &mut key)
            .map_err(|e| AoError::Config(format!("key derivation failed: {}", e)))?;
        Ok(CipherKey(key))
    }

    pub fn random_salt() -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    /// Keystream sample used to tell a wrong password from a right one
    pub fn check_value(&self) -> Result<[u8; CHECK_LEN]> {
        let mut check = [0u8; CHECK_LEN];
        let mut cipher = ChaCha20::new_from_slices(&self.0, &[0xff; NONCE_LEN])
            .map_err(|e| AoError::Config(format!("cipher setup failed: {}", e)))?;
        cipher.apply_keystream(&mut check);
        Ok(check)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Keystream for one file
pub(crate) struct FileCipher {
    key: CipherKey,
    nonce: [u8; NONCE_LEN],
}

impl FileCipher {
    pub(crate) fn new(key: CipherKey, nonce: [u8; NONCE_LEN]) -> Self {
        Self { key, nonce }
    }

    pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt or decrypt `buf` in place as if it sat at logical `pos`
    pub(crate) fn apply(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let block = at / BLOCK_SIZE;
            let within = at % BLOCK_SIZE;
            let take = ((BLOCK_SIZE - within) as usize).min(buf.len() - done);

            let mut cipher = ChaCha20::new_from_slices(&self.key.0, &self.block_nonce(block))
                .map_err(|e| AoError::Config(format!("cipher setup failed: {}", e)))?;
            cipher.seek(within);
            cipher.apply_keystream(&mut buf[done..done + take]);

            done += take;
        }
        Ok(())
    }

    fn block_nonce(&self, block: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.nonce;
        for (n, b) in nonce[NONCE_LEN - 8..].iter_mut().zip(block.to_le_bytes()) {
            *n ^= b;
        }
        nonce
    }
}
