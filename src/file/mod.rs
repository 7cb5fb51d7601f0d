//! File Store Module
//!
//! One physical file with positioned I/O, advisory locking and optional
//! transparent encryption.
//!
//! ## Responsibilities
//! - Exclusive lock for writers, shared lock for read-only opens
//! - Positioned reads/writes, sync, truncate, delete
//! - Cached logical size and read/write counters
//! - Encryption wrapper keeping the raw handle reachable for backups
//!
//! ## Encrypted File Layout
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ Header (32 bytes, plaintext)                       │
//! │   Magic: "AOEF" (4) | Version (2) | Reserved (2)   │
//! │   Nonce (12) | Padding (12)                        │
//! ├────────────────────────────────────────────────────┤
//! │ Payload (ChaCha20 keystream, per 4 KiB block)      │
//! │   logical position 0 starts here                   │
//! └────────────────────────────────────────────────────┘
//! ```

mod cipher;

pub use cipher::{CipherKey, BLOCK_SIZE, CHECK_LEN, SALT_LEN};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AoError, Result};

use cipher::{FileCipher, NONCE_LEN};

const ENCRYPTED_MAGIC: &[u8; 4] = b"AOEF";
const ENCRYPTED_VERSION: u16 = 1;

/// Plaintext header in front of every encrypted file
pub const ENCRYPTED_HEADER_SIZE: u64 = 32;

/// How a file should be opened
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// Open without write access (shared lock)
    pub read_only: bool,

    /// Fail instead of downgrading to read-only when the file is not writable
    pub require_write: bool,

    /// Encrypt everything behind a plaintext header
    pub cipher: Option<CipherKey>,
}

/// Open file handle plus its cipher
struct OpenFile {
    file: File,
    cipher: Option<FileCipher>,
}

/// A single locked file
///
/// ## Concurrency:
/// - The handle sits behind a Mutex (seek + read/write must not interleave)
/// - Size and counters are atomics, readable without the lock
pub struct FileStore {
    path: PathBuf,
    read_only: bool,
    encrypted: bool,
    inner: Mutex<Option<OpenFile>>,
    size: AtomicU64,
    read_count: AtomicU64,
    read_bytes: AtomicU64,
    write_count: AtomicU64,
    write_bytes: AtomicU64,
}

impl FileStore {
    /// Open (creating when writable) and lock the file at `path`
    ///
    /// - Missing parent directory → `InvalidPath`
    /// - Lock held elsewhere → `FileLocked`
    /// - Existing file without write permission → read-only, unless
    ///   `require_write` is set
    pub fn open(path: impl AsRef<Path>, options: &FileOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(AoError::InvalidPath(parent.to_path_buf()));
            }
        }

        let mut read_only = options.read_only;
        if !read_only && path.exists() && fs::metadata(&path)?.permissions().readonly() {
            if options.require_write {
                return Err(AoError::WriteFailure {
                    file: path,
                    pos: 0,
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "file is not writable"),
                });
            }
            debug!(path = %path.display(), "file not writable, opening read-only");
            read_only = true;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)
            .map_err(|source| AoError::ReadFailure {
                file: path.clone(),
                pos: 0,
                source,
            })?;

        let locked = if read_only {
            <File as FileExt>::try_lock_shared(&file)
        } else {
            <File as FileExt>::try_lock_exclusive(&file)
        };
        if let Err(e) = locked {
            debug!(path = %path.display(), error = %e, "lock not acquired");
            return Err(AoError::FileLocked(path));
        }

        let mut open = OpenFile { file, cipher: None };
        let physical_len = open.file.metadata()?.len();

        let size = match &options.cipher {
            None => physical_len,
            Some(key) => {
                let nonce = if physical_len == 0 && !read_only {
                    let nonce = FileCipher::random_nonce();
                    write_encrypted_header(&mut open.file, &path, &nonce)?;
                    nonce
                } else {
                    read_encrypted_header(&mut open.file, &path, physical_len)?
                };
                open.cipher = Some(FileCipher::new(key.clone(), nonce));
                physical_len.saturating_sub(ENCRYPTED_HEADER_SIZE)
            }
        };

        Ok(Self {
            path,
            read_only,
            encrypted: options.cipher.is_some(),
            inner: Mutex::new(Some(open)),
            size: AtomicU64::new(size),
            read_count: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        })
    }

    /// Read exactly `len` bytes at logical position `pos`
    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock();
        let open = guard.as_mut().ok_or_else(|| self.closed())?;

        let mut buf = vec![0u8; len];
        let physical = pos + self.header_len();
        open.file
            .seek(SeekFrom::Start(physical))
            .and_then(|_| open.file.read_exact(&mut buf))
            .map_err(|source| AoError::ReadFailure {
                file: self.path.clone(),
                pos,
                source,
            })?;

        if let Some(cipher) = &open.cipher {
            cipher.apply(pos, &mut buf)?;
        }

        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(len as u64, Ordering::Relaxed);
        Ok(buf)
    }

    /// Write all of `data` at logical position `pos`
    pub fn write_fully(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut guard = self.inner.lock();
        let open = guard.as_mut().ok_or_else(|| self.closed())?;

        let encrypted;
        let bytes = match &open.cipher {
            Some(cipher) => {
                let mut buf = data.to_vec();
                cipher.apply(pos, &mut buf)?;
                encrypted = buf;
                &encrypted[..]
            }
            None => data,
        };

        let physical = pos + self.header_len();
        open.file
            .seek(SeekFrom::Start(physical))
            .and_then(|_| open.file.write_all(bytes))
            .map_err(|source| AoError::WriteFailure {
                file: self.path.clone(),
                pos,
                source,
            })?;

        self.size.fetch_max(pos + data.len() as u64, Ordering::SeqCst);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Cut the file down to `size` logical bytes; never grows the cached size
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        let guard = self.inner.lock();
        let open = guard.as_ref().ok_or_else(|| self.closed())?;

        self.write_count.fetch_add(1, Ordering::Relaxed);
        open.file
            .set_len(size + self.header_len())
            .map_err(|source| AoError::WriteFailure {
                file: self.path.clone(),
                pos: size,
                source,
            })?;
        self.size.fetch_min(size, Ordering::SeqCst);
        Ok(())
    }

    /// Flush file contents and metadata to disk
    pub fn sync(&self) -> Result<()> {
        let guard = self.inner.lock();
        let open = guard.as_ref().ok_or_else(|| self.closed())?;
        if self.read_only {
            return Ok(());
        }
        open.file.sync_all().map_err(|source| AoError::WriteFailure {
            file: self.path.clone(),
            pos: self.size(),
            source,
        })
    }

    /// Release the lock and the handle
    ///
    /// Idempotent. The handle is dropped even if unlocking fails; the
    /// failure is still returned.
    pub fn close(&self) -> Result<()> {
        let Some(open) = self.inner.lock().take() else {
            return Ok(());
        };

        let unlocked = <File as FileExt>::unlock(&open.file);
        drop(open);

        unlocked.map_err(|source| {
            warn!(path = %self.path.display(), error = %source, "unlock failed on close");
            AoError::WriteFailure {
                file: self.path.clone(),
                pos: 0,
                source,
            }
        })
    }

    /// Close and remove the file
    pub fn delete(&self) -> Result<()> {
        let closed = self.close();
        fs::remove_file(&self.path).map_err(|source| AoError::WriteFailure {
            file: self.path.clone(),
            pos: 0,
            source,
        })?;
        closed
    }

    /// Second handle to the underlying (still encrypted) file
    ///
    /// Meant for online backup or diagnostics: read from it, never write.
    pub fn backing_file(&self) -> Result<File> {
        let guard = self.inner.lock();
        let open = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(open.file.try_clone()?)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Cached logical size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn header_len(&self) -> u64 {
        if self.encrypted {
            ENCRYPTED_HEADER_SIZE
        } else {
            0
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(AoError::UnsupportedOperation(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn closed(&self) -> AoError {
        AoError::StoreClosed(self.path.display().to_string())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("encrypted", &self.encrypted)
            .field("size", &self.size())
            .finish()
    }
}

fn write_encrypted_header(file: &mut File, path: &Path, nonce: &[u8; NONCE_LEN]) -> Result<()> {
    let mut header = [0u8; ENCRYPTED_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(ENCRYPTED_MAGIC);
    header[4..6].copy_from_slice(&ENCRYPTED_VERSION.to_le_bytes());
    header[8..8 + NONCE_LEN].copy_from_slice(nonce);

    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&header))
        .map_err(|source| AoError::WriteFailure {
            file: path.to_path_buf(),
            pos: 0,
            source,
        })
}

fn read_encrypted_header(file: &mut File, path: &Path, physical_len: u64) -> Result<[u8; NONCE_LEN]> {
    if physical_len < ENCRYPTED_HEADER_SIZE {
        return Err(AoError::Corrupted(format!(
            "{} is too short for an encrypted file header",
            path.display()
        )));
    }

    let mut header = [0u8; ENCRYPTED_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut header))
        .map_err(|source| AoError::ReadFailure {
            file: path.to_path_buf(),
            pos: 0,
            source,
        })?;

    if &header[0..4] != ENCRYPTED_MAGIC {
        return Err(AoError::Corrupted(format!(
            "{} is not an encrypted file (magic {:?})",
            path.display(),
            &header[0..4]
        )));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&header[8..8 + NONCE_LEN]);
    Ok(nonce)
}
