//! Streaming authenticated encryption for backup archives.
//!
//! Provides AES-256-GCM over fixed-size chunks so archives of any size can be
//! encrypted while they are written and decrypted while they are extracted.
//!
//! Stream layout:
//!
//! ```text
//! magic (8) || kdf (1) || salt (16) || frame*
//! frame = flag (1) || len (4, BE) || nonce (12) || ciphertext+tag (len)
//! ```
//!
//! Each frame authenticates its index and its final flag as associated data,
//! so reordered, dropped or truncated frames fail to decrypt. The key is used
//! directly (`kdf = 0`) or derived from a passphrase with PBKDF2-HMAC-SHA256
//! and the per-archive salt (`kdf = 1`).

use std::fmt;
use std::io::{self, Read, Write};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

/// Marks an encrypted archive.
pub const MAGIC: &[u8; 8] = b"BKPENC01";

const KDF_RAW: u8 = 0;
const KDF_PBKDF2: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN;

/// Plaintext bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

/// PBKDF2-HMAC-SHA256 iteration count.
const PBKDF2_ROUNDS: u32 = 100_000;

/// Errors that can occur during encryption operations
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid key encoding: expected 64 hex characters")]
    InvalidKeyEncoding,

    #[error("Archive is not encrypted")]
    NotEncrypted,

    #[error("Archive is encrypted but no key is configured")]
    MissingKey,

    #[error("Archive was encrypted with a {expected} but a {actual} was supplied")]
    KeyKindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Encrypted stream is truncated")]
    Truncated,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

impl From<EncryptionError> for io::Error {
    fn from(e: EncryptionError) -> Self {
        let kind = match e {
            EncryptionError::Truncated => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Archive encryption key.
#[derive(Clone)]
pub enum EncryptionKey {
    /// 32-byte AES key used as-is.
    Raw([u8; 32]),
    /// Passphrase stretched with PBKDF2 and a per-archive salt.
    Passphrase(String),
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionKey::Raw(_) => f.write_str("EncryptionKey::Raw([REDACTED])"),
            EncryptionKey::Passphrase(_) => f.write_str("EncryptionKey::Passphrase([REDACTED])"),
        }
    }
}

impl EncryptionKey {
    /// Create a raw key. Key must be exactly 32 bytes.
    pub fn raw(key: &[u8]) -> Result<Self, EncryptionError> {
        if key.len() != 32 {
            return Err(EncryptionError::InvalidKeyLength(key.len()));
        }
        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(key);
        Ok(EncryptionKey::Raw(key_array))
    }

    /// Parse a raw key from 64 hex characters.
    pub fn from_hex(encoded: &str) -> Result<Self, EncryptionError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| EncryptionError::InvalidKeyEncoding)?;
        Self::raw(&bytes)
    }

    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        EncryptionKey::Passphrase(passphrase.into())
    }

    fn kdf(&self) -> u8 {
        match self {
            EncryptionKey::Raw(_) => KDF_RAW,
            EncryptionKey::Passphrase(_) => KDF_PBKDF2,
        }
    }

    fn derive(&self, salt: &[u8]) -> [u8; 32] {
        match self {
            EncryptionKey::Raw(key) => *key,
            EncryptionKey::Passphrase(passphrase) => {
                let mut key = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
                    passphrase.as_bytes(),
                    salt,
                    PBKDF2_ROUNDS,
                    &mut key,
                );
                key
            }
        }
    }
}

fn kdf_name(kdf: u8) -> &'static str {
    if kdf == KDF_RAW {
        "raw key"
    } else {
        "passphrase"
    }
}

fn cipher_for(key: &[u8; 32]) -> Result<Aes256Gcm, EncryptionError> {
    Aes256Gcm::new_from_slice(key).map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))
}

fn frame_aad(index: u64, flag: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = flag;
    aad
}

/// True if `prefix` starts with the encrypted-archive magic.
pub fn is_encrypted(prefix: &[u8]) -> bool {
    prefix.starts_with(MAGIC)
}

/// Writer that encrypts everything written to it. Call [`finish`] to emit the
/// final frame; dropping without finishing leaves an undecryptable stream.
///
/// [`finish`]: EncryptingWriter::finish
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    buf: Vec<u8>,
    index: u64,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, key: &EncryptionKey) -> io::Result<Self> {
        let salt: [u8; SALT_LEN] = rand::random();
        let cipher = cipher_for(&key.derive(&salt))?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(key.kdf());
        header.extend_from_slice(&salt);
        inner.write_all(&header)?;

        Ok(Self {
            inner,
            cipher,
            buf: Vec::with_capacity(CHUNK_SIZE * 2),
            index: 0,
        })
    }

    fn emit(&mut self, plaintext_len: usize, flag: u8) -> io::Result<()> {
        // Generate random 96-bit nonce
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = frame_aad(self.index, flag);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &self.buf[..plaintext_len],
                    aad: &aad,
                },
            )
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        self.inner.write_all(&[flag])?;
        self.inner
            .write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&nonce_bytes)?;
        self.inner.write_all(&ciphertext)?;

        self.buf.drain(..plaintext_len);
        self.index += 1;
        Ok(())
    }

    /// Emit the final frame and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let remaining = self.buf.len();
        self.emit(remaining, FLAG_FINAL)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // Keep at least one byte back so the final frame is never emitted early
        while self.buf.len() > CHUNK_SIZE {
            self.emit(CHUNK_SIZE, FLAG_MORE)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that decrypts a stream produced by [`EncryptingWriter`].
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(mut inner: R, key: &EncryptionKey) -> Result<Self, EncryptionError> {
        let mut header = [0u8; HEADER_LEN];
        inner
            .read_exact(&mut header)
            .map_err(|_| EncryptionError::NotEncrypted)?;
        if !is_encrypted(&header) {
            return Err(EncryptionError::NotEncrypted);
        }

        let kdf = header[MAGIC.len()];
        if kdf != key.kdf() {
            return Err(EncryptionError::KeyKindMismatch {
                expected: kdf_name(kdf),
                actual: kdf_name(key.kdf()),
            });
        }
        let salt = &header[MAGIC.len() + 1..];
        let cipher = cipher_for(&key.derive(salt))?;

        Ok(Self {
            inner,
            cipher,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        })
    }

    fn read_frame(&mut self) -> io::Result<()> {
        let mut flag = [0u8; 1];
        if self.inner.read(&mut flag)? == 0 {
            return Err(EncryptionError::Truncated.into());
        }
        let flag = flag[0];
        if flag != FLAG_MORE && flag != FLAG_FINAL {
            return Err(EncryptionError::DecryptionFailed.into());
        }

        let mut len = [0u8; 4];
        read_exact_or_truncated(&mut self.inner, &mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(EncryptionError::DecryptionFailed.into());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        read_exact_or_truncated(&mut self.inner, &mut nonce_bytes)?;
        let mut ciphertext = vec![0u8; len];
        read_exact_or_truncated(&mut self.inner, &mut ciphertext)?;

        let aad = frame_aad(self.index, flag);
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| EncryptionError::DecryptionFailed)?;
        self.pos = 0;
        self.index += 1;

        if flag == FLAG_FINAL {
            self.done = true;
            let mut trailing = [0u8; 1];
            if self.inner.read(&mut trailing)? != 0 {
                return Err(EncryptionError::DecryptionFailed.into());
            }
        }
        Ok(())
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            EncryptionError::Truncated.into()
        } else {
            e
        }
    })
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.read_frame()?;
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
