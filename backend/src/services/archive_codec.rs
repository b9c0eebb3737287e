//! Archive encoding and decoding.
//!
//! A backup is a tar of the server directory, compressed with the configured
//! method and optionally encrypted. The SHA-256 checksum is computed over the
//! final on-disk bytes while they are written. Decoding detects encryption and
//! compression from the leading bytes, so any archive this module produced can
//! be read back without knowing how it was configured.
//!
//! Everything here is blocking I/O; async callers go through the `*_async`
//! wrappers, which run on the blocking pool.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::models::CompressionMethod;
use crate::services::encryption::{
    self, DecryptingReader, EncryptingWriter, EncryptionError, EncryptionKey,
};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// Result of writing an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// Lowercase hex SHA-256 of the archive file.
    pub checksum: String,
    pub size_bytes: u64,
    /// Regular files, directories and links written.
    pub entries: usize,
}

/// One entry in an archive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Hashes and counts everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finalize(self) -> (String, u64, W) {
        (hex::encode(self.hasher.finalize()), self.written, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "archive encoding cancelled")
}

/// Write a tar of `source` (contents only, paths relative to `source`).
fn write_tar<W: Write>(source: &Path, writer: W, cancel: &CancellationToken) -> io::Result<(W, usize)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut entries = 0;
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;

        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
        entries += 1;
    }

    Ok((builder.into_inner()?, entries))
}

fn compress_tar<W: Write>(
    source: &Path,
    writer: W,
    compression: CompressionMethod,
    cancel: &CancellationToken,
) -> io::Result<(W, usize)> {
    match compression {
        CompressionMethod::None => write_tar(source, writer, cancel),
        CompressionMethod::Gzip => {
            let encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            let (encoder, entries) = write_tar(source, encoder, cancel)?;
            Ok((encoder.finish()?, entries))
        }
        CompressionMethod::Bzip2 => {
            let encoder = bzip2::write::BzEncoder::new(writer, bzip2::Compression::default());
            let (encoder, entries) = write_tar(source, encoder, cancel)?;
            Ok((encoder.finish()?, entries))
        }
        CompressionMethod::Lzma => {
            let encoder = xz2::write::XzEncoder::new(writer, 6);
            let (encoder, entries) = write_tar(source, encoder, cancel)?;
            Ok((encoder.finish()?, entries))
        }
    }
}

fn write_archive(
    source: &Path,
    dest: &Path,
    compression: CompressionMethod,
    key: Option<&EncryptionKey>,
    cancel: &CancellationToken,
) -> io::Result<EncodeOutcome> {
    let file = File::create(dest)?;
    let hashing = HashingWriter::new(BufWriter::new(file));

    let (hashing, entries) = match key {
        Some(key) => {
            let encrypting = EncryptingWriter::new(hashing, key)?;
            let (encrypting, entries) = compress_tar(source, encrypting, compression, cancel)?;
            (encrypting.finish()?, entries)
        }
        None => compress_tar(source, hashing, compression, cancel)?,
    };

    let (checksum, size_bytes, buffered) = hashing.finalize();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(EncodeOutcome {
        checksum,
        size_bytes,
        entries,
    })
}

/// Archive the contents of `source` into `dest`.
///
/// On any failure the partial file is removed. Cancellation is checked before
/// each entry and reported as `Cancelled`.
pub fn encode(
    source: &Path,
    dest: &Path,
    compression: CompressionMethod,
    key: Option<&EncryptionKey>,
    cancel: &CancellationToken,
) -> Result<EncodeOutcome> {
    if !source.is_dir() {
        return Err(AppError::EncodeFailed(format!(
            "source directory {} does not exist",
            source.display()
        )));
    }

    write_archive(source, dest, compression, key, cancel).map_err(|e| {
        if let Err(rm) = fs::remove_file(dest) {
            if rm.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %dest.display(), error = %rm, "Failed to remove partial archive");
            }
        }
        if e.kind() == io::ErrorKind::Interrupted {
            AppError::Cancelled(e.to_string())
        } else {
            AppError::EncodeFailed(format!("{}: {}", dest.display(), e))
        }
    })
}

/// Read up to `n` leading bytes without losing them.
fn peek<R: Read>(mut reader: R, n: usize) -> io::Result<(Vec<u8>, impl Read)> {
    let mut prefix = Vec::with_capacity(n);
    (&mut reader).take(n as u64).read_to_end(&mut prefix)?;
    Ok((prefix.clone(), Cursor::new(prefix).chain(reader)))
}

/// Compression method recognised from the leading bytes of a decrypted stream.
pub fn detect_compression(prefix: &[u8]) -> CompressionMethod {
    if prefix.starts_with(GZIP_MAGIC) {
        CompressionMethod::Gzip
    } else if prefix.starts_with(BZIP2_MAGIC) {
        CompressionMethod::Bzip2
    } else if prefix.starts_with(XZ_MAGIC) {
        CompressionMethod::Lzma
    } else {
        CompressionMethod::None
    }
}

/// Open an archive as a plain tar stream, decrypting and decompressing as needed.
fn open_tar_stream(archive: &Path, key: Option<&EncryptionKey>) -> Result<Box<dyn Read>> {
    let file = File::open(archive).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AppError::ArchiveNotFound(archive.display().to_string())
        } else {
            AppError::Io(e)
        }
    })?;

    let (prefix, reader) = peek(BufReader::new(file), encryption::MAGIC.len())?;
    let decrypted: Box<dyn Read> = if encryption::is_encrypted(&prefix) {
        let key = key.ok_or(EncryptionError::MissingKey)?;
        let reader = DecryptingReader::new(reader, key)?;
        Box::new(reader)
    } else {
        Box::new(reader)
    };

    let (prefix, reader) = peek(decrypted, XZ_MAGIC.len())?;
    let stream: Box<dyn Read> = match detect_compression(&prefix) {
        CompressionMethod::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        CompressionMethod::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        CompressionMethod::Lzma => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        CompressionMethod::None => Box::new(reader),
    };
    Ok(stream)
}

/// Paths must stay inside the extraction root.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Drain whatever follows the tar end marker so trailing integrity checks
/// (gzip CRC, final encrypted frame) run.
fn drain<R: Read>(mut reader: R) -> io::Result<()> {
    io::copy(&mut reader, &mut io::sink())?;
    Ok(())
}

/// List the entries of an archive without extracting it.
pub fn list_entries(archive: &Path, key: Option<&EncryptionKey>) -> Result<Vec<ArchiveEntry>> {
    let mut tar = tar::Archive::new(open_tar_stream(archive, key)?);
    let mut listing = Vec::new();

    for entry in tar.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        listing.push(ArchiveEntry {
            path: path.to_string_lossy().into_owned(),
            size: entry.header().size()?,
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    drain(tar.into_inner())?;

    Ok(listing)
}

/// Extract an archive into `dest`, which must already exist.
///
/// Entries whose path is absolute or climbs out of `dest` are rejected.
/// Returns the number of entries extracted.
pub fn decode(archive: &Path, dest: &Path, key: Option<&EncryptionKey>) -> Result<usize> {
    decode_cancellable(archive, dest, key, &CancellationToken::new())
}

/// [`decode`] that stops between entries once `cancel` fires. Entries already
/// written stay in `dest`; the caller owns its cleanup.
pub fn decode_cancellable(
    archive: &Path,
    dest: &Path,
    key: Option<&EncryptionKey>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut tar = tar::Archive::new(open_tar_stream(archive, key)?);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);

    let mut extracted = 0;
    for entry in tar.entries()? {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "extraction of {} cancelled",
                archive.display()
            )));
        }
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_contained(&path) {
            return Err(AppError::VerificationFailed(format!(
                "archive entry '{}' escapes the destination directory",
                path.display()
            )));
        }
        entry.unpack_in(dest)?;
        extracted += 1;
    }
    drain(tar.into_inner())?;

    Ok(extracted)
}

/// SHA-256 of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Internal(format!("archive task failed: {}", e))
}

/// [`encode`] on the blocking pool.
pub async fn encode_async(
    source: PathBuf,
    dest: PathBuf,
    compression: CompressionMethod,
    key: Option<EncryptionKey>,
    cancel: CancellationToken,
) -> Result<EncodeOutcome> {
    tokio::task::spawn_blocking(move || encode(&source, &dest, compression, key.as_ref(), &cancel))
        .await
        .map_err(join_error)?
}

/// [`decode`] on the blocking pool.
pub async fn decode_async(
    archive: PathBuf,
    dest: PathBuf,
    key: Option<EncryptionKey>,
    cancel: CancellationToken,
) -> Result<usize> {
    tokio::task::spawn_blocking(move || decode_cancellable(&archive, &dest, key.as_ref(), &cancel))
        .await
        .map_err(join_error)?
}

/// [`sha256_file`] on the blocking pool.
pub async fn sha256_file_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(join_error)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("world/region")).unwrap();
        fs::write(dir.join("server.properties"), "motd=hello\nmax-players=20\n").unwrap();
        fs::write(dir.join("world/level.dat"), vec![42u8; 4096]).unwrap();
        fs::write(dir.join("world/region/r.0.0.mca"), (0..50_000u32).map(|i| (i % 7) as u8).collect::<Vec<_>>()).unwrap();
        fs::create_dir_all(dir.join("empty")).unwrap();
    }

    fn assert_same_tree(a: &Path, b: &Path) {
        for entry in WalkDir::new(a).min_depth(1) {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(a).unwrap();
            let other = b.join(rel);
            if entry.file_type().is_dir() {
                assert!(other.is_dir(), "missing dir {}", rel.display());
            } else {
                assert_eq!(fs::read(entry.path()).unwrap(), fs::read(&other).unwrap(), "{}", rel.display());
            }
        }
    }

    #[test]
    fn test_roundtrip_all_methods() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let key = EncryptionKey::passphrase("world-key");

        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip,
            CompressionMethod::Bzip2,
            CompressionMethod::Lzma,
        ] {
            for key in [None, Some(&key)] {
                let out = TempDir::new().unwrap();
                let archive = out.path().join(format!("a.{}", method.extension()));
                let outcome = encode(src.path(), &archive, method, key, &CancellationToken::new()).unwrap();

                assert_eq!(outcome.size_bytes, fs::metadata(&archive).unwrap().len());
                assert_eq!(outcome.checksum, sha256_file(&archive).unwrap());
                assert_eq!(outcome.entries, 6);

                let restored = out.path().join("restored");
                fs::create_dir(&restored).unwrap();
                decode(&archive, &restored, key).unwrap();
                assert_same_tree(src.path(), &restored);
            }
        }
    }

    #[test]
    fn test_listing_contains_relative_paths() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz");
        encode(src.path(), &archive, CompressionMethod::Gzip, None, &CancellationToken::new()).unwrap();

        let listing = list_entries(&archive, None).unwrap();
        let paths: Vec<_> = listing.iter().map(|e| e.path.trim_end_matches('/').to_string()).collect();
        assert!(paths.contains(&"server.properties".to_string()));
        assert!(paths.contains(&"world/level.dat".to_string()));
        assert!(listing.iter().any(|e| e.is_dir && e.path.starts_with("empty")));
        assert!(paths.iter().all(|p| !p.starts_with('/')));
    }

    #[test]
    fn test_empty_directory_archives() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("empty.tar.gz");
        let outcome = encode(src.path(), &archive, CompressionMethod::Gzip, None, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.entries, 0);
        assert!(list_entries(&archive, None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_source_fails() {
        let out = TempDir::new().unwrap();
        let result = encode(
            &out.path().join("nope"),
            &out.path().join("a.tar"),
            CompressionMethod::None,
            None,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(AppError::EncodeFailed(_))));
    }

    #[test]
    fn test_cancelled_encode_removes_partial_file() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = encode(src.path(), &archive, CompressionMethod::Gzip, None, &cancel);
        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert!(!archive.exists());
    }

    #[test]
    fn test_encrypted_archive_requires_key() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz.enc");
        let key = EncryptionKey::passphrase("k");
        encode(src.path(), &archive, CompressionMethod::Gzip, Some(&key), &CancellationToken::new()).unwrap();

        assert!(list_entries(&archive, None).is_err());
        assert!(list_entries(&archive, Some(&EncryptionKey::passphrase("wrong"))).is_err());
        assert!(!list_entries(&archive, Some(&key)).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_decode_stops_before_extracting() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz");
        encode(src.path(), &archive, CompressionMethod::Gzip, None, &CancellationToken::new()).unwrap();

        let dest = out.path().join("restored");
        fs::create_dir(&dest).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = decode_cancellable(&archive, &dest, None, &cancel);
        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_truncated_encrypted_archive_fails_to_decode() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.enc");
        let key = EncryptionKey::raw(&[5u8; 32]).unwrap();
        encode(src.path(), &archive, CompressionMethod::None, Some(&key), &CancellationToken::new()).unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() - 40]).unwrap();

        let dest = out.path().join("restored");
        fs::create_dir(&dest).unwrap();
        assert!(decode(&archive, &dest, Some(&key)).is_err());
    }

    #[test]
    fn test_path_traversal_entry_rejected() {
        let out = TempDir::new().unwrap();
        let archive = out.path().join("evil.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            let name = b"../evil.txt";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.finish().unwrap();
        }

        let dest = out.path().join("dest");
        fs::create_dir(&dest).unwrap();
        assert!(decode(&archive, &dest, None).is_err());
        assert!(!out.path().join("evil.txt").exists());
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(detect_compression(&[0x1f, 0x8b, 8, 0]), CompressionMethod::Gzip);
        assert_eq!(detect_compression(b"BZh91AY"), CompressionMethod::Bzip2);
        assert_eq!(detect_compression(XZ_MAGIC), CompressionMethod::Lzma);
        assert_eq!(detect_compression(b"ustar"), CompressionMethod::None);
    }

    #[test]
    fn test_missing_archive_is_not_found() {
        let out = TempDir::new().unwrap();
        let result = list_entries(&out.path().join("gone.tar.gz"), None);
        assert!(matches!(result, Err(AppError::ArchiveNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_stored_as_links() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        std::os::unix::fs::symlink("server.properties", src.path().join("link.properties")).unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar");
        encode(src.path(), &archive, CompressionMethod::None, None, &CancellationToken::new()).unwrap();

        let dest = out.path().join("restored");
        fs::create_dir(&dest).unwrap();
        decode(&archive, &dest, None).unwrap();
        let meta = fs::symlink_metadata(dest.join("link.properties")).unwrap();
        assert!(meta.file_type().is_symlink());
    }
}
