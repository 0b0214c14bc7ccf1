//! Source archive codec.
//!
//! Uploads may arrive as plain tar, gzip-compressed tar or zstd-compressed
//! tar; the format is detected from magic bytes. Archives written back to
//! object storage are always tar.zst.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::error::{BuildError, BuildResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Directories never included when packing a workspace.
const SKIPPED_DIRS: &[&str] = &["target", ".git"];

/// Recognised archive encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    Tar,
    /// Gzip-compressed tar.
    TarGzip,
    /// Zstd-compressed tar.
    TarZstd,
}

impl ArchiveFormat {
    /// Detect the format of an archive from its leading bytes.
    #[must_use]
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&ZSTD_MAGIC) {
            Some(Self::TarZstd)
        } else if data.starts_with(&GZIP_MAGIC) {
            Some(Self::TarGzip)
        } else if data
            .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
            .is_some_and(|magic| magic == TAR_MAGIC)
        {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Limits applied while unpacking untrusted archives.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    /// Maximum total size of unpacked file contents.
    pub max_unpacked_bytes: u64,
    /// Maximum number of entries.
    pub max_entries: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_unpacked_bytes: 256 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

/// Summary of an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unpacked {
    /// Number of files written.
    pub files: usize,
    /// Total bytes of file content written.
    pub bytes: u64,
}

/// Unpack an archive into `dest`.
///
/// Entries with absolute paths or `..` components and link entries are
/// rejected.
pub async fn unpack(data: Bytes, dest: &Path, limits: ExtractLimits) -> BuildResult<Unpacked> {
    let dest = dest.to_owned();
    spawn_blocking(move || unpack_sync(&data, &dest, limits))
        .await
        .map_err(|e| BuildError::internal(format!("extraction task failed: {e}")))?
}

/// Pack a directory into a tar.zst archive.
pub async fn pack_directory(src: &Path, compression_level: i32) -> BuildResult<Bytes> {
    let src = src.to_owned();
    spawn_blocking(move || pack_directory_sync(&src, compression_level))
        .await
        .map_err(|e| BuildError::internal(format!("packing task failed: {e}")))?
}

fn decoder<'a>(data: &'a [u8]) -> BuildResult<Box<dyn Read + 'a>> {
    if data.is_empty() {
        return Err(BuildError::EmptyArchive);
    }

    match ArchiveFormat::detect(data) {
        Some(ArchiveFormat::Tar) => Ok(Box::new(Cursor::new(data))),
        Some(ArchiveFormat::TarGzip) => Ok(Box::new(flate2::read::GzDecoder::new(data))),
        Some(ArchiveFormat::TarZstd) => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| BuildError::extraction(format!("invalid zstd stream: {e}")))?;
            Ok(Box::new(decoder))
        }
        None => Err(BuildError::extraction("unrecognised archive format")),
    }
}

fn unpack_sync(data: &[u8], dest: &Path, limits: ExtractLimits) -> BuildResult<Unpacked> {
    std::fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(decoder(data)?);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let mut unpacked = Unpacked { files: 0, bytes: 0 };
    let mut entries_seen = 0usize;

    let entries = archive
        .entries()
        .map_err(|e| BuildError::extraction(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BuildError::extraction(e.to_string()))?;

        entries_seen += 1;
        if entries_seen > limits.max_entries {
            return Err(BuildError::extraction(format!(
                "archive has more than {} entries",
                limits.max_entries
            )));
        }

        let path: PathBuf = entry
            .path()
            .map_err(|e| BuildError::extraction(e.to_string()))?
            .into_owned();

        if !is_contained(&path) {
            return Err(BuildError::UnsafeEntry(path));
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(BuildError::UnsafeEntry(path));
        }
        if !(entry_type.is_file() || entry_type.is_dir()) {
            debug!(path = %path.display(), "skipping special archive entry");
            continue;
        }

        if entry_type.is_file() {
            let size = entry.header().size().unwrap_or(0);
            unpacked.bytes = unpacked.bytes.saturating_add(size);
            if unpacked.bytes > limits.max_unpacked_bytes {
                return Err(BuildError::ArchiveTooLarge {
                    limit: limits.max_unpacked_bytes,
                });
            }
            unpacked.files += 1;
        }

        let written = entry
            .unpack_in(dest)
            .map_err(|e| BuildError::extraction(format!("{}: {e}", path.display())))?;
        if !written {
            return Err(BuildError::UnsafeEntry(path));
        }
    }

    debug!(
        files = unpacked.files,
        bytes = unpacked.bytes,
        dest = %dest.display(),
        "archive unpacked"
    );

    Ok(unpacked)
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn pack_directory_sync(src: &Path, compression_level: i32) -> BuildResult<Bytes> {
    let mut tar_data = Vec::new();

    {
        let mut tar_builder = tar::Builder::new(&mut tar_data);
        tar_builder.follow_symlinks(false);

        for path in walk_sorted(src)? {
            let relative_path = path
                .strip_prefix(src)
                .map_err(|e| BuildError::internal(e.to_string()))?;

            if path.is_dir() {
                tar_builder.append_dir(relative_path, &path)?;
            } else if path.is_file() {
                tar_builder.append_path_with_name(&path, relative_path)?;
            }
        }

        tar_builder.finish()?;
    }

    let compressed = zstd::encode_all(Cursor::new(&tar_data), compression_level)?;

    debug!(
        uncompressed_size = tar_data.len(),
        compressed_size = compressed.len(),
        "packed workspace"
    );

    Ok(Bytes::from(compressed))
}

/// Walk a directory depth-first in name order, skipping build output.
fn walk_sorted(dir: &Path) -> BuildResult<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    let mut paths = Vec::new();
    for path in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if path.is_dir() {
            if SKIPPED_DIRS.contains(&name) {
                continue;
            }
            paths.push(path.clone());
            paths.extend(walk_sorted(&path)?);
        } else {
            paths.push(path);
        }
    }

    Ok(paths)
}
