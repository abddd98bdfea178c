//! Deterministic archive repacking.
//!
//! Upstream serves repository archives as `tar.gz` with a generated
//! top-level directory name and fresh timestamps, so the same commit can
//! hash differently between instances. The npm client rejects a download
//! whose shasum differs from the published one, which breaks lockfiles
//! pointing at two registry replicas. Repacking normalises the archive:
//!
//! 1. extract into a scratch directory,
//! 2. rename the single top-level entry to `<uuid>-<ref>`,
//! 3. rebuild the container (tar.gz for npm, zip for composer) with a
//!    fixed member timestamp and sorted entry order,
//! 4. hash the result with SHA-1.
//!
//! For fixed input bytes and fixed `(uuid, ref)` the output bytes are
//! identical across runs, hosts and replicas. Scratch files are removed on
//! every exit path, including abandonment, by the `TempDir` guard.

use crate::error::{AppError, AppResult};
use crate::sha1_hex;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::debug;
use walkdir::WalkDir;

/// Member timestamp applied to every entry: 2016-10-16T23:00:00Z.
/// The exact instant is arbitrary; it only has to be constant.
pub const ARCHIVE_MTIME_SECS: u64 = 1_476_658_800;

const DIR_MODE: u32 = 0o755;

/// Target container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Gzipped tar, served to the npm client.
    TarGz,
    /// Zip, served to the composer client.
    Zip,
}

impl ArchiveFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "application/gzip",
            ArchiveFormat::Zip => "application/zip",
        }
    }
}

/// Canonical bytes plus their SHA-1.
pub struct RepackedArchive {
    pub bytes: Vec<u8>,
    pub sha1: String,
}

/// Repack an upstream `tar.gz` into the canonical container for `format`.
pub fn repack(
    upstream: &[u8],
    uuid: &str,
    reference: &str,
    format: ArchiveFormat,
) -> AppResult<RepackedArchive> {
    let scratch = tempfile::tempdir()?;
    let root = scratch.path();

    extract_tar_gz(upstream, root)?;

    let top_level = single_top_level(root)?;
    let canonical_name = format!("{uuid}-{reference}");
    fs::rename(root.join(&top_level), root.join(&canonical_name))?;

    let bytes = match format {
        ArchiveFormat::TarGz => build_tar_gz(root, &canonical_name)?,
        ArchiveFormat::Zip => build_zip(root, &canonical_name)?,
    };

    debug!(
        uuid = %uuid,
        reference = %reference,
        size = bytes.len(),
        "repacked upstream archive"
    );

    Ok(RepackedArchive {
        sha1: sha1_hex(&bytes),
        bytes,
    })
}

fn malformed(err: impl std::fmt::Display) -> AppError {
    AppError::MalformedUpstreamArchive(err.to_string())
}

fn extract_tar_gz(upstream: &[u8], root: &Path) -> AppResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(upstream));
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let entry_type = entry.header().entry_type();
        let path = entry.path().map_err(malformed)?.into_owned();

        if entry_type == EntryType::XGlobalHeader || path.as_os_str() == "pax_global_header" {
            continue;
        }
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(malformed(format!(
                "unsafe entry path {}",
                path.display()
            )));
        }

        let dest = root.join(&path);
        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(DIR_MODE))?;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mode = entry.header().mode().map_err(malformed)? & 0o777;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data).map_err(malformed)?;
                fs::write(&dest, &data)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            other => {
                debug!(path = %path.display(), kind = ?other, "skipping unsupported tar entry");
            }
        }
    }
    Ok(())
}

/// The upstream wraps the tree in a single directory; anything else is a
/// broken archive.
fn single_top_level(root: &Path) -> AppResult<PathBuf> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(root)? {
        entries.push(entry?.file_name());
    }
    if entries.len() != 1 {
        return Err(malformed(format!(
            "expected a single top-level entry, found {}",
            entries.len()
        )));
    }
    Ok(PathBuf::from(entries.remove(0)))
}

/// Sorted walk of the canonical tree, root first. Sorting makes entry
/// order independent of filesystem iteration order.
fn walk_sorted(root: &Path, top: &str) -> walkdir::IntoIter {
    WalkDir::new(root.join(top)).sort_by_file_name().into_iter()
}

fn relative_name(root: &Path, path: &Path) -> AppResult<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| AppError::Io(std::io::Error::other(e)))
}

fn entry_mode(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o777
}

fn build_tar_gz(root: &Path, top: &str) -> AppResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for entry in walk_sorted(root, top) {
        let entry = entry.map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let meta = entry.metadata().map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let rel = relative_name(root, entry.path())?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(ARCHIVE_MTIME_SECS);

        if meta.is_dir() {
            // Directories always carry 0755; disk modes of implicitly
            // created parents depend on the umask.
            header.set_mode(DIR_MODE);
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            let mut name = rel.to_string_lossy().into_owned();
            name.push('/');
            builder.append_data(&mut header, Path::new(&name), std::io::empty())?;
        } else if meta.is_file() {
            let data = fs::read(entry.path())?;
            header.set_mode(entry_mode(&meta));
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, &rel, data.as_slice())?;
        }
    }

    let tar_bytes = builder.into_inner()?;

    // mtime(0) keeps the gzip header constant as well.
    let mut encoder = flate2::GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes)?;
    Ok(encoder.finish()?)
}

fn build_zip(root: &Path, top: &str) -> AppResult<Vec<u8>> {
    let stamp = zip::DateTime::from_date_and_time(2016, 10, 16, 23, 0, 0)
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));

    for entry in walk_sorted(root, top) {
        let entry = entry.map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let meta = entry.metadata().map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let rel = relative_name(root, entry.path())?;
        let name = rel.to_string_lossy().replace('\\', "/");
        let options = zip::write::SimpleFileOptions::default().last_modified_time(stamp);

        if meta.is_dir() {
            writer
                .add_directory(name, options.unix_permissions(DIR_MODE))
                .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        } else if meta.is_file() {
            writer
                .start_file(name, options.unix_permissions(entry_mode(&meta)))
                .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
            writer.write_all(&fs::read(entry.path())?)?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
    Ok(cursor.into_inner())
}
