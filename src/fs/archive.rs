//! Archive engine: streaming zip creation and bounded extraction.
//!
//! Extraction re-sandboxes and re-walks every entry target against the
//! destination. A hostile archive cannot plant a symlink with one entry and
//! traverse it with the next: the symlink walk runs after each target is
//! computed, against the directory state left by the previous entries.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::http::{read_body_limited, ApiError, AppState};

use super::safepath::{safe_sub_path, validate_no_symlink, PathError};
use super::sandboxed;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("zip has too many entries")]
    TooManyEntries,

    #[error("symlinks not supported")]
    SymlinkUnsupported,

    #[error("invalid zip entry: {0}")]
    InvalidEntry(String),

    #[error("archive exceeds size limit")]
    SizeLimit,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("zip archive error")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive io error")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Validation failures are safe to expose; cap trips map to 413;
    /// everything else is internal.
    fn into_api(self, internal_message: &str) -> ApiError {
        match &self {
            ArchiveError::SymlinkUnsupported | ArchiveError::InvalidEntry(_) | ArchiveError::Path(_) => {
                ApiError::BadRequest(self.to_string())
            }
            ArchiveError::SizeLimit | ArchiveError::TooManyEntries => {
                ApiError::PayloadTooLarge(self.to_string())
            }
            ArchiveError::Zip(_) | ArchiveError::Io(_) => ApiError::Internal(internal_message.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ArchiveRequest {
    #[serde(default)]
    source: String,
    #[serde(default)]
    dest: String,
}

pub async fn zip_archive(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let cfg = state.settings.get();
    let bytes = read_body_limited(body, cfg.max_archive_request_bytes()).await?;
    let req: ArchiveRequest =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;
    if req.source.is_empty() || req.dest.is_empty() {
        return Err(ApiError::BadRequest("missing source or dest".to_string()));
    }

    let source_path = sandboxed(&cfg.fs_base_path, &req.source).inspect_err(|err| {
        warn!(action = "zip", source = %req.source, dest = %req.dest, %err, "archive request rejected");
    })?;
    let dest_path = sandboxed(&cfg.fs_base_path, &req.dest).inspect_err(|err| {
        warn!(action = "zip", source = %req.source, dest = %req.dest, %err, "archive request rejected");
    })?;

    let source_meta = tokio::fs::symlink_metadata(&source_path)
        .await
        .map_err(|_| ApiError::NotFound("source not found".to_string()))?;
    if source_meta.file_type().is_symlink() {
        return Err(ApiError::BadRequest("source is a symlink".to_string()));
    }
    if dest_path == source_path {
        return Err(ApiError::BadRequest("destination must differ from source".to_string()));
    }
    if source_meta.is_dir() && dest_path.starts_with(&source_path) {
        return Err(ApiError::BadRequest(
            "destination must be outside the source directory".to_string(),
        ));
    }

    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| ApiError::Internal("cannot create directories".to_string()))?;
    }

    tokio::task::spawn_blocking(move || zip_path(&source_path, &dest_path))
        .await
        .map_err(|err| {
            warn!(action = "zip", %err, "archive task failed");
            ApiError::Internal("cannot create zip".to_string())
        })?
        .map_err(|err| {
            warn!(action = "zip", source = %req.source, dest = %req.dest, %err, "zip failed");
            err.into_api("cannot create zip")
        })?;

    info!(action = "zip", source = %req.source, dest = %req.dest, "archive operation");
    Ok(().into_response())
}

pub async fn unzip_archive(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let cfg = state.settings.get();
    let bytes = read_body_limited(body, cfg.max_archive_request_bytes()).await?;
    let req: ArchiveRequest =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;
    if req.source.is_empty() || req.dest.is_empty() {
        return Err(ApiError::BadRequest("missing source or dest".to_string()));
    }

    let source_path = sandboxed(&cfg.fs_base_path, &req.source).inspect_err(|err| {
        warn!(action = "unzip", source = %req.source, dest = %req.dest, %err, "archive request rejected");
    })?;
    let dest_path = sandboxed(&cfg.fs_base_path, &req.dest).inspect_err(|err| {
        warn!(action = "unzip", source = %req.source, dest = %req.dest, %err, "archive request rejected");
    })?;

    let source_meta = tokio::fs::symlink_metadata(&source_path)
        .await
        .map_err(|_| ApiError::NotFound("source not found".to_string()))?;
    if source_meta.file_type().is_symlink() {
        return Err(ApiError::BadRequest("source is a symlink".to_string()));
    }
    if source_meta.is_dir() {
        return Err(ApiError::BadRequest("source is a directory".to_string()));
    }

    ensure_dir(&dest_path)
        .await
        .map_err(|_| ApiError::Internal("cannot create directories".to_string()))?;

    let max_bytes = cfg.max_unzip_bytes() as u64;
    let max_entries = cfg.max_zip_entries();
    tokio::task::spawn_blocking(move || unzip_path(&source_path, &dest_path, max_bytes, max_entries))
        .await
        .map_err(|err| {
            warn!(action = "unzip", %err, "archive task failed");
            ApiError::Internal("cannot unzip archive".to_string())
        })?
        .map_err(|err| {
            warn!(action = "unzip", source = %req.source, dest = %req.dest, %err, "unzip failed");
            err.into_api("cannot unzip archive")
        })?;

    info!(action = "unzip", source = %req.source, dest = %req.dest, "archive operation");
    Ok(().into_response())
}

async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(std::io::Error::other("destination is not a directory")),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(path).await,
        Err(err) => Err(err),
    }
}

/// Create a zip at `dest` from the file or directory at `source`.
pub fn zip_path(source: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let meta = std::fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        return Err(ArchiveError::SymlinkUnsupported);
    }

    let out = File::create(dest)?;
    let mut writer = ZipWriter::new(out);

    let base_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ArchiveError::InvalidEntry(source.display().to_string()))?;

    if meta.is_dir() {
        writer.add_directory(&base_name, dir_options())?;
        zip_dir(&mut writer, source, &base_name)?;
    } else {
        zip_file(&mut writer, source, &base_name)?;
    }

    writer.finish()?;
    Ok(())
}

fn zip_dir(writer: &mut ZipWriter<File>, dir: &Path, prefix: &str) -> Result<(), ArchiveError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            return Err(ArchiveError::SymlinkUnsupported);
        }
        let name = format!("{prefix}/{}", entry.file_name().to_string_lossy());
        if file_type.is_dir() {
            writer.add_directory(&name, dir_options())?;
            zip_dir(writer, &entry.path(), &name)?;
        } else {
            zip_file(writer, &entry.path(), &name)?;
        }
    }

    Ok(())
}

fn zip_file(writer: &mut ZipWriter<File>, path: &Path, name: &str) -> Result<(), ArchiveError> {
    writer.start_file(name, file_options())?;
    let mut file = File::open(path)?;
    std::io::copy(&mut file, writer)?;
    Ok(())
}

fn file_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .large_file(true)
}

fn dir_options() -> FileOptions {
    FileOptions::default().unix_permissions(0o755)
}

/// Extract `archive` into `dest`, bounded in entry count and total
/// uncompressed bytes.
pub fn unzip_path(archive: &Path, dest: &Path, max_bytes: u64, max_entries: usize) -> Result<(), ArchiveError> {
    let file = File::open(archive)?;
    let mut reader = ZipArchive::new(file)?;

    let mut total: u64 = 0;

    for index in 0..reader.len() {
        if index >= max_entries {
            return Err(ArchiveError::TooManyEntries);
        }

        let mut entry = reader.by_index(index)?;
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000)
        {
            return Err(ArchiveError::SymlinkUnsupported);
        }

        let Some(clean_name) = clean_entry_name(entry.name())? else {
            continue;
        };

        let target = safe_sub_path(dest, &clean_name)?;
        // The walk runs against the tree as previous entries left it, which
        // is what defeats symlink planting across entries.
        validate_no_symlink(dest, &target)?;

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if total >= max_bytes {
            return Err(ArchiveError::SizeLimit);
        }
        let remaining = max_bytes - total;
        if entry.size() > remaining {
            return Err(ArchiveError::SizeLimit);
        }

        let written = extract_entry(&mut entry, &target, remaining)?;
        total += written;
    }

    Ok(())
}

fn extract_entry(entry: &mut impl Read, target: &Path, remaining: u64) -> Result<u64, ArchiveError> {
    let mut out = open_extract_target(target)?;
    match copy_with_limit(&mut out, entry, remaining) {
        Ok(written) => Ok(written),
        Err(err) => {
            drop(out);
            let _ = std::fs::remove_file(target);
            Err(err)
        }
    }
}

#[cfg(unix)]
fn open_extract_target(target: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(target)
}

#[cfg(not(unix))]
fn open_extract_target(target: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create(true).truncate(true).open(target)
}

/// Copy at most `limit` bytes; if the source still has data after the limit
/// is reached, the archive is over the size cap.
fn copy_with_limit(dst: &mut impl Write, src: &mut impl Read, limit: u64) -> Result<u64, ArchiveError> {
    if limit == 0 {
        return Err(ArchiveError::SizeLimit);
    }

    let written = std::io::copy(&mut src.by_ref().take(limit), dst)?;
    if written == limit {
        let mut probe = [0u8; 1];
        if src.read(&mut probe)? > 0 {
            return Err(ArchiveError::SizeLimit);
        }
    }

    Ok(written)
}

/// POSIX-clean an entry name. Absolute names and names escaping upward are
/// invalid; a name cleaning to nothing means "skip this entry".
fn clean_entry_name(raw: &str) -> Result<Option<String>, ArchiveError> {
    if raw.starts_with('/') {
        return Err(ArchiveError::InvalidEntry(raw.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::InvalidEntry(raw.to_string()));
                }
            }
            normal => parts.push(normal),
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::write(root.join("top.txt"), b"top contents").unwrap();
        std::fs::write(root.join("src/a.rs"), b"fn a() {}").unwrap();
        std::fs::write(root.join("src/nested/b.rs"), vec![7u8; 3000]).unwrap();
    }

    fn make_zip(dest: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut writer = ZipWriter::new(File::create(dest).unwrap());
        for (name, data) in entries {
            match data {
                Some(data) => {
                    writer.start_file(*name, file_options()).unwrap();
                    writer.write_all(data).unwrap();
                }
                None => {
                    writer.add_directory(*name, dir_options()).unwrap();
                }
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_clean_entry_name() {
        assert_eq!(clean_entry_name("a/b.txt").unwrap(), Some("a/b.txt".to_string()));
        assert_eq!(clean_entry_name("a/./b//c").unwrap(), Some("a/b/c".to_string()));
        assert_eq!(clean_entry_name("a/x/../b").unwrap(), Some("a/b".to_string()));
        assert_eq!(clean_entry_name(".").unwrap(), None);
        assert_eq!(clean_entry_name("").unwrap(), None);
        assert!(clean_entry_name("/abs").is_err());
        assert!(clean_entry_name("..").is_err());
        assert!(clean_entry_name("../x").is_err());
        assert!(clean_entry_name("a/../../x").is_err());
    }

    #[test]
    fn test_zip_unzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        write_tree(&source);

        let archive = dir.path().join("project.zip");
        zip_path(&source, &archive).unwrap();

        let out = dir.path().join("out");
        unzip_path(&archive, &out, u64::MAX, 100).unwrap();

        assert_eq!(std::fs::read(out.join("project/top.txt")).unwrap(), b"top contents");
        assert_eq!(std::fs::read(out.join("project/src/a.rs")).unwrap(), b"fn a() {}");
        assert_eq!(std::fs::read(out.join("project/src/nested/b.rs")).unwrap(), vec![7u8; 3000]);
    }

    #[test]
    fn test_zip_single_file_uses_basename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only.txt"), b"hi").unwrap();
        let archive = dir.path().join("only.zip");
        zip_path(&dir.path().join("only.txt"), &archive).unwrap();

        let out = dir.path().join("out");
        unzip_path(&archive, &out, u64::MAX, 100).unwrap();
        assert_eq!(std::fs::read(out.join("only.txt")).unwrap(), b"hi");
    }

    #[cfg(unix)]
    #[test]
    fn test_zip_rejects_symlink_in_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        write_tree(&source);
        std::os::unix::fs::symlink(source.join("top.txt"), source.join("alias.txt")).unwrap();

        let err = zip_path(&source, &dir.path().join("p.zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::SymlinkUnsupported));
    }

    #[test]
    fn test_unzip_rejects_traversal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        make_zip(&archive, &[("a/../../etc/passwd", Some(b"root"))]);

        let out = dir.path().join("out");
        let err = unzip_path(&archive, &out, u64::MAX, 100).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidEntry(_)));
        assert!(!dir.path().join("etc/passwd").exists());
    }

    #[test]
    fn test_unzip_entry_count_cap() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("many.zip");
        make_zip(
            &archive,
            &[
                ("one.txt", Some(b"1".as_slice())),
                ("two.txt", Some(b"2".as_slice())),
                ("three.txt", Some(b"3".as_slice())),
            ],
        );

        let out = dir.path().join("out");
        let err = unzip_path(&archive, &out, u64::MAX, 2).unwrap_err();
        assert!(matches!(err, ArchiveError::TooManyEntries));
    }

    #[test]
    fn test_unzip_total_byte_cap() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("big.zip");
        make_zip(
            &archive,
            &[
                ("a.bin", Some(vec![0u8; 600].as_slice())),
                ("b.bin", Some(vec![0u8; 600].as_slice())),
            ],
        );

        let out = dir.path().join("out");
        let err = unzip_path(&archive, &out, 1000, 100).unwrap_err();
        assert!(matches!(err, ArchiveError::SizeLimit));
        // The partially-written second target must not survive.
        assert!(!out.join("b.bin").exists());
    }

    #[test]
    fn test_unzip_exact_byte_cap_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("exact.zip");
        make_zip(&archive, &[("a.bin", Some(vec![1u8; 512].as_slice()))]);

        let out = dir.path().join("out");
        unzip_path(&archive, &out, 512, 100).unwrap();
        assert_eq!(std::fs::read(out.join("a.bin")).unwrap().len(), 512);
    }

    #[cfg(unix)]
    #[test]
    fn test_unzip_rejects_symlink_planted_target() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let elsewhere = dir.path().join("elsewhere");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::create_dir_all(&elsewhere).unwrap();
        // An attacker planted out/sub -> elsewhere before extraction.
        std::os::unix::fs::symlink(&elsewhere, out.join("sub")).unwrap();

        let archive = dir.path().join("plant.zip");
        make_zip(&archive, &[("sub/escape.txt", Some(b"gotcha"))]);

        let err = unzip_path(&archive, &out, u64::MAX, 100).unwrap_err();
        assert!(matches!(err, ArchiveError::Path(PathError::ContainsSymlink)));
        assert!(!elsewhere.join("escape.txt").exists());
    }

    #[test]
    fn test_copy_with_limit_boundary() {
        let data = vec![9u8; 100];

        let mut out = Vec::new();
        assert_eq!(copy_with_limit(&mut out, &mut data.as_slice(), 100).unwrap(), 100);

        let mut out = Vec::new();
        let err = copy_with_limit(&mut out, &mut data.as_slice(), 99).unwrap_err();
        assert!(matches!(err, ArchiveError::SizeLimit));

        let mut out = Vec::new();
        let err = copy_with_limit(&mut out, &mut data.as_slice(), 0).unwrap_err();
        assert!(matches!(err, ArchiveError::SizeLimit));
    }
}
