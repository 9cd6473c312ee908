//! Per-file worker: normalize line endings, compare, and atomically write.

use super::FileOutcome;
use crate::error::{FileError, FileErrorKind};
use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Fraction of control bytes (other than tab/LF/CR) above which data is treated as binary.
const BINARY_CONTROL_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Apply,
    /// Decide the outcome but never touch the destination
    Preview,
}

pub fn is_binary(data: &[u8]) -> bool {
    if data.contains(&0) {
        return true;
    }
    if data.is_empty() {
        return false;
    }
    let control = data
        .iter()
        .filter(|&&b| b < 32 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    control as f64 / data.len() as f64 > BINARY_CONTROL_RATIO
}

/// Bytes to store at the destination for the given source bytes.
///
/// Decodable text has every CRLF collapsed to LF. Binary data and text that
/// fails UTF-8 decoding pass through untouched.
pub fn normalize_bytes(data: &[u8]) -> Cow<'_, [u8]> {
    if is_binary(data) || std::str::from_utf8(data).is_err() {
        return Cow::Borrowed(data);
    }
    if !data.windows(2).any(|w| w == b"\r\n") {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    Cow::Owned(out)
}

/// Sync one file. Every failure is returned as `FileOutcome::Error`, never raised.
pub fn normalize_file(src: &Path, dst: &Path, mode: WriteMode) -> FileOutcome {
    match sync_one(src, dst, mode) {
        Ok(true) => FileOutcome::Updated,
        Ok(false) => FileOutcome::Unchanged,
        Err(e) => FileOutcome::Error(e),
    }
}

fn sync_one(src: &Path, dst: &Path, mode: WriteMode) -> Result<bool, FileError> {
    let src_meta = fs::metadata(src).map_err(|e| FileError::from_io("reading source", src, &e))?;
    if !src_meta.is_file() {
        return Err(FileError {
            kind: FileErrorKind::Io,
            message: format!("source path is not a file: {}", src.display()),
        });
    }
    let src_bytes = fs::read(src).map_err(|e| FileError::from_io("reading source", src, &e))?;
    let src_mtime = src_meta
        .modified()
        .map_err(|e| FileError::from_io("reading source mtime of", src, &e))?;

    let content = normalize_bytes(&src_bytes);

    if let Some((dst_bytes, dst_mtime)) = read_destination(dst)? {
        // A newer source must still bump the destination clock, even with equal bytes
        if src_mtime <= dst_mtime && dst_bytes == content.as_ref() {
            return Ok(false);
        }
        debug!(
            "{} differs or is older than its source (source newer: {})",
            dst.display(),
            src_mtime > dst_mtime
        );
    }

    if mode == WriteMode::Preview {
        return Ok(true);
    }

    write_atomic(dst, &content, &src_meta.permissions())?;
    Ok(true)
}

/// Current destination bytes and mtime; `None` when it is absent or unreadable.
fn read_destination(dst: &Path) -> Result<Option<(Vec<u8>, SystemTime)>, FileError> {
    let read = fs::metadata(dst).and_then(|meta| {
        if !meta.is_file() {
            return Ok(None);
        }
        let mtime = meta.modified()?;
        let bytes = fs::read(dst)?;
        Ok(Some((bytes, mtime)))
    });

    match read {
        Ok(state) => Ok(state),
        Err(e) if matches!(FileErrorKind::from(e.kind()), FileErrorKind::NotFound | FileErrorKind::PermissionDenied) => {
            Ok(None)
        }
        Err(e) => Err(FileError::from_io("reading destination", dst, &e)),
    }
}

/// Write to a sibling temp file, then rename over `dst`.
fn write_atomic(dst: &Path, content: &[u8], permissions: &fs::Permissions) -> Result<(), FileError> {
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| FileError::from_io("creating directory", parent, &e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".sync-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| FileError::from_io("creating temp file in", parent, &e))?;
    tmp.write_all(content)
        .and_then(|_| tmp.as_file().sync_data())
        .map_err(|e| FileError::from_io("writing temp file for", dst, &e))?;
    tmp.as_file()
        .set_permissions(permissions.clone())
        .map_err(|e| FileError::from_io("setting permissions for", dst, &e))?;

    // On failure the temp file is removed when the returned handle drops
    tmp.persist(dst)
        .map_err(|e| FileError::from_io("renaming into", dst, &e.error))?;
    Ok(())
}
