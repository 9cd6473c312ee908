use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Total size in bytes of every regular file under `path`.
///
/// Entries that vanish or become unreadable mid-walk are skipped; a missing
/// root counts as zero.
pub fn directory_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                debug!("Skipping unreadable entry under {}: {}", path.display(), e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
