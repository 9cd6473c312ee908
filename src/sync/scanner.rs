use crate::error::SyncError;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Extensions eligible for sync (source, header, web, text and config files).
pub const SYNC_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "ino", "js", "mjs", "html", "css", "json", "txt",
    "ini", "toml",
];

const PLATFORMS_DIR: &str = "platforms";

/// Platform subtrees relevant to the WASM target.
pub const PLATFORM_ALLOW_LIST: &[&str] = &["shared", "wasm", "stub", "posix"];

fn has_sync_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| SYNC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// True unless the path descends into a platform subtree outside the allow-list.
///
/// Files directly inside `platforms/` are always kept.
pub fn passes_platform_filter(relative: &Path) -> bool {
    let parts: Vec<&OsStr> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    for (i, part) in parts.iter().enumerate() {
        if *part != PLATFORMS_DIR {
            continue;
        }
        // `platforms/<file>` or `platforms` as the last segment
        if i + 2 >= parts.len() {
            continue;
        }
        let next = parts[i + 1].to_str().unwrap_or_default();
        if !PLATFORM_ALLOW_LIST.contains(&next) {
            return false;
        }
    }
    true
}

pub fn is_eligible(relative: &Path) -> bool {
    has_sync_extension(relative) && passes_platform_filter(relative)
}

/// Generated web bundles inside example sketches.
const EXAMPLE_OUTPUT_DIR: &str = "fastled_js";

/// Example trees carry any file with an extension, minus generated output.
pub fn is_example_file(relative: &Path) -> bool {
    relative.extension().is_some()
        && !relative
            .components()
            .any(|c| matches!(c, Component::Normal(part) if part == EXAMPLE_OUTPUT_DIR))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Eligible regular files under `root`, relative to it. A missing root yields an empty set.
pub fn scan_tree(root: &Path) -> Result<BTreeSet<PathBuf>, SyncError> {
    scan_tree_with(root, is_eligible)
}

/// Like `scan_tree`, with `keep` deciding which relative paths are eligible.
pub fn scan_tree_with(root: &Path, keep: fn(&Path) -> bool) -> Result<BTreeSet<PathBuf>, SyncError> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    if !root.is_dir() {
        return Err(SyncError::Io {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        });
    }

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| !is_hidden(e));
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Entries can vanish while a racing process rewrites the tree
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };
        if keep(&relative) {
            files.insert(relative);
        } else {
            debug!("Filtered out {}", relative.display());
        }
    }

    Ok(files)
}
