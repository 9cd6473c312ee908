//! Decides whether a changed file can affect the compiled library.

use serde::Serialize;
use std::path::Path;

/// Extensions whose change requires the static library to be rebuilt.
pub const LIBRARY_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "ino"];

/// Extensions that only ever feed the web-facing shell.
pub const ASSET_EXTENSIONS: &[&str] = &["js", "mjs", "html", "css", "txt", "ini", "toml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    LibraryAffecting,
    AssetOnly,
    Ignored,
}

pub fn classify(path: &Path) -> ChangeClass {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return ChangeClass::Ignored,
    };

    if LIBRARY_EXTENSIONS.contains(&ext.as_str()) {
        ChangeClass::LibraryAffecting
    } else if ASSET_EXTENSIONS.contains(&ext.as_str()) {
        ChangeClass::AssetOnly
    } else {
        ChangeClass::Ignored
    }
}
