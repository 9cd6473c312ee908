pub mod classify;
pub mod engine;
pub mod normalizer;
pub mod pool;
pub mod scanner;

pub use classify::{classify, ChangeClass};
pub use engine::{locate_examples, DirectorySync, ExamplesTree};
pub use normalizer::WriteMode;
pub use pool::{ConversionHandle, ConversionPool, TaskId};

use crate::error::FileError;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of normalizing one file into its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Destination was (or, in preview mode, would be) written
    Updated,
    /// Destination already matches
    Unchanged,
    Error(FileError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: FileError,
}

/// Change report of one sync pass. Paths are relative to the tree roots.
///
/// `library_affecting_files` and `asset_only_files` are disjoint subsets of
/// `all_changed_files`; files of neither class only appear in the latter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub all_changed_files: Vec<PathBuf>,
    pub library_affecting_files: Vec<PathBuf>,
    pub asset_only_files: Vec<PathBuf>,
    /// Destination-only files removed (or, on a dry run, that would be removed)
    pub deleted_files: Vec<PathBuf>,
    /// Files skipped because of a per-file error
    pub failed_files: Vec<FailedFile>,
    pub dry_run: bool,
}

impl SyncResult {
    /// Build a result from updated and deleted relative paths, classifying each.
    pub fn from_changes(
        mut updated: Vec<PathBuf>,
        mut deleted: Vec<PathBuf>,
        failed_files: Vec<FailedFile>,
        dry_run: bool,
    ) -> Self {
        updated.sort();
        deleted.sort();

        let mut all_changed_files: Vec<PathBuf> = updated.iter().chain(deleted.iter()).cloned().collect();
        all_changed_files.sort();
        all_changed_files.dedup();

        let mut library_affecting_files = Vec::new();
        let mut asset_only_files = Vec::new();
        for path in &all_changed_files {
            match classify(path) {
                ChangeClass::LibraryAffecting => library_affecting_files.push(path.clone()),
                ChangeClass::AssetOnly => asset_only_files.push(path.clone()),
                ChangeClass::Ignored => {}
            }
        }

        Self {
            all_changed_files,
            library_affecting_files,
            asset_only_files,
            deleted_files: deleted,
            failed_files,
            dry_run,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all_changed_files.is_empty()
    }

    pub fn requires_library_rebuild(&self) -> bool {
        !self.library_affecting_files.is_empty()
    }

    /// Fold an examples pass into this result under `prefix`.
    ///
    /// Examples are not part of the library, so their paths never join
    /// either change class.
    pub fn merge_examples(&mut self, prefix: &Path, examples: SyncResult) {
        self.all_changed_files
            .extend(examples.all_changed_files.into_iter().map(|p| prefix.join(p)));
        self.all_changed_files.sort();
        self.all_changed_files.dedup();

        self.deleted_files
            .extend(examples.deleted_files.into_iter().map(|p| prefix.join(p)));
        self.deleted_files.sort();
        self.deleted_files.dedup();

        self.failed_files.extend(examples.failed_files.into_iter().map(|f| FailedFile {
            path: prefix.join(f.path),
            error: f.error,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_buckets_are_disjoint_subsets() {
        let result = SyncResult::from_changes(
            vec![PathBuf::from("FastLED.cpp"), PathBuf::from("platforms/wasm/index.html")],
            vec![PathBuf::from("platforms/wasm/manifest.json")],
            Vec::new(),
            false,
        );

        assert_eq!(result.library_affecting_files, vec![PathBuf::from("FastLED.cpp")]);
        assert_eq!(result.asset_only_files, vec![PathBuf::from("platforms/wasm/index.html")]);
        assert_eq!(result.all_changed_files.len(), 3);
        for path in result.library_affecting_files.iter().chain(&result.asset_only_files) {
            assert!(result.all_changed_files.contains(path));
        }
        assert!(result.requires_library_rebuild());
    }

    #[test]
    fn empty_result() {
        let result = SyncResult::from_changes(Vec::new(), Vec::new(), Vec::new(), true);
        assert!(result.is_empty());
        assert!(!result.requires_library_rebuild());
        assert!(result.dry_run);
    }

    #[test]
    fn merged_examples_are_prefixed_and_unclassified() {
        let mut result = SyncResult::from_changes(vec![PathBuf::from("FastLED.h")], Vec::new(), Vec::new(), false);
        let examples = SyncResult::from_changes(
            vec![PathBuf::from("Blink/Blink.ino")],
            vec![PathBuf::from("Old/Old.ino")],
            Vec::new(),
            false,
        );
        result.merge_examples(Path::new("examples"), examples);

        assert_eq!(
            result.all_changed_files,
            vec![
                PathBuf::from("FastLED.h"),
                PathBuf::from("examples/Blink/Blink.ino"),
                PathBuf::from("examples/Old/Old.ino"),
            ]
        );
        assert_eq!(result.deleted_files, vec![PathBuf::from("examples/Old/Old.ino")]);
        assert_eq!(result.library_affecting_files, vec![PathBuf::from("FastLED.h")]);
    }
}
