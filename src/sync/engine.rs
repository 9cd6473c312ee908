//! Mirror an eligible-file view of one tree into another and report what changed.

use super::normalizer::WriteMode;
use super::pool::{ConversionHandle, ConversionPool, TaskId};
use super::scanner::{is_example_file, scan_tree, scan_tree_with};
use super::{FailedFile, FileOutcome, SyncResult};
use crate::build::TimestampManager;
use crate::error::{FileError, SyncError};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often a blocked await re-checks the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

const EXAMPLES_DIR: &str = "examples";
const BLINK_DIR: &str = "Blink";

pub struct DirectorySync {
    pool: Arc<ConversionPool>,
    timestamps: Option<TimestampManager>,
    interrupted: Arc<AtomicBool>,
}

impl DirectorySync {
    pub fn new(pool: Arc<ConversionPool>, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            pool,
            timestamps: None,
            interrupted,
        }
    }

    /// Persist the source timestamp whenever a real pass reports changes.
    pub fn with_source_timestamps(mut self, timestamps: TimestampManager) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    /// Run one sync pass from `src_root` into `dst_root`.
    ///
    /// On a dry run nothing on disk is touched; the result lists what a real
    /// pass would change.
    pub fn sync(&self, src_root: &Path, dst_root: &Path, dry_run: bool) -> Result<SyncResult, SyncError> {
        let result = self.run_pass(src_root, dst_root, dry_run, scan_tree)?;

        if !dry_run && !result.is_empty() {
            if let Some(timestamps) = &self.timestamps {
                if let Err(e) = timestamps.update_source_timestamp() {
                    error!("Failed to persist source timestamp: {}", e);
                }
            }
        }
        Ok(result)
    }

    /// `sync`, followed by a pass over the examples tree that belongs to
    /// `src_root`, folded into the same result.
    ///
    /// Example changes never bump the source timestamp.
    pub fn sync_with_examples(&self, src_root: &Path, dst_root: &Path, dry_run: bool) -> Result<SyncResult, SyncError> {
        let mut result = self.sync(src_root, dst_root, dry_run)?;
        match locate_examples(src_root, dst_root) {
            Some(tree) => {
                let examples = self.run_pass(&tree.src, &tree.dst, dry_run, |root| scan_tree_with(root, is_example_file))?;
                result.merge_examples(&tree.prefix, examples);
            }
            None => debug!("No examples next to {}", src_root.display()),
        }
        Ok(result)
    }

    fn run_pass(
        &self,
        src_root: &Path,
        dst_root: &Path,
        dry_run: bool,
        scan: impl Fn(&Path) -> Result<BTreeSet<PathBuf>, SyncError>,
    ) -> Result<SyncResult, SyncError> {
        let start = Instant::now();
        info!(
            "Syncing {} -> {}{}",
            src_root.display(),
            dst_root.display(),
            if dry_run { " (dry run)" } else { "" }
        );

        if !src_root.is_dir() {
            return Err(SyncError::SourceMissing(src_root.to_path_buf()));
        }
        if !dry_run && !dst_root.exists() {
            info!("Creating destination directory {}", dst_root.display());
            fs::create_dir_all(dst_root).map_err(|source| SyncError::Io {
                path: dst_root.to_path_buf(),
                source,
            })?;
        }

        let src_files = scan(src_root)?;
        let dst_files = scan(dst_root)?;
        let to_delete: Vec<PathBuf> = dst_files.difference(&src_files).cloned().collect();

        if !dry_run {
            create_parent_dirs(dst_root, &src_files);
        }

        let mode = if dry_run { WriteMode::Preview } else { WriteMode::Apply };
        let (updated, failed_files) = self.convert_all(src_root, dst_root, &src_files, mode)?;

        let deleted = if dry_run {
            to_delete
        } else {
            delete_files(dst_root, &to_delete)
        };

        let result = SyncResult::from_changes(updated, deleted, failed_files, dry_run);
        info!(
            "Sync of {} finished in {:.2}s: {} changed ({} library, {} asset, {} deleted), {} failed",
            src_root.display(),
            start.elapsed().as_secs_f64(),
            result.all_changed_files.len(),
            result.library_affecting_files.len(),
            result.asset_only_files.len(),
            result.deleted_files.len(),
            result.failed_files.len()
        );
        Ok(result)
    }

    fn convert_all(
        &self,
        src_root: &Path,
        dst_root: &Path,
        files: &BTreeSet<PathBuf>,
        mode: WriteMode,
    ) -> Result<(Vec<PathBuf>, Vec<FailedFile>), SyncError> {
        let mut handles: Vec<(PathBuf, ConversionHandle)> = Vec::with_capacity(files.len());
        for relative in files {
            match self.pool.submit(src_root.join(relative), dst_root.join(relative), mode) {
                Ok(handle) => handles.push((relative.clone(), handle)),
                Err(e) => {
                    self.cancel_handles(&handles);
                    return Err(e.into());
                }
            }
        }

        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for (i, (relative, handle)) in handles.iter().enumerate() {
            let outcome = match self.await_handle(handle) {
                Ok(outcome) => outcome,
                Err(SyncError::Interrupted) => return Err(self.abort(&handles[i..])),
                Err(e) => {
                    self.cancel_handles(&handles[i..]);
                    return Err(e);
                }
            };
            match outcome {
                FileOutcome::Updated => {
                    debug!("Updated {}", relative.display());
                    updated.push(relative.clone());
                }
                FileOutcome::Unchanged => {}
                FileOutcome::Error(error) => {
                    warn!("Failed to sync {}: {}", relative.display(), error);
                    failed.push(FailedFile {
                        path: relative.clone(),
                        error,
                    });
                }
            }
        }
        Ok((updated, failed))
    }

    /// Block for one handle while watching the interrupt flag.
    fn await_handle(&self, handle: &ConversionHandle) -> Result<FileOutcome, SyncError> {
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(SyncError::Interrupted);
            }
            match handle.wait_timeout(INTERRUPT_POLL) {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => continue,
                Err(_) if self.interrupted.load(Ordering::SeqCst) => return Err(SyncError::Interrupted),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancel only this pass's outstanding tasks; concurrent passes share the pool.
    fn cancel_handles(&self, handles: &[(PathBuf, ConversionHandle)]) -> usize {
        let ids: Vec<TaskId> = handles.iter().map(|(_, handle)| handle.id()).collect();
        self.pool.cancel(&ids)
    }

    fn abort(&self, remaining: &[(PathBuf, ConversionHandle)]) -> SyncError {
        let cancelled = self.cancel_handles(remaining);
        warn!("Sync interrupted; cancelled {} pending conversions", cancelled);
        self.pool.shutdown();
        SyncError::Interrupted
    }
}

/// An examples tree and where it mirrors to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamplesTree {
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Prepended to the tree's paths when folded into the library result
    pub prefix: PathBuf,
}

/// Find the examples belonging to a library source tree.
///
/// Checked in order: a sibling `examples/` (checkout layout), a nested
/// `examples/`, then a lone `Blink/` sketch. The destination mirrors the
/// same position relative to `dst_root`.
pub fn locate_examples(src_root: &Path, dst_root: &Path) -> Option<ExamplesTree> {
    if let (Some(src_parent), Some(dst_parent)) = (src_root.parent(), dst_root.parent()) {
        let sibling = src_parent.join(EXAMPLES_DIR);
        if sibling.is_dir() {
            return Some(ExamplesTree {
                src: sibling,
                dst: dst_parent.join(EXAMPLES_DIR),
                prefix: PathBuf::from(EXAMPLES_DIR),
            });
        }
    }
    [EXAMPLES_DIR, BLINK_DIR].into_iter().find_map(|name| {
        let nested = src_root.join(name);
        nested.is_dir().then(|| ExamplesTree {
            src: nested,
            dst: dst_root.join(name),
            prefix: PathBuf::from(name),
        })
    })
}

/// Create every missing destination directory up front so sibling writes never race on it.
fn create_parent_dirs(dst_root: &Path, files: &BTreeSet<PathBuf>) {
    let parents: BTreeSet<PathBuf> = files
        .iter()
        .filter_map(|rel| dst_root.join(rel).parent().map(Path::to_path_buf))
        .filter(|dir| !dir.is_dir())
        .collect();

    for dir in parents {
        if let Err(e) = fs::create_dir_all(&dir) {
            // The per-file write will report the failure for each affected file
            warn!("Failed to create {}: {}", dir.display(), FileError::from_io("creating", &dir, &e));
        }
    }
}

/// Delete destination-only files in parallel, returning the paths now absent.
fn delete_files(dst_root: &Path, to_delete: &[PathBuf]) -> Vec<PathBuf> {
    to_delete
        .par_iter()
        .filter_map(|relative| {
            let path = dst_root.join(relative);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    Some(relative.clone())
                }
                // Already removed by a racing process
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(relative.clone()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ArtifactLayout;
    use std::time::SystemTime;

    struct Fixture {
        dir: tempfile::TempDir,
        sync: DirectorySync,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pool = Arc::new(ConversionPool::new(4).unwrap());
            let timestamps = TimestampManager::new(&dir.path().join("git"), ArtifactLayout::new(dir.path().join("build")));
            let sync = DirectorySync::new(pool, Arc::new(AtomicBool::new(false))).with_source_timestamps(timestamps);
            Self { dir, sync }
        }

        fn src(&self) -> PathBuf {
            self.dir.path().join("src")
        }

        fn dst(&self) -> PathBuf {
            self.dir.path().join("dst")
        }

        fn write_src(&self, rel: &str, content: &[u8]) {
            let path = self.src().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn run(&self, dry_run: bool) -> SyncResult {
            self.sync.sync(&self.src(), &self.dst(), dry_run).unwrap()
        }

        fn source_timestamp(&self) -> Option<f64> {
            self.sync.timestamps.as_ref().unwrap().get_source_timestamp()
        }
    }

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn empty_source_yields_empty_result() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.src()).unwrap();
        let result = fx.run(false);
        assert!(result.is_empty());
        assert!(fx.dst().is_dir());
        assert_eq!(fx.source_timestamp(), None);
    }

    #[test]
    fn missing_source_is_an_error() {
        let fx = Fixture::new();
        let err = fx.sync.sync(&fx.src(), &fx.dst(), false).unwrap_err();
        assert!(matches!(err, SyncError::SourceMissing(_)));
    }

    #[test]
    fn second_pass_is_empty_and_trees_match() {
        let fx = Fixture::new();
        fx.write_src("FastLED.h", b"#pragma once\r\n");
        fx.write_src("fl/str.cpp", b"int a;\r\nint b;\r\n");
        fx.write_src("platforms/wasm/js/index.js", b"export {};\n");

        let first = fx.run(false);
        assert_eq!(first.all_changed_files.len(), 3);
        assert!(fx.source_timestamp().is_some());

        let second = fx.run(false);
        assert!(second.is_empty(), "{:?}", second);
        assert_eq!(fs::read(fx.dst().join("fl/str.cpp")).unwrap(), b"int a;\nint b;\n");
        assert_eq!(fs::read(fx.dst().join("platforms/wasm/js/index.js")).unwrap(), b"export {};\n");
    }

    #[test]
    fn changes_are_classified() {
        let fx = Fixture::new();
        fx.write_src("FastLED.cpp", b"a");
        fx.write_src("platforms/wasm/index.html", b"<html>");
        fx.write_src("library.json", b"{}");

        let result = fx.run(false);
        assert_eq!(result.library_affecting_files, paths(&["FastLED.cpp"]));
        assert_eq!(result.asset_only_files, paths(&["platforms/wasm/index.html"]));
        assert_eq!(
            result.all_changed_files,
            paths(&["FastLED.cpp", "library.json", "platforms/wasm/index.html"])
        );
    }

    #[test]
    fn destination_only_files_are_deleted() {
        let fx = Fixture::new();
        fx.write_src("keep.h", b"k");
        fs::create_dir_all(fx.dst().join("old")).unwrap();
        fs::write(fx.dst().join("old/stale.cpp"), b"s").unwrap();
        fs::write(fx.dst().join("libfastled.a"), b"not eligible").unwrap();

        let result = fx.run(false);
        assert!(!fx.dst().join("old/stale.cpp").exists());
        assert!(fx.dst().join("libfastled.a").exists());
        assert!(result.all_changed_files.contains(&PathBuf::from("old/stale.cpp")));
        assert_eq!(result.deleted_files, paths(&["old/stale.cpp"]));
        assert!(result.library_affecting_files.contains(&PathBuf::from("old/stale.cpp")));
    }

    #[test]
    fn dry_run_previews_without_mutation() {
        let fx = Fixture::new();
        fx.write_src("a.cpp", b"x\r\n");
        fs::create_dir_all(fx.dst()).unwrap();
        fs::write(fx.dst().join("gone.h"), b"g").unwrap();

        let preview = fx.run(true);
        assert!(preview.dry_run);
        assert_eq!(preview.all_changed_files, paths(&["a.cpp", "gone.h"]));
        assert!(!fx.dst().join("a.cpp").exists());
        assert!(fx.dst().join("gone.h").exists());
        assert_eq!(fx.source_timestamp(), None);

        let real = fx.run(false);
        assert_eq!(real.all_changed_files, preview.all_changed_files);
    }

    #[test]
    fn dry_run_against_missing_destination_does_not_create_it() {
        let fx = Fixture::new();
        fx.write_src("a.h", b"a");
        let preview = fx.run(true);
        assert_eq!(preview.all_changed_files, paths(&["a.h"]));
        assert!(!fx.dst().exists());
    }

    #[test]
    fn platform_filtering_applies_to_sync() {
        let fx = Fixture::new();
        fx.write_src("platforms/esp32/foo.h", b"e");
        fx.write_src("platforms/wasm/foo.h", b"w");
        fx.write_src("platforms/foo.h", b"p");

        let result = fx.run(false);
        assert_eq!(result.all_changed_files, paths(&["platforms/foo.h", "platforms/wasm/foo.h"]));
        assert!(!fx.dst().join("platforms/esp32").exists());
    }

    #[test]
    fn newer_source_with_identical_bytes_is_reported() {
        let fx = Fixture::new();
        fx.write_src("a.h", b"same\n");
        fx.run(false);

        let later = SystemTime::now() + Duration::from_secs(30);
        fs::File::options()
            .write(true)
            .open(fx.src().join("a.h"))
            .unwrap()
            .set_modified(later)
            .unwrap();

        let result = fx.run(false);
        assert_eq!(result.all_changed_files, paths(&["a.h"]));
    }

    #[test]
    fn one_bad_file_does_not_abort_the_pass() {
        let fx = Fixture::new();
        fx.write_src("good.cpp", b"g");
        fx.write_src("blocked.h", b"b");
        // A directory squatting on the destination path makes the rename fail
        fs::create_dir_all(fx.dst().join("blocked.h")).unwrap();

        let result = fx.run(false);
        assert_eq!(result.all_changed_files, paths(&["good.cpp"]));
        assert_eq!(result.failed_files.len(), 1);
        assert_eq!(result.failed_files[0].path, PathBuf::from("blocked.h"));
        assert_eq!(fs::read(fx.dst().join("good.cpp")).unwrap(), b"g");
    }

    #[test]
    fn interruption_discards_partial_results() {
        let fx = Fixture::new();
        fx.write_src("a.cpp", b"a");
        fx.sync.interrupted.store(true, Ordering::SeqCst);

        let err = fx.sync.sync(&fx.src(), &fx.dst(), false).unwrap_err();
        assert!(matches!(err, SyncError::Interrupted));
        assert!(fx.sync.pool.is_shut_down());
    }

    #[test]
    fn sibling_examples_fold_into_the_result() {
        let fx = Fixture::new();
        let root = fx.dir.path();
        for (rel, content) in [
            ("lib/src/FastLED.h", "#pragma once\n"),
            ("lib/examples/Blink/Blink.ino", "void setup() {}\r\n"),
            ("lib/examples/Blink/README.md", "blink"),
            ("lib/examples/Blink/fastled_js/index.js", "generated"),
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let (src, dst) = (root.join("lib/src"), root.join("out/src"));

        let result = fx.sync.sync_with_examples(&src, &dst, false).unwrap();
        assert_eq!(
            result.all_changed_files,
            paths(&["FastLED.h", "examples/Blink/Blink.ino", "examples/Blink/README.md"])
        );
        assert_eq!(result.library_affecting_files, paths(&["FastLED.h"]));
        assert_eq!(fs::read(root.join("out/examples/Blink/Blink.ino")).unwrap(), b"void setup() {}\n");
        assert!(!root.join("out/examples/Blink/fastled_js").exists());

        fs::remove_file(root.join("lib/examples/Blink/README.md")).unwrap();
        let ts_before = fx.source_timestamp();
        let again = fx.sync.sync_with_examples(&src, &dst, false).unwrap();
        assert_eq!(again.deleted_files, paths(&["examples/Blink/README.md"]));
        assert!(!again.requires_library_rebuild());
        assert_eq!(fx.source_timestamp(), ts_before);
    }

    #[test]
    fn examples_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("lib/src");
        let dst = dir.path().join("out/src");
        fs::create_dir_all(&src).unwrap();
        assert_eq!(locate_examples(&src, &dst), None);

        fs::create_dir_all(src.join("Blink")).unwrap();
        assert_eq!(locate_examples(&src, &dst).unwrap().dst, dst.join("Blink"));

        fs::create_dir_all(src.join("examples")).unwrap();
        assert_eq!(locate_examples(&src, &dst).unwrap().src, src.join("examples"));

        fs::create_dir_all(dir.path().join("lib/examples")).unwrap();
        let tree = locate_examples(&src, &dst).unwrap();
        assert_eq!(tree.src, dir.path().join("lib/examples"));
        assert_eq!(tree.dst, dir.path().join("out/examples"));
        assert_eq!(tree.prefix, PathBuf::from("examples"));
    }
}
