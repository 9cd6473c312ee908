//! Entry point tying sync, classification and the guarded library rebuild together.

use crate::build::{LibraryBackup, LibraryBuilder};
use crate::context::Context;
use crate::error::{BuildError, CompilerError, SyncError};
use crate::sync::SyncResult;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const MARKER: &str = "FastLED.h";

/// Whether a sync result (plus missing artifacts) calls for a library rebuild.
///
/// Missing artifacts always win, even over an empty or asset-only result.
pub fn rebuild_required(result: &SyncResult, force_recompile: bool) -> bool {
    force_recompile || result.requires_library_rebuild()
}

pub struct Compiler {
    context: Arc<Context>,
    builder: Arc<dyn LibraryBuilder>,
    backup: Mutex<LibraryBackup>,
    // Updates are exclusive; previews may run alongside each other
    lock: RwLock<()>,
}

impl Compiler {
    pub fn new(context: Arc<Context>, builder: Arc<dyn LibraryBuilder>) -> Self {
        let backup = LibraryBackup::new(context.layout(), context.config().archive_mode);
        Self {
            context,
            builder,
            backup: Mutex::new(backup),
            lock: RwLock::new(()),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Locate the directory holding the marker header: either `src` itself or
    /// `src/fastled/src` for a checkout root. `None` means the mounted volume.
    pub fn resolve_source(&self, src: Option<&Path>) -> Result<PathBuf, CompilerError> {
        let root = src
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.context.config().volume_mapped_src.clone());
        if !root.is_dir() {
            return Err(CompilerError::SourceNotFound { path: root });
        }
        if root.join(MARKER).is_file() {
            return Ok(root);
        }
        let nested = root.join("fastled").join("src");
        if nested.join(MARKER).is_file() {
            return Ok(nested);
        }
        Err(CompilerError::MarkerMissing { marker: MARKER, path: root })
    }

    /// Dry-run sync: what a real update would change, with nothing touched.
    pub fn preview(&self, src: Option<&Path>, sync_examples: bool) -> Result<SyncResult, CompilerError> {
        let source = self.resolve_source(src)?;
        let _guard = self.lock.read();
        Ok(self.sync_pass(&source, sync_examples, true)?)
    }

    fn sync_pass(&self, source: &Path, sync_examples: bool, dry_run: bool) -> Result<SyncResult, SyncError> {
        let sync = self.context.directory_sync()?;
        let dst = &self.context.config().sync_dst;
        if sync_examples {
            sync.sync_with_examples(source, dst, dry_run)
        } else {
            sync.sync(source, dst, dry_run)
        }
    }

    /// Sync `src` into the library tree and rebuild the library when needed.
    /// With `sync_examples` the examples tree next to `src` is mirrored too;
    /// example changes alone never trigger a rebuild.
    ///
    /// A failed rebuild leaves the previous artifacts in place and returns the
    /// tool's stderr inside `BuildError::RebuildFailure`.
    pub fn update_src(&self, src: Option<&Path>, sync_examples: bool) -> Result<SyncResult, CompilerError> {
        let source = self.resolve_source(src)?;
        let _guard = self.lock.write();
        let config = self.context.config();

        let result = self.sync_pass(&source, sync_examples, false)?;

        let missing = self
            .context
            .layout()
            .missing_artifacts(&config.build_modes, config.archive_mode);
        let force_recompile = !missing.is_empty();
        if force_recompile {
            info!("{} library artifacts missing, forcing rebuild: {:?}", missing.len(), missing);
        }

        if !rebuild_required(&result, force_recompile) {
            if result.asset_only_files.is_empty() {
                info!("No library-affecting changes, skipping rebuild");
            } else {
                info!(
                    "Only {} asset files changed, skipping library rebuild",
                    result.asset_only_files.len()
                );
            }
            return Ok(result);
        }

        let reason = if force_recompile {
            "missing artifacts".to_string()
        } else {
            format!("{} library-affecting changes", result.library_affecting_files.len())
        };
        self.rebuild(&reason)?;
        Ok(result)
    }

    fn rebuild(&self, reason: &str) -> Result<(), BuildError> {
        let modes = &self.context.config().build_modes;
        let mut backup = self.backup.lock();
        backup.backup_and_delete(modes, reason)?;

        info!("Rebuilding libraries for {:?} ({})", modes, reason);
        let start = Instant::now();
        match self.builder.build(modes) {
            Ok(()) => {
                backup.clear();
                info!("Library rebuild finished in {:.1}s", start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                error!("Library rebuild failed, restoring previous libraries: {}", e);
                if let Err(restore_err) = backup.restore() {
                    warn!("Could not restore every library backup: {}", restore_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{ArchiveMode, ArchiveType, ArtifactLayout, BuildMode};
    use crate::utils::Config;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBuilder {
        layout: ArtifactLayout,
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    impl LibraryBuilder for MockBuilder {
        fn build(&self, modes: &[BuildMode]) -> Result<(), BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(stderr) = &self.fail_with {
                return Err(BuildError::RebuildFailure {
                    mode: modes[0],
                    stderr: stderr.clone(),
                });
            }
            for &mode in modes {
                for archive in ArchiveType::ALL {
                    let path = self.layout.artifact_path(mode, archive);
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(path, format!("fresh {}", mode)).unwrap();
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        builder: Arc<MockBuilder>,
        compiler: Compiler,
    }

    impl Fixture {
        fn new(fail_with: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                volume_mapped_src: dir.path().join("mount/src"),
                git_root: dir.path().join("git"),
                sync_dst: dir.path().join("git/fastled/src"),
                build_root: dir.path().join("build"),
                session_root: dir.path().join("sketch"),
                sync_workers: 2,
                archive_mode: ArchiveMode::Both,
                build_modes: vec![BuildMode::Quick],
                ..Config::default()
            };
            let context = Arc::new(Context::new(config));
            let builder = Arc::new(MockBuilder {
                layout: context.layout(),
                fail_with: fail_with.map(str::to_string),
                calls: AtomicUsize::new(0),
            });
            let compiler = Compiler::new(context, builder.clone());
            let fx = Self { dir, builder, compiler };
            fx.write_src("FastLED.h", "#pragma once\n");
            fx
        }

        fn write_src(&self, rel: &str, content: &str) {
            let path = self.dir.path().join("mount/src").join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn write_artifacts(&self, content: &str) {
            let layout = self.compiler.context().layout();
            for archive in ArchiveType::ALL {
                let path = layout.artifact_path(BuildMode::Quick, archive);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, content).unwrap();
            }
        }

        fn calls(&self) -> usize {
            self.builder.calls.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn decision_table() {
        let empty = SyncResult::default();
        let assets = SyncResult::from_changes(vec![PathBuf::from("index.html")], vec![], vec![], false);
        let library = SyncResult::from_changes(vec![PathBuf::from("fl/str.cpp")], vec![], vec![], false);

        assert!(!rebuild_required(&empty, false));
        assert!(!rebuild_required(&assets, false));
        assert!(rebuild_required(&library, false));
        assert!(rebuild_required(&empty, true));
        assert!(rebuild_required(&assets, true));
    }

    #[test]
    fn asset_only_change_skips_rebuild() {
        let fx = Fixture::new(None);
        fx.write_src("platforms/wasm/index.html", "<html>");
        fx.compiler.update_src(None, false).unwrap();
        assert_eq!(fx.calls(), 1);

        fx.write_src("platforms/wasm/index.html", "<html><body>");
        let result = fx.compiler.update_src(None, false).unwrap();
        assert_eq!(result.asset_only_files, vec![PathBuf::from("platforms/wasm/index.html")]);
        assert_eq!(fx.calls(), 1);
    }

    #[test]
    fn library_change_rebuilds_once() {
        let fx = Fixture::new(None);
        fx.write_artifacts("old");
        fx.compiler.update_src(None, false).unwrap();
        assert_eq!(fx.calls(), 1);

        fx.write_src("fl/str.cpp", "int x;\n");
        let result = fx.compiler.update_src(None, false).unwrap();
        assert_eq!(result.library_affecting_files, vec![PathBuf::from("fl/str.cpp")]);
        assert_eq!(fx.calls(), 2);
    }

    #[test]
    fn missing_artifacts_force_rebuild_on_empty_result() {
        let fx = Fixture::new(None);
        fx.compiler.update_src(None, false).unwrap();
        assert_eq!(fx.calls(), 1);

        let layout = fx.compiler.context().layout();
        fs::remove_file(layout.artifact_path(BuildMode::Quick, ArchiveType::Thin)).unwrap();

        let result = fx.compiler.update_src(None, false).unwrap();
        assert!(result.is_empty());
        assert_eq!(fx.calls(), 2);
        assert!(layout.artifact_path(BuildMode::Quick, ArchiveType::Thin).is_file());
    }

    #[test]
    fn failed_rebuild_restores_previous_libraries() {
        let fx = Fixture::new(Some("em++: error: linker command failed\n"));
        fx.write_artifacts("known good");

        let err = fx.compiler.update_src(None, false).unwrap_err();
        match err {
            CompilerError::Build(BuildError::RebuildFailure { stderr, .. }) => {
                assert_eq!(stderr, "em++: error: linker command failed\n");
            }
            other => panic!("unexpected error {:?}", other),
        }

        let layout = fx.compiler.context().layout();
        for archive in ArchiveType::ALL {
            assert_eq!(fs::read_to_string(layout.artifact_path(BuildMode::Quick, archive)).unwrap(), "known good");
        }
    }

    #[test]
    fn failed_rebuild_leaves_the_library_stale() {
        let fx = Fixture::new(Some("em++: error: out of memory\n"));
        fx.write_artifacts("built an hour ago");
        let built = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let layout = fx.compiler.context().layout();
        for archive in ArchiveType::ALL {
            fs::File::options()
                .write(true)
                .open(layout.artifact_path(BuildMode::Quick, archive))
                .unwrap()
                .set_modified(built)
                .unwrap();
        }
        fx.write_src("new.cpp", "int y;\n");

        assert!(fx.compiler.update_src(None, false).is_err());

        let timestamps = fx.compiler.context().timestamp_manager();
        assert!(timestamps.get_source_timestamp().is_some());
        for archive in ArchiveType::ALL {
            assert!(layout.artifact_path(BuildMode::Quick, archive).is_file());
            assert!(timestamps.should_rebuild_library(BuildMode::Quick, archive));
        }
    }

    #[test]
    fn example_changes_sync_without_rebuilding() {
        let fx = Fixture::new(None);
        fx.compiler.update_src(None, true).unwrap();
        assert_eq!(fx.calls(), 1);

        let sketch = fx.dir.path().join("mount/examples/Blink/Blink.ino");
        fs::create_dir_all(sketch.parent().unwrap()).unwrap();
        fs::write(&sketch, "void loop() {}\n").unwrap();

        let preview = fx.compiler.preview(None, true).unwrap();
        assert_eq!(preview.all_changed_files, vec![PathBuf::from("examples/Blink/Blink.ino")]);

        let result = fx.compiler.update_src(None, true).unwrap();
        assert_eq!(result.all_changed_files, vec![PathBuf::from("examples/Blink/Blink.ino")]);
        assert!(!result.requires_library_rebuild());
        assert_eq!(fx.calls(), 1);
        assert!(fx.dir.path().join("git/fastled/examples/Blink/Blink.ino").is_file());

        let without = fx.compiler.update_src(None, false).unwrap();
        assert!(without.is_empty());
    }

    #[test]
    fn preview_reports_without_building_or_writing() {
        let fx = Fixture::new(None);
        fx.write_src("fl/str.cpp", "int x;\n");
        let result = fx.compiler.preview(None, false).unwrap();
        assert!(result.dry_run);
        assert!(result.requires_library_rebuild());
        assert_eq!(fx.calls(), 0);
        assert!(!fx.compiler.context().config().sync_dst.exists());
    }

    #[test]
    fn source_discovery() {
        let fx = Fixture::new(None);
        let checkout = fx.dir.path().join("checkout");
        fs::create_dir_all(checkout.join("fastled/src")).unwrap();
        fs::write(checkout.join("fastled/src/FastLED.h"), "").unwrap();
        assert_eq!(fx.compiler.resolve_source(Some(&checkout)).unwrap(), checkout.join("fastled/src"));

        let missing = fx.dir.path().join("nope");
        assert!(matches!(
            fx.compiler.resolve_source(Some(&missing)),
            Err(CompilerError::SourceNotFound { .. })
        ));

        let empty = fx.dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert!(matches!(
            fx.compiler.update_src(Some(&empty), false),
            Err(CompilerError::MarkerMissing { marker: "FastLED.h", .. })
        ));
    }
}
