//! Rebuild libraries only when the gate says they are stale.
//!
//! Used from a fresh process that never saw the sync which changed the
//! sources, so the only truth available is the filesystem.

use super::{ArchiveMode, BuildMode, LibraryBuilder, TimestampManager};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum LazyBuildOutcome {
    Built,
    Skipped,
    Failed(String),
}

impl LazyBuildOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, LazyBuildOutcome::Failed(_))
    }
}

pub struct LazyLibraryBuilder {
    timestamps: TimestampManager,
    builder: Arc<dyn LibraryBuilder>,
    archive_mode: ArchiveMode,
}

impl LazyLibraryBuilder {
    pub fn new(timestamps: TimestampManager, builder: Arc<dyn LibraryBuilder>, archive_mode: ArchiveMode) -> Self {
        Self {
            timestamps,
            builder,
            archive_mode,
        }
    }

    /// True when any configured archive for `mode` is stale.
    pub fn needs_rebuild(&self, mode: BuildMode) -> bool {
        self.archive_mode
            .archive_types()
            .iter()
            .any(|&archive| self.timestamps.should_rebuild_library(mode, archive))
    }

    pub fn build_library_if_needed(&self, mode: BuildMode, force: bool) -> LazyBuildOutcome {
        if !force && !self.needs_rebuild(mode) {
            info!("{} library is up to date, skipping build", mode);
            return LazyBuildOutcome::Skipped;
        }

        info!("Building {} library{}", mode, if force { " (forced)" } else { "" });
        let start = Instant::now();
        match self.builder.build(&[mode]) {
            Ok(()) => {
                info!("{} library built in {:.1}s", mode, start.elapsed().as_secs_f64());
                LazyBuildOutcome::Built
            }
            Err(e) => {
                error!("{} library build failed: {}", mode, e);
                LazyBuildOutcome::Failed(e.to_string())
            }
        }
    }

    /// Build modes in order. Without `force` the first failure stops the run and
    /// later modes are left out of the report.
    pub fn build_all_libraries_if_needed(&self, modes: &[BuildMode], force: bool) -> BTreeMap<BuildMode, LazyBuildOutcome> {
        let mut report = BTreeMap::new();
        for &mode in modes {
            let outcome = self.build_library_if_needed(mode, force);
            let failed = outcome.is_failure();
            report.insert(mode, outcome);
            if failed && !force {
                break;
            }
        }
        report
    }
}
