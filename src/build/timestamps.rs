//! Filesystem-backed staleness check for library artifacts.
//!
//! The source clock is a single float (epoch seconds) in
//! `<git_root>/.timestamps/source_update.timestamp`. The library clock is the
//! mtime of the artifact itself, so a fresh process can decide staleness
//! without having seen the sync that changed the sources.

use super::{ArchiveType, ArtifactLayout, BuildMode};
use crate::error::BuildError;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const TIMESTAMP_DIR: &str = ".timestamps";
const SOURCE_TIMESTAMP_FILE: &str = "source_update.timestamp";

#[derive(Debug, Clone)]
pub struct TimestampManager {
    timestamp_dir: PathBuf,
    source_timestamp_file: PathBuf,
    layout: ArtifactLayout,
}

fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

fn readable(ts: f64) -> String {
    DateTime::from_timestamp(ts.trunc() as i64, 0)
        .map(|dt| dt.with_timezone(&Local).to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

impl TimestampManager {
    pub fn new(git_root: &Path, layout: ArtifactLayout) -> Self {
        let timestamp_dir = git_root.join(TIMESTAMP_DIR);
        Self {
            source_timestamp_file: timestamp_dir.join(SOURCE_TIMESTAMP_FILE),
            timestamp_dir,
            layout,
        }
    }

    pub fn source_timestamp_file(&self) -> &Path {
        &self.source_timestamp_file
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Record "now" as the last source update.
    pub fn update_source_timestamp(&self) -> Result<(), BuildError> {
        self.record_source_timestamp(epoch_seconds(SystemTime::now()))
    }

    pub fn record_source_timestamp(&self, ts: f64) -> Result<(), BuildError> {
        fs::create_dir_all(&self.timestamp_dir).map_err(|source| BuildError::Io {
            path: self.timestamp_dir.clone(),
            source,
        })?;
        fs::write(&self.source_timestamp_file, ts.to_string()).map_err(|source| BuildError::Io {
            path: self.source_timestamp_file.clone(),
            source,
        })?;
        info!("Source timestamp updated: {} ({})", self.source_timestamp_file.display(), readable(ts));
        Ok(())
    }

    /// `None` when the record is absent or unparseable.
    pub fn get_source_timestamp(&self) -> Option<f64> {
        let raw = fs::read_to_string(&self.source_timestamp_file).ok()?;
        match raw.trim().parse::<f64>() {
            Ok(ts) => Some(ts),
            Err(e) => {
                debug!("Ignoring unparseable source timestamp {:?}: {}", raw, e);
                None
            }
        }
    }

    /// Artifact mtime, `None` when the library has not been built.
    pub fn get_library_timestamp(&self, mode: BuildMode, archive: ArchiveType) -> Option<f64> {
        let path = self.layout.artifact_path(mode, archive);
        fs::metadata(&path).and_then(|m| m.modified()).ok().map(epoch_seconds)
    }

    pub fn should_rebuild_library(&self, mode: BuildMode, archive: ArchiveType) -> bool {
        let Some(source_time) = self.get_source_timestamp() else {
            info!("No source timestamp found, rebuild needed for {} ({})", mode, archive);
            return true;
        };

        let Some(lib_time) = self.get_library_timestamp(mode, archive) else {
            info!("No library found, rebuild needed for {} ({})", mode, archive);
            return true;
        };

        if source_time > lib_time {
            info!(
                "Source newer than library, rebuild needed for {} ({}): source {} > library {}",
                mode,
                archive,
                readable(source_time),
                readable(lib_time)
            );
            true
        } else {
            debug!("Library up to date for {} ({})", mode, archive);
            false
        }
    }
}
