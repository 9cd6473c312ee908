//! Safety net around a library rebuild: move the current artifacts aside,
//! put them back if the rebuild fails, drop them once it succeeds.

use super::{ArchiveMode, ArchiveType, ArtifactLayout, BuildMode};
use crate::error::BuildError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub build_mode: BuildMode,
    pub archive_type: ArchiveType,
    pub backup_path: PathBuf,
    pub original_path: PathBuf,
    /// mtime of the artifact when it was backed up; the rebuild gate reads it as the build time
    pub modified: Option<SystemTime>,
}

/// One backup-then-rebuild episode. Holding the temp dir keeps the copies alive.
struct Episode {
    dir: TempDir,
    records: Vec<BackupRecord>,
}

pub struct LibraryBackup {
    layout: ArtifactLayout,
    archive_mode: ArchiveMode,
    episode: Option<Episode>,
}

impl LibraryBackup {
    pub fn new(layout: ArtifactLayout, archive_mode: ArchiveMode) -> Self {
        Self {
            layout,
            archive_mode,
            episode: None,
        }
    }

    pub fn records(&self) -> &[BackupRecord] {
        self.episode.as_ref().map(|e| e.records.as_slice()).unwrap_or(&[])
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.episode.as_ref().map(|e| e.dir.path())
    }

    /// Copy every existing artifact for `modes` to a fresh temp dir, then delete the originals.
    ///
    /// Missing artifacts are skipped. A leftover episode is discarded first.
    pub fn backup_and_delete(&mut self, modes: &[BuildMode], reason: &str) -> Result<usize, BuildError> {
        self.clear();

        let dir = tempfile::Builder::new()
            .prefix("libfastled-backup-")
            .tempdir()
            .map_err(|source| BuildError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        info!("Backing up libraries before rebuild ({}) into {}", reason, dir.path().display());

        let mut episode = Episode {
            dir,
            records: Vec::new(),
        };

        for &mode in modes {
            for &archive in self.archive_mode.archive_types() {
                let original = self.layout.artifact_path(mode, archive);
                if !original.is_file() {
                    debug!("No {} {} library to back up at {}", mode, archive, original.display());
                    continue;
                }

                let modified = fs::metadata(&original).and_then(|m| m.modified()).ok();
                let backup = episode.dir.path().join(format!("{}-{}", mode.dir_name(), archive.file_name()));
                if let Err(source) = fs::copy(&original, &backup) {
                    // Put back what was already moved before bailing
                    self.episode = Some(episode);
                    self.restore()?;
                    return Err(BuildError::Io { path: original, source });
                }
                if let Err(source) = fs::remove_file(&original) {
                    warn!("Backed up but could not delete {}: {}", original.display(), source);
                }

                debug!("Backed up {} -> {}", original.display(), backup.display());
                episode.records.push(BackupRecord {
                    build_mode: mode,
                    archive_type: archive,
                    backup_path: backup,
                    original_path: original,
                    modified,
                });
            }
        }

        let count = episode.records.len();
        info!("Backed up {} libraries", count);
        self.episode = Some(episode);
        Ok(count)
    }

    /// Copy every backed-up artifact back to its original path, then discard the episode.
    ///
    /// Restored artifacts get their pre-backup mtime back, so a library older
    /// than the synced sources still reads as stale. A no-op when nothing is backed up. Returns how many artifacts were restored.
    pub fn restore(&mut self) -> Result<usize, BuildError> {
        let Some(episode) = self.episode.take() else {
            debug!("No library backups to restore");
            return Ok(0);
        };

        let mut restored = 0;
        let mut first_error = None;
        for record in &episode.records {
            let result = record
                .original_path
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::copy(&record.backup_path, &record.original_path))
                .and_then(|_| restore_mtime(&record.original_path, record.modified));
            match result {
                Ok(_) => {
                    restored += 1;
                    info!(
                        "Restored {} {} library to {}",
                        record.build_mode,
                        record.archive_type,
                        record.original_path.display()
                    );
                }
                Err(source) => {
                    warn!("Failed to restore {}: {}", record.original_path.display(), source);
                    first_error.get_or_insert(BuildError::Io {
                        path: record.original_path.clone(),
                        source,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    /// Drop the current episode and its temp dir without restoring.
    pub fn clear(&mut self) {
        if let Some(episode) = self.episode.take() {
            debug!(
                "Discarding {} library backups in {}",
                episode.records.len(),
                episode.dir.path().display()
            );
        }
    }
}

fn restore_mtime(path: &Path, modified: Option<SystemTime>) -> std::io::Result<()> {
    match modified {
        Some(time) => fs::File::options().write(true).open(path)?.set_modified(time),
        None => Ok(()),
    }
}
