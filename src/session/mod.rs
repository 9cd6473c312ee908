//! Persistent per-session build directories with time-based leases.
//!
//! A session is fresh while its directory mtime is within the worker lease.
//! GC only deletes sessions older than the grace window, which is always more
//! than twice the lease, so a worker holding a session it judged fresh never
//! loses it mid-build. There are no per-session locks; the registry mutex
//! covers only the metadata check and touch.

use crate::build::BuildMode;
use crate::error::SessionError;
use crate::utils::config::grace_window_for;
use crate::utils::disk::directory_size;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SESSION_PREFIX: &str = "session-";
const SRC_DIR: &str = "src";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub deleted: Vec<u64>,
    pub failed: Vec<u64>,
    pub kept: usize,
}

pub struct SessionDirectoryManager {
    root: PathBuf,
    worker_lease: Duration,
    grace: Duration,
    registry: Mutex<()>,
}

fn session_id_from_name(name: &str) -> Option<u64> {
    name.strip_prefix(SESSION_PREFIX)?.parse().ok()
}

fn new_session_id() -> u64 {
    crate::utils::random_u64()
}

impl SessionDirectoryManager {
    pub fn new(root: impl Into<PathBuf>, worker_lease: Duration) -> Self {
        Self {
            root: root.into(),
            worker_lease,
            grace: grace_window_for(worker_lease),
            registry: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_lease(&self) -> Duration {
        self.worker_lease
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn get_session_dir(&self, id: u64) -> PathBuf {
        self.root.join(format!("{}{}", SESSION_PREFIX, id))
    }

    pub fn get_session_src_dir(&self, id: u64) -> PathBuf {
        self.get_session_dir(id).join(SRC_DIR)
    }

    pub fn get_session_build_dir(&self, id: u64, mode: BuildMode) -> PathBuf {
        self.get_session_dir(id).join(mode.dir_name())
    }

    pub fn session_exists(&self, id: u64) -> bool {
        self.get_session_dir(id).is_dir()
    }

    pub fn get_session_size(&self, id: u64) -> u64 {
        directory_size(&self.get_session_dir(id))
    }

    /// Create `src/` and one directory per build mode. Idempotent.
    pub fn ensure_session_structure(&self, id: u64) -> Result<PathBuf, SessionError> {
        let dir = self.get_session_dir(id);
        let subdirs = std::iter::once(SRC_DIR).chain(BuildMode::ALL.iter().map(|m| m.dir_name()));
        for sub in subdirs {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|source| SessionError::Io { path, source })?;
        }
        Ok(dir)
    }

    /// Reuse `requested` when it is still within the lease, otherwise mint a new session.
    ///
    /// Returns the id and whether it was reused.
    pub fn get_or_create_session(&self, requested: Option<u64>) -> Result<(u64, bool), SessionError> {
        {
            let _guard = self.registry.lock();
            if let Some(id) = requested {
                if self.is_fresh(id) {
                    self.touch(id)?;
                    debug!("Reusing session {}", id);
                    return Ok((id, true));
                }
                debug!("Session {} is missing or past its lease, minting a new one", id);
            }
        }

        // A collision on a random 64-bit id is practically impossible, but never hand out a live directory
        let mut id = new_session_id();
        while self.session_exists(id) {
            id = new_session_id();
        }
        self.ensure_session_structure(id)?;
        {
            let _guard = self.registry.lock();
            self.touch(id)?;
        }
        info!("Created session {} at {}", id, self.get_session_dir(id).display());
        Ok((id, false))
    }

    /// Bump the session's last-touched time to now.
    pub fn touch(&self, id: u64) -> Result<(), SessionError> {
        let dir = self.get_session_dir(id);
        fs::File::open(&dir)
            .and_then(|f| f.set_modified(SystemTime::now()))
            .map_err(|source| SessionError::Io { path: dir, source })
    }

    /// Time since the session was last touched; `None` if it does not exist.
    pub fn session_age(&self, id: u64) -> Option<Duration> {
        age_of(&self.get_session_dir(id))
    }

    fn is_fresh(&self, id: u64) -> bool {
        matches!(self.session_age(id), Some(age) if age <= self.worker_lease)
    }

    /// Every session id present under the root, sorted.
    pub fn list_sessions(&self) -> Vec<u64> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list sessions under {}: {}", self.root.display(), e);
                return Vec::new();
            }
        };
        let mut ids: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().and_then(session_id_from_name))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Delete every session untouched for longer than the grace window.
    ///
    /// Failures are logged and left for the next cycle.
    pub fn garbage_collect(&self) -> GcReport {
        let mut report = GcReport::default();
        for id in self.list_sessions() {
            let dir = self.get_session_dir(id);
            let expired = {
                let _guard = self.registry.lock();
                matches!(age_of(&dir), Some(age) if age > self.grace)
            };
            if !expired {
                report.kept += 1;
                continue;
            }

            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!("GC removed expired session {}", id);
                    report.deleted.push(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.deleted.push(id),
                Err(e) => {
                    warn!("GC failed to remove session {} (will retry): {}", id, e);
                    report.failed.push(id);
                }
            }
        }
        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                "Session GC: {} deleted, {} failed, {} kept",
                report.deleted.len(),
                report.failed.len(),
                report.kept
            );
        }
        report
    }

    /// Run `garbage_collect` every `interval` until `shutdown` flips to true.
    pub async fn run_gc_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Session GC every {:?} (lease {:?}, grace {:?})",
            interval, self.worker_lease, self.grace
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || manager.garbage_collect()).await {
                        warn!("Session GC task failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Session GC loop stopped");
    }
}

fn age_of(dir: &Path) -> Option<Duration> {
    let modified = fs::metadata(dir).and_then(|m| m.modified()).ok()?;
    // A clock skewed into the future reads as brand new
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}
