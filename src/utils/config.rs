use crate::build::{ArchiveMode, BuildMode};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Gap kept between the worker lease and twice its length when deriving the GC grace window.
pub const LEASE_SAFETY_MARGIN: Duration = Duration::from_secs(1);

pub const DEFAULT_WORKER_LEASE: Duration = Duration::from_secs(20 * 60);

/// Upper bound on conversion pool workers when sized automatically.
pub const MAX_AUTO_SYNC_WORKERS: usize = 8;

/// GC grace window for a given worker lease. Always strictly more than `2 * lease`,
/// so a worker that still considers a session fresh can never lose it to GC mid-build.
pub fn grace_window_for(lease: Duration) -> Duration {
    lease * 2 + LEASE_SAFETY_MARGIN
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Externally mounted source tree (the sync source)
    pub volume_mapped_src: PathBuf,

    /// Root holding `.timestamps/source_update.timestamp`
    pub git_root: PathBuf,

    /// Sync destination for the library sources
    pub sync_dst: PathBuf,

    /// Root of `<mode>/libfastled[-thin].a` artifacts
    pub build_root: PathBuf,

    /// Root of `session-<id>` directories
    pub session_root: PathBuf,

    /// Sessions untouched for longer than this are not reused
    pub worker_lease: Duration,

    /// How often the session GC runs
    pub gc_interval: Duration,

    /// Conversion pool size (0 = auto based on CPU)
    pub sync_workers: usize,

    /// Write the source timestamp whenever a sync pass reports changes
    pub persist_source_timestamp: bool,

    /// Archive flavours the library build produces
    pub archive_mode: ArchiveMode,

    /// Build modes rebuilt after library-affecting changes
    pub build_modes: Vec<BuildMode>,

    /// External library build script, if libraries are built by script
    pub build_script: Option<PathBuf>,

    /// Compiler and archiver used when no build script is configured
    pub emcxx: PathBuf,
    pub emar: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let fastled_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(".fastled-wasm-compiler")
            .join("fastled");
        let git_root = PathBuf::from("/git");

        Self {
            port: 8888,
            volume_mapped_src: fastled_root.join("src"),
            sync_dst: git_root.join("fastled").join("src"),
            git_root,
            build_root: PathBuf::from("/build"),
            session_root: PathBuf::from("/sketch"),
            worker_lease: DEFAULT_WORKER_LEASE,
            gc_interval: Duration::from_secs(60),
            sync_workers: 0, // Auto-detect
            persist_source_timestamp: true,
            archive_mode: ArchiveMode::Both,
            build_modes: vec![BuildMode::Debug, BuildMode::Quick, BuildMode::Release],
            build_script: None,
            emcxx: PathBuf::from("em++"),
            emar: PathBuf::from("emar"),
        }
    }
}

impl Config {
    /// Load config from `.env` and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable lookup. `load` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(port) = lookup("ENV_PORT") {
            config.port = parse_value("ENV_PORT", &port)?;
        }

        if let Some(root) = lookup("ENV_FASTLED_ROOT") {
            config.volume_mapped_src = PathBuf::from(root).join("src");
        }

        if let Some(src) = lookup("ENV_VOLUME_MAPPED_SRC") {
            config.volume_mapped_src = PathBuf::from(src);
        }

        if let Some(root) = lookup("ENV_GIT_ROOT") {
            config.git_root = PathBuf::from(root);
            config.sync_dst = config.git_root.join("fastled").join("src");
        }

        if let Some(dst) = lookup("ENV_SYNC_DST") {
            config.sync_dst = PathBuf::from(dst);
        }

        if let Some(root) = lookup("ENV_BUILD_ROOT") {
            config.build_root = PathBuf::from(root);
        }

        if let Some(root) = lookup("ENV_SKETCH_BUILD_ROOT") {
            config.session_root = PathBuf::from(root);
        }

        if let Some(lease) = lookup("ENV_WORKER_LEASE_DURATION") {
            config.worker_lease = parse_duration("ENV_WORKER_LEASE_DURATION", &lease)?;
        }

        if let Some(grace) = lookup("ENV_GC_GRACE_PERIOD") {
            warn!(
                "ENV_GC_GRACE_PERIOD={} ignored; grace window is derived from the worker lease ({:?})",
                grace,
                grace_window_for(config.worker_lease)
            );
        }

        if let Some(interval) = lookup("ENV_GC_INTERVAL") {
            config.gc_interval = parse_duration("ENV_GC_INTERVAL", &interval)?;
        }

        if let Some(workers) = lookup("ENV_SYNC_WORKERS") {
            config.sync_workers = parse_value("ENV_SYNC_WORKERS", &workers)?;
        }

        if let Some(persist) = lookup("ENV_PERSIST_SOURCE_TIMESTAMP") {
            config.persist_source_timestamp = parse_value("ENV_PERSIST_SOURCE_TIMESTAMP", &persist)?;
        }

        if let Some(mode) = lookup("ENV_ARCHIVE_MODE") {
            config.archive_mode = parse_value("ENV_ARCHIVE_MODE", &mode)?;
        }

        if let Some(modes) = lookup("ENV_BUILD_MODES") {
            config.build_modes = modes
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| parse_value("ENV_BUILD_MODES", m))
                .collect::<Result<_, _>>()?;
            if config.build_modes.is_empty() {
                return Err(ConfigError::Missing { var: "ENV_BUILD_MODES" });
            }
        }

        if let Some(script) = lookup("ENV_BUILD_SCRIPT") {
            config.build_script = Some(PathBuf::from(script));
        }

        if let Some(emcxx) = lookup("ENV_EMCXX") {
            config.emcxx = PathBuf::from(emcxx);
        }

        if let Some(emar) = lookup("ENV_EMAR") {
            config.emar = PathBuf::from(emar);
        }

        // Auto-detect workers if not set
        if config.sync_workers == 0 {
            config.sync_workers = default_sync_workers();
        }

        if config.worker_lease.is_zero() {
            return Err(ConfigError::LeaseWindow {
                lease: config.worker_lease,
                grace: config.gc_grace(),
            });
        }

        Ok(config)
    }

    pub fn gc_grace(&self) -> Duration {
        grace_window_for(self.worker_lease)
    }

    pub fn timestamp_dir(&self) -> PathBuf {
        self.git_root.join(".timestamps")
    }
}

pub fn load_config() -> Result<Config, ConfigError> {
    Config::load()
}

pub fn default_sync_workers() -> usize {
    std::cmp::min(MAX_AUTO_SYNC_WORKERS, num_cpus::get() + 4)
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Accepts plain seconds ("1200") or a humantime string ("20m").
fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_keep_grace_above_twice_the_lease() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.worker_lease, Duration::from_secs(1200));
        assert!(config.gc_grace() > config.worker_lease * 2);
        assert!(config.sync_workers >= 1 && config.sync_workers <= MAX_AUTO_SYNC_WORKERS);
    }

    #[test]
    fn lease_accepts_seconds_and_humantime() {
        let config = Config::from_lookup(lookup(&[("ENV_WORKER_LEASE_DURATION", "600")])).unwrap();
        assert_eq!(config.worker_lease, Duration::from_secs(600));

        let config = Config::from_lookup(lookup(&[("ENV_WORKER_LEASE_DURATION", "5m")])).unwrap();
        assert_eq!(config.worker_lease, Duration::from_secs(300));
        assert_eq!(config.gc_grace(), Duration::from_secs(601));
    }

    #[test]
    fn grace_override_is_ignored() {
        let config = Config::from_lookup(lookup(&[("ENV_GC_GRACE_PERIOD", "60")])).unwrap();
        assert_eq!(config.gc_grace(), grace_window_for(DEFAULT_WORKER_LEASE));
    }

    #[test]
    fn zero_lease_is_a_configuration_error() {
        let err = Config::from_lookup(lookup(&[("ENV_WORKER_LEASE_DURATION", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::LeaseWindow { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("ENV_ARCHIVE_MODE", "fat")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "ENV_ARCHIVE_MODE", .. }));

        let err = Config::from_lookup(lookup(&[("ENV_BUILD_MODES", "quick,turbo")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "ENV_BUILD_MODES", .. }));
    }

    #[test]
    fn git_root_moves_sync_destination_unless_overridden() {
        let config = Config::from_lookup(lookup(&[("ENV_GIT_ROOT", "/srv/git")])).unwrap();
        assert_eq!(config.sync_dst, PathBuf::from("/srv/git/fastled/src"));
        assert_eq!(config.timestamp_dir(), PathBuf::from("/srv/git/.timestamps"));

        let config = Config::from_lookup(lookup(&[
            ("ENV_GIT_ROOT", "/srv/git"),
            ("ENV_SYNC_DST", "/mirror"),
        ]))
        .unwrap();
        assert_eq!(config.sync_dst, PathBuf::from("/mirror"));
    }
}
