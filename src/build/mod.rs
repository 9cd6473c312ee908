pub mod backup;
pub mod lazy;
pub mod timestamps;
pub mod toolchain;

pub use backup::LibraryBackup;
pub use lazy::{LazyBuildOutcome, LazyLibraryBuilder};
pub use timestamps::TimestampManager;
pub use toolchain::{library_builder_for, EmscriptenToolchain, LibraryBuilder, ScriptLibraryBuilder, Toolchain, ToolchainLibraryBuilder};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Debug,
    FastDebug,
    Quick,
    Release,
}

impl BuildMode {
    pub const ALL: [BuildMode; 4] = [
        BuildMode::Debug,
        BuildMode::FastDebug,
        BuildMode::Quick,
        BuildMode::Release,
    ];

    /// Directory name used under the build root and inside session directories.
    pub fn dir_name(self) -> &'static str {
        match self {
            BuildMode::Debug => "debug",
            BuildMode::FastDebug => "fast_debug",
            BuildMode::Quick => "quick",
            BuildMode::Release => "release",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(BuildMode::Debug),
            "fast_debug" => Ok(BuildMode::FastDebug),
            "quick" => Ok(BuildMode::Quick),
            "release" => Ok(BuildMode::Release),
            other => Err(format!(
                "build mode must be one of debug, fast_debug, quick, release; got {}",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    Thin,
    Regular,
}

impl ArchiveType {
    pub const ALL: [ArchiveType; 2] = [ArchiveType::Thin, ArchiveType::Regular];

    pub fn file_name(self) -> &'static str {
        match self {
            ArchiveType::Thin => "libfastled-thin.a",
            ArchiveType::Regular => "libfastled.a",
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveType::Thin => f.write_str("thin"),
            ArchiveType::Regular => f.write_str("regular"),
        }
    }
}

/// Which archive flavours the build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    Thin,
    Regular,
    Both,
}

impl ArchiveMode {
    pub fn archive_types(self) -> &'static [ArchiveType] {
        match self {
            ArchiveMode::Thin => &[ArchiveType::Thin],
            ArchiveMode::Regular => &[ArchiveType::Regular],
            ArchiveMode::Both => &ArchiveType::ALL,
        }
    }
}

impl FromStr for ArchiveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thin" => Ok(ArchiveMode::Thin),
            "regular" => Ok(ArchiveMode::Regular),
            "both" => Ok(ArchiveMode::Both),
            other => Err(format!("archive mode must be thin, regular or both; got {}", other)),
        }
    }
}

/// Filesystem layout of library artifacts: `<build_root>/<mode>/libfastled[-thin].a`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    build_root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
        }
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn mode_dir(&self, mode: BuildMode) -> PathBuf {
        self.build_root.join(mode.dir_name())
    }

    pub fn artifact_path(&self, mode: BuildMode, archive: ArchiveType) -> PathBuf {
        self.mode_dir(mode).join(archive.file_name())
    }

    /// Expected artifacts that are not on disk.
    pub fn missing_artifacts(
        &self,
        modes: &[BuildMode],
        archive_mode: ArchiveMode,
    ) -> Vec<(BuildMode, ArchiveType)> {
        modes
            .iter()
            .flat_map(|&mode| archive_mode.archive_types().iter().map(move |&a| (mode, a)))
            .filter(|&(mode, archive)| !self.artifact_path(mode, archive).is_file())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_follow_layout() {
        let layout = ArtifactLayout::new("/build");
        assert_eq!(
            layout.artifact_path(BuildMode::Quick, ArchiveType::Thin),
            PathBuf::from("/build/quick/libfastled-thin.a")
        );
        assert_eq!(
            layout.artifact_path(BuildMode::FastDebug, ArchiveType::Regular),
            PathBuf::from("/build/fast_debug/libfastled.a")
        );
    }

    #[test]
    fn build_mode_parses_case_insensitively() {
        assert_eq!("RELEASE".parse::<BuildMode>(), Ok(BuildMode::Release));
        assert_eq!("fast_debug".parse::<BuildMode>(), Ok(BuildMode::FastDebug));
        assert!("turbo".parse::<BuildMode>().is_err());
    }

    #[test]
    fn missing_artifacts_respects_archive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        std::fs::create_dir_all(layout.mode_dir(BuildMode::Debug)).unwrap();
        std::fs::write(layout.artifact_path(BuildMode::Debug, ArchiveType::Thin), b"!<thin>").unwrap();

        assert!(layout
            .missing_artifacts(&[BuildMode::Debug], ArchiveMode::Thin)
            .is_empty());
        assert_eq!(
            layout.missing_artifacts(&[BuildMode::Debug], ArchiveMode::Both),
            vec![(BuildMode::Debug, ArchiveType::Regular)]
        );
        assert_eq!(
            layout.missing_artifacts(&[BuildMode::Release], ArchiveMode::Regular),
            vec![(BuildMode::Release, ArchiveType::Regular)]
        );
    }
}
