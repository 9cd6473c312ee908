//! Library build seams. `LibraryBuilder` is what the compiler calls; the two
//! implementations either drive a compiler toolchain directly or shell out to a
//! build script.

use super::{ArchiveMode, ArchiveType, ArtifactLayout, BuildMode};
use crate::error::BuildError;
use crate::sync::scanner::passes_platform_filter;
use crate::utils::Config;
use rayon::prelude::*;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const COMPILE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx"];

/// Result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub stderr: String,
    /// Files the step produced (object files or the archive)
    pub produced: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    pub thin: bool,
}

pub trait Toolchain: Send + Sync {
    fn compile(&self, sources: &[PathBuf], mode: BuildMode, output_dir: &Path) -> Result<ToolOutput, BuildError>;

    fn archive(&self, objects: &[PathBuf], output: &Path, options: ArchiveOptions) -> Result<ToolOutput, BuildError>;
}

pub trait LibraryBuilder: Send + Sync {
    /// Build the library for every mode, stopping at the first failure.
    fn build(&self, modes: &[BuildMode]) -> Result<(), BuildError>;
}

/// Script builder when a build script is configured, else the em++ toolchain over the synced tree.
pub fn library_builder_for(config: &Config) -> Arc<dyn LibraryBuilder> {
    let layout = ArtifactLayout::new(config.build_root.clone());
    match &config.build_script {
        Some(script) => {
            info!("Libraries will be built by {}", script.display());
            Arc::new(ScriptLibraryBuilder::new(script.clone()))
        }
        None => {
            let toolchain = EmscriptenToolchain::new(config.emcxx.clone(), config.emar.clone()).with_include_dir(config.sync_dst.clone());
            Arc::new(ToolchainLibraryBuilder::new(toolchain, config.sync_dst.clone(), layout, config.archive_mode))
        }
    }
}

fn spawn_error(program: &Path, err: io::Error) -> BuildError {
    if err.kind() == io::ErrorKind::NotFound {
        BuildError::ToolNotFound(program.to_path_buf())
    } else {
        BuildError::Io {
            path: program.to_path_buf(),
            source: err,
        }
    }
}

fn run(cmd: &mut Command, program: &Path) -> Result<Output, BuildError> {
    debug!("Running {:?}", cmd);
    cmd.output().map_err(|e| spawn_error(program, e))
}

/// Compiles library sources with a `Toolchain` and archives them per mode.
pub struct ToolchainLibraryBuilder<T: Toolchain> {
    toolchain: T,
    source_root: PathBuf,
    layout: ArtifactLayout,
    archive_mode: ArchiveMode,
}

impl<T: Toolchain> ToolchainLibraryBuilder<T> {
    pub fn new(toolchain: T, source_root: impl Into<PathBuf>, layout: ArtifactLayout, archive_mode: ArchiveMode) -> Self {
        Self {
            toolchain,
            source_root: source_root.into(),
            layout,
            archive_mode,
        }
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Compilable sources under the root, honouring the platform filter.
    pub fn collect_sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = WalkDir::new(&self.source_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(OsStr::to_str)
                    .map(|ext| COMPILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .filter(|e| {
                e.path()
                    .strip_prefix(&self.source_root)
                    .map(passes_platform_filter)
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        sources.sort();
        sources
    }

    fn build_mode(&self, mode: BuildMode, sources: &[PathBuf]) -> Result<(), BuildError> {
        let start = Instant::now();
        let obj_dir = self.layout.mode_dir(mode).join("obj");
        fs::create_dir_all(&obj_dir).map_err(|source| BuildError::Io {
            path: obj_dir.clone(),
            source,
        })?;

        let compiled = self.toolchain.compile(sources, mode, &obj_dir)?;
        if !compiled.success {
            return Err(BuildError::RebuildFailure {
                mode,
                stderr: compiled.stderr,
            });
        }

        for &archive in self.archive_mode.archive_types() {
            let output = self.layout.artifact_path(mode, archive);
            let options = ArchiveOptions {
                thin: archive == ArchiveType::Thin,
            };
            let archived = self.toolchain.archive(&compiled.produced, &output, options)?;
            if !archived.success {
                return Err(BuildError::RebuildFailure {
                    mode,
                    stderr: archived.stderr,
                });
            }
        }

        info!(
            "Built {} library from {} sources in {:.1}s",
            mode,
            sources.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

impl<T: Toolchain> LibraryBuilder for ToolchainLibraryBuilder<T> {
    fn build(&self, modes: &[BuildMode]) -> Result<(), BuildError> {
        let sources = self.collect_sources();
        if sources.is_empty() {
            return Err(BuildError::Configuration(format!(
                "no compilable sources under {}",
                self.source_root.display()
            )));
        }
        for &mode in modes {
            self.build_mode(mode, &sources)?;
        }
        Ok(())
    }
}

/// Runs an external build script once per mode: `<script> --<mode>` with `BUILD_MODE=<MODE>`.
#[derive(Debug, Clone)]
pub struct ScriptLibraryBuilder {
    script: PathBuf,
}

impl ScriptLibraryBuilder {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self { script: script.into() }
    }
}

impl LibraryBuilder for ScriptLibraryBuilder {
    fn build(&self, modes: &[BuildMode]) -> Result<(), BuildError> {
        for &mode in modes {
            info!("Building {} library with {}", mode, self.script.display());
            let mut cmd = Command::new(&self.script);
            cmd.arg(format!("--{}", mode.dir_name()))
                .env("BUILD_MODE", mode.dir_name().to_ascii_uppercase());

            let output = run(&mut cmd, &self.script)?;
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                debug!("[{}] {}", mode, line);
            }
            if !output.status.success() {
                warn!("Library build for {} exited with {}", mode, output.status);
                return Err(BuildError::RebuildFailure {
                    mode,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }
        Ok(())
    }
}

/// `em++` / `emar` driven toolchain.
#[derive(Debug, Clone)]
pub struct EmscriptenToolchain {
    compiler: PathBuf,
    archiver: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl Default for EmscriptenToolchain {
    fn default() -> Self {
        Self::new("em++", "emar")
    }
}

impl EmscriptenToolchain {
    pub fn new(compiler: impl Into<PathBuf>, archiver: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            archiver: archiver.into(),
            include_dirs: Vec::new(),
        }
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    fn mode_flags(mode: BuildMode) -> &'static [&'static str] {
        match mode {
            BuildMode::Debug => &["-g3", "-O0", "-fsanitize=address"],
            BuildMode::FastDebug => &["-g1", "-O0"],
            BuildMode::Quick => &["-O0"],
            BuildMode::Release => &["-Oz", "-DNDEBUG"],
        }
    }

    fn object_name(index: usize, source: &Path) -> String {
        let stem = source.file_stem().and_then(OsStr::to_str).unwrap_or("unit");
        format!("{:04}_{}.o", index, stem)
    }

    /// Version line of the compiler, used as an availability probe.
    pub fn check(&self) -> Result<String, BuildError> {
        let output = run(Command::new(&self.compiler).arg("--version"), &self.compiler)?;
        if !output.status.success() {
            return Err(BuildError::ToolNotFound(self.compiler.clone()));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl Toolchain for EmscriptenToolchain {
    fn compile(&self, sources: &[PathBuf], mode: BuildMode, output_dir: &Path) -> Result<ToolOutput, BuildError> {
        let results: Vec<Result<(PathBuf, Output), BuildError>> = sources
            .par_iter()
            .enumerate()
            .map(|(i, source)| {
                let object = output_dir.join(Self::object_name(i, source));
                let mut cmd = Command::new(&self.compiler);
                cmd.arg("-c")
                    .args(Self::mode_flags(mode))
                    .args(["-std=gnu++17", "-fpermissive", "-DFASTLED_STUB_IMPL"])
                    .args(self.include_dirs.iter().map(|d| format!("-I{}", d.display())))
                    .arg(source)
                    .arg("-o")
                    .arg(&object);
                run(&mut cmd, &self.compiler).map(|out| (object, out))
            })
            .collect();

        let mut output = ToolOutput {
            success: true,
            ..Default::default()
        };
        for result in results {
            let (object, out) = result?;
            if out.status.success() {
                output.produced.push(object);
            } else {
                output.success = false;
                output.stderr.push_str(&String::from_utf8_lossy(&out.stderr));
            }
        }
        Ok(output)
    }

    fn archive(&self, objects: &[PathBuf], output: &Path, options: ArchiveOptions) -> Result<ToolOutput, BuildError> {
        if output.exists() {
            fs::remove_file(output).map_err(|source| BuildError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        }
        let flags = if options.thin { "rcsT" } else { "rcs" };
        let out = run(
            Command::new(&self.archiver).arg(flags).arg(output).args(objects),
            &self.archiver,
        )?;
        Ok(ToolOutput {
            success: out.status.success(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            produced: vec![output.to_path_buf()],
        })
    }
}
