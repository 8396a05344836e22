//! Configuration resolution: manifest discovery and CLI overrides.
//!
//! The manifest's `[tests]` section supplies policy defaults. CLI flags are
//! layered on top: `--testcmd` replaces the manifest template, while
//! `--notests` and `--permissive-tests` can only switch a policy on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::model::{self, BuildModel, MANIFEST_FILE};
use crate::policy::{BuildPolicy, CommandTemplate};

/// Policy and engine flags taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--notests`.
    pub no_tests: bool,
    /// `--permissive-tests`.
    pub permissive: bool,
    /// `--testcmd <template>`.
    pub testcmd: Option<String>,
    /// `-j <n>`.
    pub jobs: Option<usize>,
    /// `--force`: ignore the cache for link and install steps.
    pub force: bool,
}

/// Fully resolved configuration for one build invocation.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Project root (directory holding the manifest).
    pub root: PathBuf,
    /// Absolute build directory.
    pub build_dir: PathBuf,
    /// Absolute path of the persistent test log.
    pub log_path: PathBuf,
    /// Worker count; 0 selects the available parallelism.
    pub jobs: usize,
    /// Bypass up-to-date checks for link and install steps.
    pub force: bool,
    /// Test policy, fixed for the rest of the run.
    pub policy: BuildPolicy,
}

impl ResolvedConfig {
    /// Number of worker threads to spawn.
    pub fn worker_count(&self) -> usize {
        match self.jobs {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        }
    }
}

/// Find the project root by walking up from `start` to the first directory
/// containing the manifest.
pub fn find_project_root_from(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(MANIFEST_FILE).is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!(
                "could not find {MANIFEST_FILE} in {} or any parent directory",
                start.display()
            );
        }
    }
}

/// Locate the project root, either from an explicit manifest path or by
/// searching upward from the current directory.
pub fn find_project_root(manifest_path: Option<&Path>) -> Result<PathBuf> {
    match manifest_path {
        Some(path) => {
            let path = std::path::absolute(path)
                .with_context(|| format!("failed to resolve {}", path.display()))?;
            if !path.is_file() {
                bail!("manifest not found: {}", path.display());
            }
            Ok(path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")))
        }
        None => {
            let cwd = std::env::current_dir().context("failed to get current directory")?;
            find_project_root_from(&cwd)
        }
    }
}

/// Read and parse `<root>/gauntlet.toml`.
pub fn load_model(root: &Path) -> Result<BuildModel> {
    let path = root.join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    model::parse_manifest(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Combine manifest defaults with CLI overrides.
///
/// A malformed template is a configuration error reported here, before any
/// step of the build runs.
pub fn resolve(model: &BuildModel, root: &Path, overrides: &Overrides) -> Result<ResolvedConfig> {
    let build_dir = root.join(&model.build.dir);
    let log_path = match model.tests.log {
        Some(ref log) => root.join(log),
        None => build_dir.join("test.log"),
    };

    let template = overrides
        .testcmd
        .as_deref()
        .or(model.tests.testcmd.as_deref());
    let command_template = template.map(CommandTemplate::parse).transpose()?;

    let policy = BuildPolicy {
        permissive: overrides.permissive || model.tests.permissive,
        no_tests: overrides.no_tests || model.tests.notests,
        command_template,
    };

    Ok(ResolvedConfig {
        root: root.to_path_buf(),
        build_dir,
        log_path,
        jobs: overrides.jobs.unwrap_or(model.build.jobs),
        force: overrides.force,
        policy,
    })
}

/// Print the resolved configuration.
pub fn print_resolved(config: &ResolvedConfig) {
    println!("Resolved configuration:");
    println!("  root:       {}", config.root.display());
    println!("  build dir:  {}", config.build_dir.display());
    println!("  test log:   {}", config.log_path.display());
    println!("  workers:    {}", config.worker_count());
    println!("  permissive: {}", config.policy.permissive);
    println!("  notests:    {}", config.policy.no_tests);
    match config.policy.command_template {
        Some(ref t) => println!("  testcmd:    {}", t.as_str()),
        None => println!("  testcmd:    (none)"),
    }
}
