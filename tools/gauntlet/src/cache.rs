//! Build cache manifest for skipping unchanged link and install steps.
//!
//! Tracks the command hash, output mtime, and the mtime + SHA-256 of every
//! input file for each step. Directory inputs are expanded recursively.
//! Test tasks record the artifact they ran against and whether it passed;
//! that record feeds the up-to-date check, which the test policy then
//! overrides (tests always re-run).

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current schema version. Bump when the manifest format changes.
const MANIFEST_VERSION: u32 = 1;

/// Manifest filename within the build directory.
const MANIFEST_FILE: &str = "cache-manifest.json";

/// Result of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshResult {
    /// Nothing changed since the last successful run.
    Fresh,
    /// Must run again, with a human-readable reason.
    Stale(String),
}

impl FreshResult {
    /// Returns `true` if the result is `Fresh`.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Top-level cache manifest.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Link and install steps, keyed by target name.
    pub steps: HashMap<String, StepEntry>,
    /// Last recorded test runs, keyed by target name.
    #[serde(default)]
    pub tests: HashMap<String, TestEntry>,
}

/// Cache entry for a link or install step.
#[derive(Debug, Serialize, Deserialize)]
pub struct StepEntry {
    /// SHA-256 of the expanded command line.
    pub command_hash: String,
    /// Path to the produced output.
    pub output_path: PathBuf,
    /// Output file mtime (seconds since epoch).
    pub output_mtime_secs: i64,
    /// Input files and their recorded state.
    pub inputs: HashMap<PathBuf, SourceRecord>,
}

/// Recorded state of a single input file.
#[derive(Debug, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Last known mtime (seconds since epoch).
    pub mtime_secs: i64,
    /// SHA-256 of the file contents.
    pub content_hash: String,
}

/// Last recorded run of a test task.
#[derive(Debug, Serialize, Deserialize)]
pub struct TestEntry {
    /// Artifact mtime at the time of the run.
    pub artifact_mtime_secs: i64,
    /// Whether the run passed.
    pub passed: bool,
}

impl CacheManifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            steps: HashMap::new(),
            tests: HashMap::new(),
        }
    }

    /// Load the manifest from `<build_dir>/cache-manifest.json`.
    ///
    /// Returns `None` if the file is missing, corrupt, or has a version mismatch.
    pub fn load(build_dir: &Path) -> Option<Self> {
        let path = build_dir.join(MANIFEST_FILE);
        let data = fs::read_to_string(&path).ok()?;
        let manifest: Self = match serde_json::from_str(&data) {
            Ok(m) => m,
            Err(e) => {
                crate::vprintln!("  cache manifest unreadable, starting fresh: {e}");
                return None;
            }
        };
        if manifest.version != MANIFEST_VERSION {
            return None;
        }
        Some(manifest)
    }

    /// Load the manifest, or start an empty one.
    pub fn load_or_new(build_dir: &Path) -> Self {
        Self::load(build_dir).unwrap_or_default()
    }

    /// Save the manifest atomically (write to tmp, then rename).
    pub fn save(&self, build_dir: &Path) -> Result<()> {
        fs::create_dir_all(build_dir)
            .with_context(|| format!("failed to create {}", build_dir.display()))?;

        let path = build_dir.join(MANIFEST_FILE);
        let tmp_path = build_dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self).context("failed to serialize cache manifest")?;
        fs::write(&tmp_path, json).context("failed to write temporary cache manifest")?;
        fs::rename(&tmp_path, &path).context("failed to atomically replace cache manifest")?;

        Ok(())
    }

    /// Up-to-date check for a test: the artifact is unchanged and its last
    /// recorded run passed.
    pub fn is_test_fresh(&self, name: &str, artifact: &Path, rebuilt: &HashSet<String>) -> FreshResult {
        let Some(entry) = self.tests.get(name) else {
            return FreshResult::Stale("no recorded run".into());
        };
        if rebuilt.contains(name) {
            return FreshResult::Stale("artifact was rebuilt".into());
        }
        match file_mtime_secs(artifact) {
            Some(mtime) if mtime == entry.artifact_mtime_secs => {}
            Some(_) => return FreshResult::Stale("artifact mtime changed".into()),
            None => return FreshResult::Stale("artifact missing".into()),
        }
        if !entry.passed {
            return FreshResult::Stale("last run failed".into());
        }
        FreshResult::Fresh
    }

    /// Record the result of a test run.
    pub fn record_test(&mut self, name: &str, artifact: &Path, passed: bool) {
        self.tests.insert(
            name.to_string(),
            TestEntry {
                artifact_mtime_secs: file_mtime_secs(artifact).unwrap_or(0),
                passed,
            },
        );
    }
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl StepEntry {
    /// Check whether this step's output is still fresh.
    ///
    /// `rebuilt` holds the targets re-run in this build session; if any of
    /// `deps` is among them, the step must run again.
    pub fn is_fresh(&mut self, command_hash: &str, rebuilt: &HashSet<String>, deps: &[String]) -> FreshResult {
        if self.command_hash != command_hash {
            return FreshResult::Stale("command changed".into());
        }

        match file_mtime_secs(&self.output_path) {
            Some(mtime) if mtime == self.output_mtime_secs => {}
            Some(_) => return FreshResult::Stale("output mtime changed".into()),
            None => return FreshResult::Stale("output missing".into()),
        }

        for dep in deps {
            if rebuilt.contains(dep) {
                return FreshResult::Stale(format!("dependency `{dep}` was rebuilt"));
            }
        }

        for (path, record) in &mut self.inputs {
            let Some(current_mtime) = file_mtime_secs(path) else {
                return FreshResult::Stale(format!("input missing: {}", path.display()));
            };

            // Fast path: mtime unchanged.
            if current_mtime == record.mtime_secs {
                continue;
            }

            let Ok(current_hash) = hash_file(path) else {
                return FreshResult::Stale(format!("failed to hash: {}", path.display()));
            };
            if current_hash != record.content_hash {
                return FreshResult::Stale(format!("input changed: {}", path.display()));
            }

            // Content unchanged despite mtime change.
            record.mtime_secs = current_mtime;
        }

        FreshResult::Fresh
    }

    /// Build an entry for a step that just ran.
    pub fn from_step(command_hash: String, output: &Path, inputs: &[PathBuf]) -> Self {
        let mut records = HashMap::new();
        for file in expand_inputs(inputs) {
            let mtime_secs = file_mtime_secs(&file).unwrap_or(0);
            let content_hash = hash_file(&file).unwrap_or_default();
            records.insert(
                file,
                SourceRecord {
                    mtime_secs,
                    content_hash,
                },
            );
        }

        Self {
            command_hash,
            output_path: output.to_path_buf(),
            output_mtime_secs: file_mtime_secs(output).unwrap_or(0),
            inputs: records,
        }
    }
}

/// Expand directory inputs into the regular files beneath them.
pub fn expand_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(
                walkdir::WalkDir::new(input)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(walkdir::DirEntry::into_path),
            );
        } else if input.exists() {
            files.push(input.clone());
        }
    }
    files
}

/// Get a file's mtime as seconds since the Unix epoch.
pub fn file_mtime_secs(path: &Path) -> Option<i64> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let duration = mtime.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    i64::try_from(duration.as_secs()).ok()
}

/// SHA-256 of a NUL-separated argument list, as hex.
pub fn hash_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        hasher.update(arg.as_ref().as_encoded_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
    Ok(hash_bytes(&data))
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
