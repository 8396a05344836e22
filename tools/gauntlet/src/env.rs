//! Shared process environment for test executions.
//!
//! Dynamically linked tests need to find shared libraries built elsewhere
//! in the same graph without an install step. The composer prepends the
//! output directory of every linked artifact to the platform's loader
//! search-path variable(s) and hands the same snapshot to every test task.
//!
//! The snapshot is taken on first request and kept for the whole build
//! invocation: artifacts registered after that point do not appear in it.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Something that can enumerate the outputs of linked artifacts, in
/// discovery order.
pub trait ArtifactSource {
    /// Paths of every linked output known so far.
    fn linked_outputs(&self) -> Vec<PathBuf>;
}

/// Loader search-path variables for the host platform.
pub fn search_path_vars() -> &'static [&'static str] {
    if cfg!(windows) {
        &["PATH"]
    } else if cfg!(target_os = "macos") {
        &["DYLD_LIBRARY_PATH", "LD_LIBRARY_PATH"]
    } else {
        &["LD_LIBRARY_PATH"]
    }
}

/// Parent directories of `outputs`, first occurrence wins.
pub fn artifact_dirs(outputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for output in outputs {
        let Some(parent) = output.parent() else {
            continue;
        };
        if !dirs.iter().any(|d| d == parent) {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

/// An immutable variable map handed to every spawned test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl SharedEnvironment {
    /// Compose an environment from `ambient`, prepending `dirs` to each
    /// variable in `path_vars`.
    ///
    /// The prior value of a variable is appended after the directories;
    /// an unset or empty prior value contributes nothing.
    pub fn compose<I>(ambient: I, dirs: &[PathBuf], path_vars: &[&str]) -> Result<Self>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut vars: BTreeMap<OsString, OsString> = ambient.into_iter().collect();

        for var in path_vars {
            let prior = vars.get(OsStr::new(var)).cloned();
            let value = prepend_search_path(dirs, prior.as_deref())
                .with_context(|| format!("cannot compose {var}"))?;
            vars.insert(OsString::from(var), value);
        }

        Ok(Self { vars })
    }

    /// Look up a variable.
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    /// Iterate over all variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }
}

fn prepend_search_path(dirs: &[PathBuf], prior: Option<&OsStr>) -> Result<OsString> {
    let mut value = std::env::join_paths(dirs.iter().map(PathBuf::as_path))
        .context("artifact directory contains a path separator")?;
    if let Some(prior) = prior.filter(|p| !p.is_empty()) {
        if !value.is_empty() {
            value.push(if cfg!(windows) { ";" } else { ":" });
        }
        value.push(prior);
    }
    Ok(value)
}

/// Builds the [`SharedEnvironment`] at most once per build invocation.
///
/// Concurrent first callers serialize on the internal mutex; exactly one of
/// them scans the artifact source, the rest receive its result. A failed
/// composition is not cached, so the next caller retries and reports the
/// same error.
pub struct EnvironmentComposer {
    ambient: Box<dyn Fn() -> Vec<(OsString, OsString)> + Send + Sync>,
    path_vars: &'static [&'static str],
    cached: Mutex<Option<Arc<SharedEnvironment>>>,
}

impl EnvironmentComposer {
    /// A composer reading the real process environment and the host's
    /// search-path variables.
    pub fn new() -> Self {
        Self::with_ambient(|| std::env::vars_os().collect(), search_path_vars())
    }

    /// A composer with an injected ambient environment and variable set.
    pub fn with_ambient<F>(ambient: F, path_vars: &'static [&'static str]) -> Self
    where
        F: Fn() -> Vec<(OsString, OsString)> + Send + Sync + 'static,
    {
        Self {
            ambient: Box::new(ambient),
            path_vars,
            cached: Mutex::new(None),
        }
    }

    /// Return the build's shared environment, composing it on first use.
    pub fn shared(&self, source: &dyn ArtifactSource) -> Result<Arc<SharedEnvironment>> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(ref env) = *cached {
            return Ok(Arc::clone(env));
        }

        let _t = crate::verbose::Timer::start("environment composition");
        let dirs = artifact_dirs(&source.linked_outputs());
        let env = Arc::new(SharedEnvironment::compose(
            (self.ambient)(),
            &dirs,
            self.path_vars,
        )?);
        crate::vprintln!(
            "  test environment: {} artifact dir(s) on {}",
            dirs.len(),
            self.path_vars.join(", ")
        );
        *cached = Some(Arc::clone(&env));
        Ok(env)
    }

    /// Returns `true` once the environment has been composed.
    pub fn is_composed(&self) -> bool {
        self.cached
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }
}

impl Default for EnvironmentComposer {
    fn default() -> Self {
        Self::new()
    }
}
