//! Persistent build log (`test.log`).
//!
//! Status lines and failure diagnostics are appended here in addition to the
//! console. The file is created on first write and truncated at that point,
//! so each build invocation leaves one log behind. Concurrent writers are
//! serialized; a diagnostic block is written in one locked append so blocks
//! from parallel tests never interleave.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Append-only log sink shared by all test tasks of a build.
pub struct BuildLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl BuildLog {
    /// A log that will be written to `path` on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line.
    pub fn line(&self, text: &str) -> Result<()> {
        self.append(|f| writeln!(f, "{text}"))
    }

    /// Append a titled block of text.
    pub fn block(&self, title: &str, body: &str) -> Result<()> {
        self.append(|f| {
            writeln!(f, "---- {title} ----")?;
            writeln!(f, "{}", body.trim_end_matches('\n'))?;
            writeln!(f, "---- end {title} ----")
        })
    }

    fn append(&self, write: impl FnOnce(&mut File) -> std::io::Result<()>) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let file = match guard.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                File::create(&self.path)
                    .with_context(|| format!("failed to create {}", self.path.display()))?
            }
        };
        let file = guard.insert(file);
        write(file).with_context(|| format!("failed to write {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}
