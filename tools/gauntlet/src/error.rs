//! Error taxonomy for test execution.
//!
//! Build plumbing (manifest loading, link steps, cache I/O) reports through
//! `anyhow`. Test execution has a small, closed set of failure modes that
//! callers match on, so those get a typed enum which converts into
//! `anyhow::Error` at the scheduler boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of a single test execution.
#[derive(Debug, Error)]
pub enum TestError {
    /// The test executable could not be started.
    #[error("failed to start test '{name}' ({program}): {source}")]
    SpawnFailure {
        /// Display name of the test.
        name: String,
        /// First element of the invocation that was attempted.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The test ran and exited unsuccessfully under strict policy.
    #[error("Test '{name}' failed")]
    TestFailure {
        /// Display name of the test.
        name: String,
        /// Exit code, `None` if the process was terminated by a signal.
        exit_code: Option<i32>,
    },

    /// The `--testcmd` template is malformed.
    #[error("invalid test command template '{template}': {reason}")]
    Configuration {
        /// The template as given.
        template: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The per-artifact pre-run hook returned an error.
    #[error("pre-run hook for test '{name}' failed: {message}")]
    PreRunHook {
        /// Display name of the test.
        name: String,
        /// Rendered hook error chain.
        message: String,
    },

    /// The invocation resolved to an empty argument list.
    #[error("test '{name}' has an empty invocation")]
    EmptyInvocation {
        /// Display name of the test.
        name: String,
    },

    /// A path could not be turned into text for command substitution.
    #[error("path is not valid UTF-8: {}", path.display())]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
    },
}

impl TestError {
    /// Returns `true` for a policy-gated test failure (as opposed to a fault
    /// in running the test at all).
    pub fn is_test_failure(&self) -> bool {
        matches!(self, Self::TestFailure { .. })
    }
}
