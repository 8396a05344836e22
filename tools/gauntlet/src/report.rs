//! Test result reporting and pass/fail policy.
//!
//! Each finished test produces one status line on the console (and in the
//! build log). Failures additionally get a diagnostic block with the
//! captured stdout/stderr, written to the build log only. Under strict
//! policy a failure is turned into a build-aborting error.

use std::io::IsTerminal;
use std::sync::Mutex;

use crossterm::style::Stylize;

use crate::error::TestError;
use crate::log::BuildLog;
use crate::policy::BuildPolicy;
use crate::task::{TestOutcome, TestStatus};

/// Append-only record of every test outcome in a build.
#[derive(Default)]
pub struct BuildSummary {
    outcomes: Mutex<Vec<TestOutcome>>,
}

/// Aggregate counts over a [`BuildSummary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    /// Tests that exited with 0.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that were not executed.
    pub skipped: usize,
}

impl BuildSummary {
    /// Record an outcome.
    pub fn record(&self, outcome: TestOutcome) {
        self.lock().push(outcome);
    }

    /// Copy of all outcomes, in completion order.
    pub fn outcomes(&self) -> Vec<TestOutcome> {
        self.lock().clone()
    }

    /// Count outcomes by status.
    pub fn counts(&self) -> SummaryCounts {
        let mut counts = SummaryCounts::default();
        for outcome in self.lock().iter() {
            match outcome.status {
                TestStatus::Passed => counts.passed += 1,
                TestStatus::Failed => counts.failed += 1,
                TestStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Names of failed tests, in completion order.
    pub fn failed_names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|o| o.status == TestStatus::Failed)
            .map(|o| o.name.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TestOutcome>> {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Turns outcomes into status lines, log entries and policy decisions.
pub struct Reporter {
    log: BuildLog,
    summary: BuildSummary,
    color: bool,
}

impl Reporter {
    /// A reporter writing diagnostics to `log`.
    pub fn new(log: BuildLog) -> Self {
        Self {
            log,
            summary: BuildSummary::default(),
            color: std::io::stdout().is_terminal(),
        }
    }

    /// The build log sink.
    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Outcomes recorded so far.
    pub fn summary(&self) -> &BuildSummary {
        &self.summary
    }

    /// Report a finished (or skipped) test and apply the failure policy.
    ///
    /// Returns [`TestError::TestFailure`] exactly when the test failed and
    /// the policy is strict. The outcome is recorded in the summary either
    /// way.
    pub fn report(&self, outcome: TestOutcome, policy: &BuildPolicy) -> Result<(), TestError> {
        let line = status_line(&outcome.name, outcome.status, false);
        let console = status_line(&outcome.name, outcome.status, self.color);
        match outcome.status {
            TestStatus::Passed => crate::dprintln!("{console}"),
            TestStatus::Failed => println!("{console}"),
            TestStatus::Skipped => crate::vprintln!("{console}"),
        }
        self.log_or_warn(self.log.line(&line));

        let mut failure = None;
        if outcome.status == TestStatus::Failed {
            let mut diagnostics = format_diagnostics(&outcome);
            if diagnostics.is_empty() {
                diagnostics.push_str("(no output)");
            }
            let title = match outcome.exit_code {
                Some(code) => format!("{} (exit code {code})", outcome.name),
                None => format!("{} (terminated by signal)", outcome.name),
            };
            self.log_or_warn(self.log.block(&title, &diagnostics));

            if !policy.permissive {
                failure = Some(TestError::TestFailure {
                    name: outcome.name.clone(),
                    exit_code: outcome.exit_code,
                });
            }
        }

        self.summary.record(outcome);
        failure.map_or(Ok(()), Err)
    }

    /// Print the end-of-build summary and mirror it to the log.
    pub fn print_summary(&self) {
        let counts = self.summary.counts();
        let total = counts.passed + counts.failed + counts.skipped;
        if total == 0 {
            return;
        }

        let line = format!(
            "Test results: {} passed, {} failed, {} skipped",
            counts.passed, counts.failed, counts.skipped
        );
        println!("\n{line}");
        self.log_or_warn(self.log.line(&line));

        let failed = self.summary.failed_names();
        if !failed.is_empty() {
            println!("Failed tests:");
            for name in &failed {
                println!("  - {name}");
            }
            println!("Details in {}", self.log.path().display());
        }
    }

    fn log_or_warn(&self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            eprintln!("warning: {e:#}");
        }
    }
}

/// `Running test 'name' ... : passed`, optionally colored.
pub fn status_line(name: &str, status: TestStatus, color: bool) -> String {
    let label = format!("Running test '{name}'");
    let verdict = match (status, color) {
        (TestStatus::Passed, true) => "passed".green().to_string(),
        (TestStatus::Failed, true) => "FAIL".red().bold().to_string(),
        (TestStatus::Skipped, true) => "skipped".yellow().to_string(),
        (TestStatus::Passed, false) => "passed".to_string(),
        (TestStatus::Failed, false) => "FAIL".to_string(),
        (TestStatus::Skipped, false) => "skipped".to_string(),
    };
    format!("  {label:<48} : {verdict}")
}

/// Labeled stdout/stderr sections for a failed test.
///
/// Empty streams are omitted. Output that is not valid UTF-8 is shown
/// lossily under a label that says so.
pub fn format_diagnostics(outcome: &TestOutcome) -> String {
    [("stdout", &outcome.stdout), ("stderr", &outcome.stderr)]
        .into_iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .map(|(label, bytes)| match std::str::from_utf8(bytes) {
            Ok(text) => format!("{label}:\n{text}"),
            Err(e) => format!(
                "{label} (invalid UTF-8 after byte {}, shown lossily):\n{}",
                e.valid_up_to(),
                String::from_utf8_lossy(bytes)
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outcome(name: &str, status: TestStatus, stdout: &[u8], stderr: &[u8]) -> TestOutcome {
        TestOutcome {
            name: name.into(),
            exit_code: match status {
                TestStatus::Passed => Some(0),
                TestStatus::Failed => Some(1),
                TestStatus::Skipped => None,
            },
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
            status,
            duration: Duration::from_millis(5),
        }
    }

    fn reporter(dir: &tempfile::TempDir) -> Reporter {
        Reporter::new(BuildLog::new(dir.path().join("test.log")))
    }

    fn strict() -> BuildPolicy {
        BuildPolicy::default()
    }

    fn permissive() -> BuildPolicy {
        BuildPolicy {
            permissive: true,
            ..Default::default()
        }
    }

    #[test]
    fn passing_test_never_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(&tmp);
        reporter.report(outcome("a", TestStatus::Passed, b"", b""), &strict()).unwrap();
        reporter.report(outcome("b", TestStatus::Passed, b"", b""), &permissive()).unwrap();
        assert_eq!(reporter.summary().counts().passed, 2);
    }

    #[test]
    fn strict_failure_aborts_with_test_name() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(&tmp);
        let err = reporter
            .report(outcome("math_test", TestStatus::Failed, b"1 != 2\n", b""), &strict())
            .unwrap_err();
        assert!(err.is_test_failure());
        assert_eq!(err.to_string(), "Test 'math_test' failed");
        assert_eq!(reporter.summary().counts().failed, 1);
    }

    #[test]
    fn permissive_failure_is_recorded_with_output() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(&tmp);
        reporter
            .report(outcome("io_test", TestStatus::Failed, b"out\n", b"err\n"), &permissive())
            .unwrap();

        let outcomes = reporter.summary().outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].stdout, b"out\n");
        assert_eq!(outcomes[0].stderr, b"err\n");
        assert_eq!(reporter.summary().failed_names(), vec!["io_test".to_string()]);

        let log = std::fs::read_to_string(tmp.path().join("test.log")).unwrap();
        assert!(log.contains("Running test 'io_test'"), "log: {log}");
        assert!(log.contains("FAIL"), "log: {log}");
        assert!(log.contains("io_test (exit code 1)"), "log: {log}");
        assert!(log.contains("stdout:\nout\n"), "log: {log}");
        assert!(log.contains("stderr:\nerr\n"), "log: {log}");
    }

    #[test]
    fn silent_failure_logs_a_placeholder_body() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(&tmp);
        reporter
            .report(outcome("mute_test", TestStatus::Failed, b"", b""), &permissive())
            .unwrap();

        let log = std::fs::read_to_string(tmp.path().join("test.log")).unwrap();
        assert!(
            log.contains("---- mute_test (exit code 1) ----\n(no output)\n---- end"),
            "log: {log}"
        );
    }

    #[test]
    fn skipped_tests_are_not_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(&tmp);
        reporter.report(TestOutcome::skipped("later"), &strict()).unwrap();
        assert_eq!(
            reporter.summary().counts(),
            SummaryCounts {
                passed: 0,
                failed: 0,
                skipped: 1
            }
        );
    }

    #[test]
    fn diagnostics_omit_empty_streams() {
        let only_err = outcome("t", TestStatus::Failed, b"", b"boom\n");
        assert_eq!(format_diagnostics(&only_err), "stderr:\nboom\n");

        let silent = outcome("t", TestStatus::Failed, b"", b"");
        assert_eq!(format_diagnostics(&silent), "");
    }

    #[test]
    fn invalid_utf8_is_surfaced() {
        let garbled = outcome("t", TestStatus::Failed, b"ok\xff\xfe", b"");
        let text = format_diagnostics(&garbled);
        assert!(text.starts_with("stdout (invalid UTF-8 after byte 2"), "text: {text}");
        assert!(text.contains("ok\u{fffd}"), "text: {text}");
    }

    #[test]
    fn plain_status_lines() {
        assert!(status_line("a", TestStatus::Passed, false).ends_with(": passed"));
        assert!(status_line("a", TestStatus::Failed, false).ends_with(": FAIL"));
    }
}
