//! Test tasks: run one built artifact and classify the result.
//!
//! A task moves through `Pending → Skipped | stale-check → Run → Completed`.
//! The stale-check consults the engine's up-to-date verdict but never lets
//! it skip the test: tests re-run on every invocation unless the build was
//! started with `--notests`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::cache::FreshResult;
use crate::env::{ArtifactSource, EnvironmentComposer};
use crate::error::TestError;
use crate::policy::BuildPolicy;

/// A command line and working directory about to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
}

/// Per-artifact hook run before the environment is composed and the test
/// is spawned. It may rewrite the invocation.
pub trait PreRunHook: Send + Sync {
    /// Prepare for the run of `artifact`.
    fn before_run(&self, artifact: &TestArtifact, invocation: &mut Invocation) -> Result<()>;
}

/// A [`PreRunHook`] that runs a fixed command in the test's working
/// directory and requires it to succeed.
#[derive(Debug, Clone)]
pub struct CommandHook {
    argv: Vec<String>,
}

impl CommandHook {
    /// Hook running `argv`. The list must not be empty.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl PreRunHook for CommandHook {
    fn before_run(&self, _artifact: &TestArtifact, invocation: &mut Invocation) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("empty pre-run command");
        };
        let output = Command::new(program)
            .args(args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow::anyhow!("failed to run `{}`: {e}", self.argv.join(" ")))?;
        if !output.status.success() {
            bail!(
                "`{}` exited with {}:\n{}",
                self.argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

/// A built executable to run as a test.
#[derive(Clone)]
pub struct TestArtifact {
    /// Display name (the producing target's name).
    pub name: String,
    /// Absolute path of the executable.
    pub path: PathBuf,
    /// Replaces the default `[path]` invocation.
    pub args: Option<Vec<String>>,
    /// Replaces the default working directory (the artifact's parent).
    pub cwd: Option<PathBuf>,
    /// Runs before environment composition and spawning.
    pub pre_run: Option<Arc<dyn PreRunHook>>,
}

impl TestArtifact {
    /// An artifact with no overrides.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: None,
            cwd: None,
            pre_run: None,
        }
    }

    /// Directory containing the executable.
    pub fn parent_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl fmt::Debug for TestArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestArtifact")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("pre_run", &self.pre_run.is_some())
            .finish()
    }
}

/// Classified result of a test task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    /// Exited with code 0.
    Passed,
    /// Exited non-zero or was killed by a signal.
    Failed,
    /// Not executed (`--notests`).
    Skipped,
}

impl TestStatus {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Result of one test execution.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// Display name of the test.
    pub name: String,
    /// Exit code; `None` when skipped or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Derived status.
    pub status: TestStatus,
    /// Wall-clock run time.
    pub duration: Duration,
}

impl TestOutcome {
    /// Outcome of a test that was not executed.
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: TestStatus::Skipped,
            duration: Duration::ZERO,
        }
    }

    /// Classify a finished child process.
    pub fn from_output(name: impl Into<String>, output: Output, duration: Duration) -> Self {
        let exit_code = output.status.code();
        let status = if exit_code == Some(0) {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        Self {
            name: name.into(),
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            status,
            duration,
        }
    }
}

/// Scheduling decision for a test task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Complete without running.
    Skip,
    /// Execute now.
    Run,
}

/// The scheduled unit wrapping one test artifact.
#[derive(Debug, Clone)]
pub struct TestTask {
    artifact: TestArtifact,
}

impl TestTask {
    /// Wrap an artifact.
    pub fn new(artifact: TestArtifact) -> Self {
        Self { artifact }
    }

    /// The wrapped artifact.
    pub fn artifact(&self) -> &TestArtifact {
        &self.artifact
    }

    /// Test name.
    pub fn name(&self) -> &str {
        &self.artifact.name
    }

    /// Decide whether this task runs.
    ///
    /// `engine` is the generic up-to-date verdict. A fresh verdict would let
    /// the engine skip the task; tests are never reused from a previous
    /// build, so it is turned into [`TaskStatus::Run`].
    pub fn runnable_status(&self, policy: &BuildPolicy, engine: &FreshResult) -> TaskStatus {
        if policy.no_tests {
            return TaskStatus::Skip;
        }
        match engine {
            FreshResult::Fresh => {
                crate::vprintln!("  {} is up to date, running it anyway", self.name());
            }
            FreshResult::Stale(reason) => {
                crate::vprintln!("  stale: {} ({reason})", self.name());
            }
        }
        TaskStatus::Run
    }

    /// Resolve the invocation: overrides, pre-run hook, then the policy's
    /// command template.
    ///
    /// The result may be empty when a hook clears it; [`TestTask::execute`]
    /// rejects that before spawning.
    pub fn prepare(&self, policy: &BuildPolicy) -> Result<Invocation, TestError> {
        let artifact = &self.artifact;
        let argv = match artifact.args {
            Some(ref args) => args.clone(),
            None => vec![path_to_string(&artifact.path)?],
        };
        let cwd = artifact
            .cwd
            .clone()
            .unwrap_or_else(|| artifact.parent_dir().to_path_buf());
        let mut invocation = Invocation { argv, cwd };

        if let Some(ref hook) = artifact.pre_run {
            hook.before_run(artifact, &mut invocation)
                .map_err(|e| TestError::PreRunHook {
                    name: artifact.name.clone(),
                    message: format!("{e:#}"),
                })?;
        }

        invocation.argv = policy.wrap(invocation.argv);
        Ok(invocation)
    }

    /// Run the test to completion and classify it.
    ///
    /// Blocks until the child exits; stdout and stderr are captured in full.
    /// There is no timeout. Spawn and environment errors are returned as
    /// errors; a non-zero exit is a [`TestStatus::Failed`] outcome.
    pub fn execute(
        &self,
        policy: &BuildPolicy,
        composer: &EnvironmentComposer,
        source: &dyn ArtifactSource,
    ) -> Result<TestOutcome> {
        let invocation = self.prepare(policy)?;
        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(TestError::EmptyInvocation {
                name: self.name().to_string(),
            }
            .into());
        };
        let env = composer.shared(source)?;

        crate::vprintln!(
            "  running {} in {}",
            invocation.argv.join(" "),
            invocation.cwd.display()
        );

        let start = Instant::now();
        let output = Command::new(program)
            .args(args)
            .current_dir(&invocation.cwd)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TestError::SpawnFailure {
                name: self.name().to_string(),
                program: program.clone(),
                source,
            })?;

        Ok(TestOutcome::from_output(self.name(), output, start.elapsed()))
    }
}

fn path_to_string(path: &Path) -> Result<String, TestError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| TestError::InvalidPath {
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CommandTemplate;
    use std::sync::Mutex;

    struct NoArtifacts;

    impl ArtifactSource for NoArtifacts {
        fn linked_outputs(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    struct AppendArg(&'static str);

    impl PreRunHook for AppendArg {
        fn before_run(&self, _artifact: &TestArtifact, invocation: &mut Invocation) -> Result<()> {
            invocation.argv.push(self.0.to_string());
            Ok(())
        }
    }

    struct ClearArgs;

    impl PreRunHook for ClearArgs {
        fn before_run(&self, _artifact: &TestArtifact, invocation: &mut Invocation) -> Result<()> {
            invocation.argv.clear();
            Ok(())
        }
    }

    struct FailingHook;

    impl PreRunHook for FailingHook {
        fn before_run(&self, _artifact: &TestArtifact, _invocation: &mut Invocation) -> Result<()> {
            bail!("fixture missing")
        }
    }

    struct RecordingHook(Mutex<Vec<String>>);

    impl PreRunHook for RecordingHook {
        fn before_run(&self, artifact: &TestArtifact, _invocation: &mut Invocation) -> Result<()> {
            self.0.lock().unwrap().push(artifact.name.clone());
            Ok(())
        }
    }

    fn template_policy(template: &str) -> BuildPolicy {
        BuildPolicy {
            command_template: Some(CommandTemplate::parse(template).unwrap()),
            ..Default::default()
        }
    }

    fn sh(name: &str, script: &str) -> TestArtifact {
        let mut artifact = TestArtifact::new(name, "/bin/sh");
        artifact.args = Some(vec!["/bin/sh".into(), "-c".into(), script.into()]);
        artifact
    }

    #[test]
    fn default_invocation_runs_artifact_in_its_directory() {
        let task = TestTask::new(TestArtifact::new("app", "/out/tests/app"));
        let inv = task.prepare(&BuildPolicy::default()).unwrap();
        assert_eq!(inv.argv, vec!["/out/tests/app"]);
        assert_eq!(inv.cwd, PathBuf::from("/out/tests"));
    }

    #[test]
    fn template_wraps_artifact_path() {
        let task = TestTask::new(TestArtifact::new("app", "/out/app"));
        let inv = task.prepare(&template_policy("harness %s")).unwrap();
        assert_eq!(inv.argv, vec!["harness", "/out/app"]);
    }

    #[test]
    fn template_substitutes_override_program() {
        let mut artifact = TestArtifact::new("app", "/out/app");
        artifact.args = Some(vec!["/staged/app".into(), "--quick".into()]);
        let inv = TestTask::new(artifact)
            .prepare(&template_policy("harness %s"))
            .unwrap();
        assert_eq!(inv.argv, vec!["harness", "/staged/app"]);
    }

    #[test]
    fn cwd_override_wins_over_artifact_dir() {
        let mut artifact = TestArtifact::new("app", "/out/app");
        artifact.cwd = Some(PathBuf::from("/data/fixtures"));
        let inv = TestTask::new(artifact).prepare(&BuildPolicy::default()).unwrap();
        assert_eq!(inv.cwd, PathBuf::from("/data/fixtures"));
    }

    #[test]
    fn hook_runs_before_template() {
        let mut artifact = TestArtifact::new("app", "/out/app");
        artifact.pre_run = Some(Arc::new(AppendArg("--seed=1")));
        let task = TestTask::new(artifact);

        let inv = task.prepare(&BuildPolicy::default()).unwrap();
        assert_eq!(inv.argv, vec!["/out/app", "--seed=1"]);

        let inv = task.prepare(&template_policy("harness %s")).unwrap();
        assert_eq!(inv.argv, vec!["harness", "/out/app"]);
    }

    #[test]
    fn failing_hook_names_the_test() {
        let mut artifact = TestArtifact::new("app", "/out/app");
        artifact.pre_run = Some(Arc::new(FailingHook));
        let err = TestTask::new(artifact).prepare(&BuildPolicy::default()).unwrap_err();
        assert!(matches!(err, TestError::PreRunHook { ref name, .. } if name == "app"));
        assert!(err.to_string().contains("fixture missing"), "unexpected error: {err}");
    }

    #[test]
    fn notests_skips_regardless_of_freshness() {
        let task = TestTask::new(TestArtifact::new("app", "/out/app"));
        let policy = BuildPolicy {
            no_tests: true,
            ..Default::default()
        };
        assert_eq!(task.runnable_status(&policy, &FreshResult::Fresh), TaskStatus::Skip);
        assert_eq!(
            task.runnable_status(&policy, &FreshResult::Stale("new".into())),
            TaskStatus::Skip
        );
    }

    #[test]
    fn fresh_tests_still_run() {
        let task = TestTask::new(TestArtifact::new("app", "/out/app"));
        let policy = BuildPolicy::default();
        assert_eq!(task.runnable_status(&policy, &FreshResult::Fresh), TaskStatus::Run);
        assert_eq!(
            task.runnable_status(&policy, &FreshResult::Stale("new".into())),
            TaskStatus::Run
        );
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_passes() {
        let task = TestTask::new(sh("ok", "exit 0"));
        let outcome = task
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Passed);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_fails_and_keeps_output() {
        let task = TestTask::new(sh("bad", "echo out; echo err >&2; exit 3"));
        let outcome = task
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
    }

    #[cfg(unix)]
    #[test]
    fn killed_test_fails_without_exit_code() {
        let task = TestTask::new(sh("killed", "kill -9 $$"));
        let outcome = task
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.exit_code, None);
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_override_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut artifact = sh("pwd", "pwd -P");
        artifact.cwd = Some(tmp.path().to_path_buf());
        let outcome = TestTask::new(artifact)
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        let printed = String::from_utf8(outcome.stdout).unwrap();
        assert_eq!(
            PathBuf::from(printed.trim_end()),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn template_is_what_gets_spawned() {
        let task = TestTask::new(TestArtifact::new("wrapped", "/does/not/exist"));
        let outcome = task
            .execute(&template_policy("echo %s"), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Passed);
        assert_eq!(outcome.stdout, b"/does/not/exist\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_sees_composed_search_path() {
        struct OneLib;
        impl ArtifactSource for OneLib {
            fn linked_outputs(&self) -> Vec<PathBuf> {
                vec![PathBuf::from("/out/lib/libutil.so")]
            }
        }

        let composer = EnvironmentComposer::with_ambient(Vec::new, &["LD_LIBRARY_PATH"]);
        let task = TestTask::new(sh("env", "printf %s \"$LD_LIBRARY_PATH\""));
        let outcome = task
            .execute(&BuildPolicy::default(), &composer, &OneLib)
            .unwrap();
        assert_eq!(outcome.stdout, b"/out/lib");
    }

    #[test]
    fn missing_executable_is_a_spawn_failure() {
        let task = TestTask::new(TestArtifact::new("ghost", "/does/not/exist/ghost"));
        let err = task
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap_err();
        let err = err.downcast_ref::<TestError>().expect("typed test error");
        assert!(matches!(err, TestError::SpawnFailure { name, .. } if name == "ghost"));
    }

    #[test]
    fn hook_sees_the_artifact() {
        let hook = Arc::new(RecordingHook(Mutex::new(Vec::new())));
        let mut artifact = TestArtifact::new("app", "/out/app");
        artifact.pre_run = Some(hook.clone());
        TestTask::new(artifact).prepare(&BuildPolicy::default()).unwrap();
        assert_eq!(*hook.0.lock().unwrap(), vec!["app".to_string()]);
    }

    #[test]
    fn cleared_invocation_is_rejected_before_spawning() {
        let mut artifact = TestArtifact::new("empty", "/out/empty");
        artifact.pre_run = Some(Arc::new(ClearArgs));
        let err = TestTask::new(artifact)
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap_err();
        let err = err.downcast_ref::<TestError>().expect("typed test error");
        assert!(matches!(err, TestError::EmptyInvocation { name } if name == "empty"));
    }

    #[cfg(unix)]
    #[test]
    fn command_hook_runs_in_the_test_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut artifact = sh("fixture", "test -f marker");
        artifact.cwd = Some(tmp.path().to_path_buf());
        artifact.pre_run = Some(Arc::new(CommandHook::new(vec![
            "sh".into(),
            "-c".into(),
            "touch marker".into(),
        ])));
        let outcome = TestTask::new(artifact)
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Passed);
        assert!(tmp.path().join("marker").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_hook_prevents_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut artifact = sh("guarded", "touch ran");
        artifact.cwd = Some(tmp.path().to_path_buf());
        artifact.pre_run = Some(Arc::new(CommandHook::new(vec!["false".into()])));
        let err = TestTask::new(artifact)
            .execute(&BuildPolicy::default(), &EnvironmentComposer::new(), &NoArtifacts)
            .unwrap_err();
        let err = err.downcast_ref::<TestError>().expect("typed test error");
        assert!(matches!(err, TestError::PreRunHook { name, .. } if name == "guarded"));
        assert!(!tmp.path().join("ran").exists());
    }
}
