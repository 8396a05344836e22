//! Link and install steps: the non-test nodes of the build graph.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::cache::hash_args;
use crate::hook::TestProducer;
use crate::model::{TargetDef, TargetKind};
use crate::task::{CommandHook, PreRunHook, TestArtifact};

/// Test settings carried by a link step tagged with the test feature.
#[derive(Debug, Clone, Default)]
pub struct TestSpec {
    /// Invocation override.
    pub args: Option<Vec<String>>,
    /// Absolute working-directory override.
    pub cwd: Option<PathBuf>,
    /// Command run before the test.
    pub pre_run: Option<Vec<String>>,
}

/// Runs an external command that produces one output file.
#[derive(Debug, Clone)]
pub struct LinkStep {
    /// Target name.
    pub target: String,
    /// Output kind.
    pub kind: TargetKind,
    /// Fully expanded command line.
    pub command: Vec<String>,
    /// Absolute input paths.
    pub inputs: Vec<PathBuf>,
    /// Absolute output path.
    pub output: PathBuf,
    /// Names of the targets this step depends on.
    pub deps: Vec<String>,
    /// Present when the output is a test executable.
    pub test: Option<TestSpec>,
}

impl LinkStep {
    /// Lower a manifest target into a link step rooted at `root`.
    pub fn from_target(def: &TargetDef, root: &Path) -> Result<Self> {
        let Some(ref output) = def.output else {
            bail!("target '{}' has no output", def.name);
        };
        let output = root.join(output);
        let inputs: Vec<PathBuf> = def.inputs.iter().map(|i| root.join(i)).collect();
        let command = expand_command(&def.command, root, &inputs, &output)
            .with_context(|| format!("failed to expand command of '{}'", def.name))?;

        let test = def.is_test().then(|| {
            let overrides = def.test.clone().unwrap_or_default();
            TestSpec {
                args: overrides.args,
                cwd: overrides.cwd.map(|cwd| root.join(cwd)),
                pre_run: overrides.pre_run,
            }
        });

        Ok(Self {
            target: def.name.clone(),
            kind: def.kind,
            command,
            inputs,
            output,
            deps: def.deps.clone(),
            test,
        })
    }

    /// Cache key of the expanded command line.
    pub fn command_hash(&self) -> String {
        hash_args(&self.command)
    }

    /// Run the command in `root` and return the produced output.
    pub fn run(&self, root: &Path) -> Result<PathBuf> {
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let Some((program, args)) = self.command.split_first() else {
            bail!("target '{}' has an empty command", self.target);
        };
        let output = Command::new(program)
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run `{program}` for '{}'", self.target))?;
        check_output(&self.target, self.kind, &output)?;

        if !self.output.exists() {
            bail!(
                "target '{}' did not produce {}",
                self.target,
                self.output.display()
            );
        }
        Ok(self.output.clone())
    }
}

fn check_output(target: &str, kind: TargetKind, output: &Output) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("failed to link {} '{target}' ({}):\n{stderr}", kind.as_str(), output.status);
    }
    Ok(())
}

impl TestProducer for LinkStep {
    fn producer_name(&self) -> &str {
        &self.target
    }

    fn link_output(&self) -> Option<&Path> {
        Some(&self.output)
    }

    fn test_artifact(&self) -> Option<TestArtifact> {
        let spec = self.test.as_ref()?;
        let mut artifact = TestArtifact::new(&self.target, &self.output);
        artifact.args = spec.args.clone();
        artifact.cwd = spec.cwd.clone();
        artifact.pre_run = spec
            .pre_run
            .clone()
            .map(|argv| -> Arc<dyn PreRunHook> { Arc::new(CommandHook::new(argv)) });
        Some(artifact)
    }
}

/// Copies another target's output into a destination directory.
#[derive(Debug, Clone)]
pub struct InstallStep {
    /// Target name.
    pub target: String,
    /// Name of the target whose output is copied.
    pub source: String,
    /// Absolute path of the source output.
    pub source_output: PathBuf,
    /// Absolute destination directory.
    pub dest_dir: PathBuf,
}

impl InstallStep {
    /// Path the source output is copied to.
    pub fn dest_file(&self) -> PathBuf {
        match self.source_output.file_name() {
            Some(name) => self.dest_dir.join(name),
            None => self.dest_dir.clone(),
        }
    }

    /// Copy the source output into the destination directory.
    pub fn run(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.dest_dir)
            .with_context(|| format!("failed to create {}", self.dest_dir.display()))?;
        let dest = self.dest_file();
        fs::copy(&self.source_output, &dest).with_context(|| {
            format!(
                "failed to install {} to {}",
                self.source_output.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }
}

/// Expand `{output}`, `{inputs}` and `{root}` in a command line.
///
/// An argument that is exactly `{inputs}` becomes one argument per input;
/// anywhere else the inputs are joined with spaces.
pub fn expand_command(
    command: &[String],
    root: &Path,
    inputs: &[PathBuf],
    output: &Path,
) -> Result<Vec<String>> {
    let root = path_str(root)?;
    let output = path_str(output)?;
    let inputs: Vec<&str> = inputs.iter().map(|i| path_str(i)).collect::<Result<_>>()?;

    let mut expanded = Vec::with_capacity(command.len() + inputs.len());
    for arg in command {
        if arg == "{inputs}" {
            expanded.extend(inputs.iter().map(|i| (*i).to_string()));
            continue;
        }
        expanded.push(
            arg.replace("{output}", output)
                .replace("{root}", root)
                .replace("{inputs}", &inputs.join(" ")),
        );
    }
    Ok(expanded)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}
