//! Project manifest types deserialized from `gauntlet.toml`.
//!
//! Pure data with no behavior beyond small accessors. The manifest is
//! validated by [`crate::validate`], resolved against CLI flags by
//! [`crate::config`], and lowered into a [`crate::graph::BuildGraph`].

use serde::{Deserialize, Serialize};

/// Manifest file name looked up at the project root.
pub const MANIFEST_FILE: &str = "gauntlet.toml";

/// Group that targets land in when they do not name one.
pub const DEFAULT_GROUP: &str = "build";

/// The feature tag that marks a target's output as a test.
pub const TEST_FEATURE: &str = "test";

/// The complete project manifest.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildModel {
    /// Project metadata.
    #[serde(default)]
    pub project: ProjectDef,
    /// Build engine settings.
    #[serde(default)]
    pub build: BuildDef,
    /// Test policy defaults.
    #[serde(default)]
    pub tests: TestsDef,
    /// Declared targets, in declaration order.
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetDef>,
}

/// Project metadata.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDef {
    /// Project name, shown in the build banner.
    pub name: String,
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDef {
    /// Worker count; 0 selects the available parallelism.
    #[serde(default)]
    pub jobs: usize,
    /// Build directory, relative to the project root.
    #[serde(default = "default_build_dir")]
    pub dir: String,
}

impl Default for BuildDef {
    fn default() -> Self {
        Self {
            jobs: 0,
            dir: default_build_dir(),
        }
    }
}

fn default_build_dir() -> String {
    "build".into()
}

/// `[tests]` section: defaults for the test policy.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestsDef {
    /// Record failures without aborting the build.
    #[serde(default)]
    pub permissive: bool,
    /// Skip every test.
    #[serde(default)]
    pub notests: bool,
    /// Wrapper template with one `%s` slot.
    #[serde(default)]
    pub testcmd: Option<String>,
    /// Log file path, relative to the project root. Defaults to
    /// `<build dir>/test.log`.
    #[serde(default)]
    pub log: Option<String>,
}

/// What a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A linked executable.
    #[default]
    Program,
    /// A shared library.
    Shlib,
    /// A static library.
    Stlib,
    /// Copies another target's output into a destination directory.
    Install,
}

impl TargetKind {
    /// Returns the manifest spelling of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Program => "program",
            Self::Shlib => "shlib",
            Self::Stlib => "stlib",
            Self::Install => "install",
        }
    }

    /// Returns `true` for kinds that run a link command and produce an output.
    pub fn is_link(self) -> bool {
        !matches!(self, Self::Install)
    }
}

/// One `[[target]]` entry.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDef {
    /// Unique target name.
    pub name: String,
    /// Output kind.
    #[serde(default)]
    pub kind: TargetKind,
    /// Link command argv, with `{output}`, `{inputs}` and `{root}` placeholders.
    #[serde(default)]
    pub command: Vec<String>,
    /// Input files or directories, relative to the project root.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output path, relative to the project root. Required for link kinds.
    #[serde(default)]
    pub output: Option<String>,
    /// Names of targets that must complete first.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Capability tags; `"test"` marks the output as a test executable.
    #[serde(default)]
    pub features: Vec<String>,
    /// Scheduling group; defaults to [`DEFAULT_GROUP`].
    #[serde(default)]
    pub group: Option<String>,
    /// Install kind only: target whose output is copied.
    #[serde(default)]
    pub source: Option<String>,
    /// Install kind only: destination directory, relative to the project root.
    #[serde(default)]
    pub dest: Option<String>,
    /// Per-artifact test overrides.
    #[serde(default)]
    pub test: Option<TestOverridesDef>,
}

impl TargetDef {
    /// Returns `true` if the target carries the test feature tag.
    pub fn is_test(&self) -> bool {
        self.features.iter().any(|f| f == TEST_FEATURE)
    }

    /// Scheduling group name.
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }
}

/// `[target.test]` overrides.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestOverridesDef {
    /// Replaces the default `[artifact]` invocation.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Working directory, relative to the project root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Command run in the test's working directory before the test starts.
    #[serde(default)]
    pub pre_run: Option<Vec<String>>,
}

/// Parse a manifest from TOML text.
pub fn parse_manifest(text: &str) -> anyhow::Result<BuildModel> {
    Ok(toml::from_str(text)?)
}
