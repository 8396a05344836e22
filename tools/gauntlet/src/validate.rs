//! Manifest validation.
//!
//! Checks referential integrity (dependency and install sources resolve),
//! per-kind required fields, and that the test policy defaults parse.
//! Dependency cycles are left to the scheduler, which reports them with
//! the nodes that could not be scheduled.

use std::collections::HashSet;

use anyhow::{Result, ensure};

use crate::graph::TEST_GROUP;
use crate::model::{BuildModel, TargetKind};
use crate::policy::CommandTemplate;

/// Validate a parsed manifest.
pub fn validate_model(model: &BuildModel) -> Result<()> {
    validate_project(model)?;
    validate_targets(model)?;
    validate_tests(model)?;
    Ok(())
}

fn validate_project(model: &BuildModel) -> Result<()> {
    ensure!(!model.project.name.is_empty(), "project name is required");
    ensure!(!model.build.dir.is_empty(), "build directory must not be empty");
    Ok(())
}

fn validate_targets(model: &BuildModel) -> Result<()> {
    let mut seen = HashSet::new();
    for target in &model.targets {
        let name = &target.name;
        ensure!(!name.is_empty(), "target with empty name");
        ensure!(seen.insert(name.as_str()), "duplicate target '{name}'");
        ensure!(
            target.group_name() != TEST_GROUP,
            "target '{name}' uses group '{TEST_GROUP}', which is reserved for test tasks"
        );
    }

    for target in &model.targets {
        let name = &target.name;
        for dep in &target.deps {
            ensure!(
                seen.contains(dep.as_str()),
                "target '{name}' depends on unknown target '{dep}'"
            );
            ensure!(dep != name, "target '{name}' depends on itself");
        }

        match target.kind {
            TargetKind::Install => {
                let source = target.source.as_deref().unwrap_or_default();
                ensure!(!source.is_empty(), "install target '{name}' has no source");
                ensure!(
                    seen.contains(source),
                    "install target '{name}' copies unknown target '{source}'"
                );
                ensure!(
                    target.dest.as_deref().is_some_and(|d| !d.is_empty()),
                    "install target '{name}' has no dest"
                );
                ensure!(
                    !target.is_test(),
                    "install target '{name}' cannot be a test"
                );
            }
            kind => {
                ensure!(
                    target.output.as_deref().is_some_and(|o| !o.is_empty()),
                    "{} target '{name}' has no output",
                    kind.as_str()
                );
                ensure!(
                    !target.command.is_empty(),
                    "{} target '{name}' has no command",
                    kind.as_str()
                );
                ensure!(
                    target.source.is_none() && target.dest.is_none(),
                    "target '{name}' sets source/dest but is not an install target"
                );
                ensure!(
                    !target.is_test() || kind == TargetKind::Program,
                    "{} target '{name}' cannot be a test, only programs are run",
                    kind.as_str()
                );
            }
        }

        if let Some(ref overrides) = target.test {
            ensure!(
                target.is_test(),
                "target '{name}' has test overrides but no \"test\" feature"
            );
            if let Some(ref args) = overrides.args {
                ensure!(!args.is_empty(), "target '{name}' has empty test args");
            }
            if let Some(ref pre_run) = overrides.pre_run {
                ensure!(!pre_run.is_empty(), "target '{name}' has empty pre_run command");
            }
        }
    }

    Ok(())
}

fn validate_tests(model: &BuildModel) -> Result<()> {
    if let Some(ref template) = model.tests.testcmd {
        CommandTemplate::parse(template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TargetDef, TestOverridesDef};

    fn minimal_model() -> BuildModel {
        let mut model = BuildModel::default();
        model.project.name = "demo".into();
        model
    }

    fn program(name: &str) -> TargetDef {
        TargetDef {
            name: name.into(),
            kind: TargetKind::Program,
            command: vec!["cc".into(), "-o".into(), "{output}".into()],
            output: Some(format!("build/{name}")),
            ..Default::default()
        }
    }

    #[test]
    fn valid_minimal_model_passes() {
        validate_model(&minimal_model()).expect("minimal model should pass validation");
    }

    #[test]
    fn missing_project_name_fails() {
        let mut model = minimal_model();
        model.project.name.clear();
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("project name is required"), "unexpected error: {err}");
    }

    #[test]
    fn duplicate_target_fails() {
        let mut model = minimal_model();
        model.targets.push(program("app"));
        model.targets.push(program("app"));
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("duplicate target 'app'"), "unexpected error: {err}");
    }

    #[test]
    fn test_group_is_reserved() {
        let mut model = minimal_model();
        model.targets.push(TargetDef {
            group: Some(TEST_GROUP.into()),
            ..program("early_lib")
        });
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("reserved for test tasks"), "unexpected error: {err}");
    }

    #[test]
    fn unknown_dependency_fails() {
        let mut model = minimal_model();
        let mut app = program("app");
        app.deps.push("missing".into());
        model.targets.push(app);
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("unknown target 'missing'"), "unexpected error: {err}");
    }

    #[test]
    fn link_target_without_output_fails() {
        let mut model = minimal_model();
        let mut app = program("app");
        app.output = None;
        model.targets.push(app);
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("has no output"), "unexpected error: {err}");
    }

    #[test]
    fn install_requires_known_source_and_dest() {
        let mut model = minimal_model();
        model.targets.push(TargetDef {
            name: "install-app".into(),
            kind: TargetKind::Install,
            source: Some("app".into()),
            dest: Some("dist".into()),
            ..Default::default()
        });
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("unknown target 'app'"), "unexpected error: {err}");

        model.targets.insert(0, program("app"));
        model.targets[1].dest = None;
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("has no dest"), "unexpected error: {err}");
    }

    #[test]
    fn overrides_without_test_feature_fail() {
        let mut model = minimal_model();
        let mut app = program("app");
        app.test = Some(TestOverridesDef {
            cwd: Some("data".into()),
            ..Default::default()
        });
        model.targets.push(app);
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("no \"test\" feature"), "unexpected error: {err}");
    }

    #[test]
    fn libraries_cannot_be_tests() {
        let mut model = minimal_model();
        let mut lib = program("util");
        lib.kind = TargetKind::Shlib;
        lib.features.push("test".into());
        model.targets.push(lib);
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("shlib target 'util' cannot be a test"), "unexpected error: {err}");
    }

    #[test]
    fn malformed_testcmd_fails() {
        let mut model = minimal_model();
        model.tests.testcmd = Some("valgrind".into());
        let err = validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("invalid test command template"), "unexpected error: {err}");
    }
}
