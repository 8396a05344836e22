//! gauntlet command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;

use gauntlet::cli::{self, Cli};
use gauntlet::config::{self, ResolvedConfig};
use gauntlet::graph::{BuildGraph, NodeKind};
use gauntlet::hook::register_tests;
use gauntlet::model::BuildModel;
use gauntlet::{pipeline, validate, verbose};

fn main() -> Result<()> {
    let cli = Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    match cli.command {
        cli::Command::Build(_) => cmd_build(&cli),
        cli::Command::Configure => cmd_configure(&cli),
        cli::Command::Clean => cmd_clean(&cli),
    }
}

/// Load, validate and resolve the project around the current directory.
fn resolve_config(cli: &Cli) -> Result<(ResolvedConfig, BuildModel)> {
    let root = config::find_project_root(cli.manifest_path.as_deref())?;
    let model = config::load_model(&root)?;
    validate::validate_model(&model)?;
    let resolved = config::resolve(&model, &root, &cli.overrides())?;
    Ok((resolved, model))
}

fn cmd_build(cli: &Cli) -> Result<()> {
    let (resolved, model) = resolve_config(cli)?;
    gauntlet::dprintln!("Building {}...", model.project.name);
    pipeline::run_build(resolved, &model)?;
    Ok(())
}

/// Print the resolved configuration and the scheduled graph.
fn cmd_configure(cli: &Cli) -> Result<()> {
    let (resolved, model) = resolve_config(cli)?;
    config::print_resolved(&resolved);

    let mut graph = BuildGraph::from_model(&model, &resolved.root)?;
    register_tests(&mut graph)?;

    println!("\nSchedule:");
    for group in graph.schedule_order() {
        let group = &graph.groups()[group];
        println!("  [{}]", group.name);
        for &id in &group.nodes {
            let node = graph.node(id);
            let kind = match node.kind {
                NodeKind::Link(ref step) => step.kind.as_str(),
                NodeKind::Install(_) => "install",
                NodeKind::Test(_) => "test",
            };
            println!("    {:<24} {kind}", node.name);
        }
    }

    println!("\nConfiguration resolved successfully.");
    Ok(())
}

fn cmd_clean(cli: &Cli) -> Result<()> {
    let (resolved, _model) = resolve_config(cli)?;
    let build_dir = &resolved.build_dir;
    if build_dir.exists() {
        std::fs::remove_dir_all(build_dir)
            .with_context(|| format!("failed to remove {}", build_dir.display()))?;
        println!("Removed {}", build_dir.display());
    } else {
        println!("Nothing to clean.");
    }
    Ok(())
}
