//! One build invocation: graph construction, test registration, execution.

use std::time::Instant;

use anyhow::{Context, Result};

use crate::cache::CacheManifest;
use crate::config::ResolvedConfig;
use crate::env::EnvironmentComposer;
use crate::graph::BuildGraph;
use crate::hook::register_tests;
use crate::log::BuildLog;
use crate::model::BuildModel;
use crate::report::{Reporter, SummaryCounts};
use crate::scheduler::{self, BuildState};

/// Everything a build invocation shares across worker threads.
///
/// The environment snapshot, log sink and test summary live here for the
/// duration of one build and are dropped with it.
pub struct BuildContext {
    /// Resolved configuration and test policy.
    pub config: ResolvedConfig,
    /// Composes the test environment once per build.
    pub environment: EnvironmentComposer,
    /// Status lines, diagnostics and the test summary.
    pub reporter: Reporter,
}

impl BuildContext {
    /// A context reading the real process environment.
    pub fn new(config: ResolvedConfig) -> Self {
        Self::with_environment(config, EnvironmentComposer::new())
    }

    /// A context with an injected environment composer.
    pub fn with_environment(config: ResolvedConfig, environment: EnvironmentComposer) -> Self {
        let reporter = Reporter::new(BuildLog::new(&config.log_path));
        Self {
            config,
            environment,
            reporter,
        }
    }
}

/// Totals of a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Steps executed.
    pub built: usize,
    /// Steps skipped as up to date.
    pub up_to_date: usize,
    /// Test counts.
    pub tests: SummaryCounts,
}

/// Run a full build of `model`.
///
/// The cache is saved and the test summary printed even when the build
/// fails, so the next invocation still sees what did complete.
pub fn run_build(config: ResolvedConfig, model: &BuildModel) -> Result<BuildReport> {
    let start = Instant::now();

    let mut graph = BuildGraph::from_model(model, &config.root)?;
    let attached = register_tests(&mut graph)?;
    crate::vprintln!("  {} node(s), {attached} test(s)", graph.len());

    let cache = CacheManifest::load_or_new(&config.build_dir);
    let mut state = BuildState::new(cache);
    let ctx = BuildContext::new(config);

    let result = {
        let _t = crate::verbose::Timer::start("graph execution");
        scheduler::execute(&graph, &ctx, &mut state)
    };

    let saved = state
        .cache
        .save(&ctx.config.build_dir)
        .context("failed to save cache manifest");
    ctx.reporter.print_summary();
    print_timings(&mut state);
    result?;
    saved?;

    let report = BuildReport {
        built: state.built,
        up_to_date: state.up_to_date,
        tests: ctx.reporter.summary().counts(),
    };
    crate::dprintln!(
        "\nBuild complete: {} built, {} up to date ({:.1?})",
        report.built,
        report.up_to_date,
        start.elapsed()
    );
    Ok(report)
}

fn print_timings(state: &mut BuildState) {
    if state.timings.is_empty() || !crate::verbose::is_verbose() {
        return;
    }
    state.timings.sort_by(|a, b| b.1.cmp(&a.1));
    crate::vprintln!("\n  Slowest steps:");
    for (name, duration) in state.timings.iter().take(5) {
        crate::vprintln!("    {name:<24} {duration:.1?}");
    }
}
