//! Group-ordered DAG scheduler.
//!
//! Groups run one after another in [`BuildGraph::schedule_order`]. Inside a
//! group, nodes form a DAG over their intra-group dependencies and run on a
//! bounded worker pool. The main thread owns the cache: it performs the
//! up-to-date checks, decides which nodes need a worker, and records results.
//!
//! Dispatch is capped at the worker count, so no job is ever queued behind a
//! busy worker. When a node fails, the nodes not yet dispatched never start;
//! jobs already running finish before the error is returned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, mpsc};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::cache::{CacheManifest, FreshResult, StepEntry, hash_args};
use crate::error::TestError;
use crate::graph::{BuildGraph, NodeId, NodeKind};
use crate::pipeline::BuildContext;
use crate::step::InstallStep;
use crate::task::{TaskStatus, TestOutcome, TestStatus};

/// State accumulated during graph execution.
pub struct BuildState {
    /// Up-to-date records, loaded before and saved after the build.
    pub cache: CacheManifest,
    /// Targets whose step ran in this build.
    pub rebuilt: HashSet<String>,
    /// Link and install steps executed.
    pub built: usize,
    /// Link and install steps skipped as up to date.
    pub up_to_date: usize,
    /// Slowest steps and tests, for the timing summary.
    pub timings: Vec<(String, Duration)>,
}

impl BuildState {
    /// Fresh state around a loaded cache.
    pub fn new(cache: CacheManifest) -> Self {
        Self {
            cache,
            rebuilt: HashSet::new(),
            built: 0,
            up_to_date: 0,
            timings: Vec::new(),
        }
    }
}

/// A job dispatched to a worker thread.
struct Job {
    local: usize,
    node: NodeId,
    /// Cache key for link/install steps.
    hash: Option<String>,
}

/// Result sent back from a worker thread.
enum JobOutcome {
    /// A link or install step produced its output.
    Built {
        local: usize,
        hash: Option<String>,
        output: PathBuf,
        duration: Duration,
    },
    /// A test ran and was reported without aborting the build.
    Tested {
        local: usize,
        passed: bool,
        duration: Duration,
    },
    /// The node failed, or a strict test failure aborts the build.
    Error { local: usize, error: anyhow::Error },
}

/// What the main thread decided for a ready node.
enum Plan {
    /// Completed on the main thread.
    Done,
    /// Needs a worker.
    Dispatch(Job),
}

/// Execute every group of `graph` in schedule order.
pub fn execute(graph: &BuildGraph, ctx: &BuildContext, state: &mut BuildState) -> Result<()> {
    for group in graph.schedule_order() {
        let members = &graph.groups()[group].nodes;
        if members.is_empty() {
            continue;
        }
        crate::vprintln!(
            "  group '{}': {} node(s)",
            graph.groups()[group].name,
            members.len()
        );
        run_group(graph, members, ctx, state)?;
    }
    Ok(())
}

fn run_group(
    graph: &BuildGraph,
    members: &[NodeId],
    ctx: &BuildContext,
    state: &mut BuildState,
) -> Result<()> {
    let total = members.len();
    let local_of: HashMap<NodeId, usize> =
        members.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Edges inside the group only; earlier groups are already complete.
    let mut in_degree = vec![0usize; total];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
    for (local, &id) in members.iter().enumerate() {
        for dep in &graph.node(id).deps {
            if let Some(&dep_local) = local_of.get(dep) {
                in_degree[local] += 1;
                dependents[dep_local].push(local);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..total).filter(|&i| in_degree[i] == 0).collect();
    let num_workers = ctx.config.worker_count().clamp(1, total);

    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let (result_tx, result_rx) = mpsc::channel::<JobOutcome>();
    let job_rx = Mutex::new(job_rx);
    let job_rx_ref = &job_rx;

    std::thread::scope(|s| {
        for _ in 0..num_workers {
            let tx = result_tx.clone();
            s.spawn(move || {
                loop {
                    let next = job_rx_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    let Ok(job) = next else {
                        break;
                    };
                    if tx.send(run_job(graph, ctx, job)).is_err() {
                        break;
                    }
                }
            });
        }

        // Drop the cloned sender so the channel closes when workers finish.
        drop(result_tx);

        let mut completed = 0usize;
        let mut in_flight = 0usize;

        while completed < total {
            while in_flight < num_workers {
                let Some(local) = ready.pop_front() else {
                    break;
                };
                match plan(graph, members[local], local, ctx, state)? {
                    Plan::Done => {
                        completed += 1;
                        release(local, &dependents, &mut in_degree, &mut ready);
                    }
                    Plan::Dispatch(job) => {
                        if job_tx.send(job).is_err() {
                            bail!("worker threads terminated unexpectedly");
                        }
                        in_flight += 1;
                    }
                }
            }

            if in_flight == 0 {
                if completed >= total {
                    break;
                }
                if ready.is_empty() {
                    bail!(
                        "dependency cycle detected: {} of {} nodes cannot be scheduled",
                        total - completed,
                        total,
                    );
                }
                continue;
            }

            match result_rx.recv() {
                Ok(JobOutcome::Built {
                    local,
                    hash,
                    output,
                    duration,
                }) => {
                    in_flight -= 1;
                    completed += 1;
                    let id = members[local];
                    record_step(graph, id, hash, &output, state);
                    state.timings.push((graph.node(id).name.clone(), duration));
                    release(local, &dependents, &mut in_degree, &mut ready);
                }
                Ok(JobOutcome::Tested {
                    local,
                    passed,
                    duration,
                }) => {
                    in_flight -= 1;
                    completed += 1;
                    let id = members[local];
                    record_test(graph, id, passed, state);
                    state.timings.push((graph.node(id).name.clone(), duration));
                    release(local, &dependents, &mut in_degree, &mut ready);
                }
                Ok(JobOutcome::Error { local, error }) => {
                    in_flight -= 1;
                    let failed_test = error
                        .downcast_ref::<TestError>()
                        .is_some_and(TestError::is_test_failure);
                    if failed_test {
                        record_test(graph, members[local], false, state);
                    }

                    // Close the job channel and let running jobs finish.
                    drop(job_tx);
                    while in_flight > 0 {
                        if result_rx.recv().is_ok() {
                            in_flight -= 1;
                        } else {
                            break;
                        }
                    }
                    return Err(error);
                }
                Err(_) => {
                    bail!("worker threads terminated unexpectedly");
                }
            }
        }

        // Close the job channel to shut down workers.
        drop(job_tx);
        Ok(())
    })
}

/// Decide on the main thread what a ready node needs.
fn plan(
    graph: &BuildGraph,
    id: NodeId,
    local: usize,
    ctx: &BuildContext,
    state: &mut BuildState,
) -> Result<Plan> {
    let node = graph.node(id);
    let hash = match node.kind {
        NodeKind::Link(ref step) => step.command_hash(),
        NodeKind::Install(ref step) => install_hash(step),
        NodeKind::Test(ref task) => {
            let policy = &ctx.config.policy;
            let artifact = &task.artifact().path;
            let fresh = state.cache.is_test_fresh(task.name(), artifact, &state.rebuilt);
            return Ok(match task.runnable_status(policy, &fresh) {
                TaskStatus::Skip => {
                    ctx.reporter.report(TestOutcome::skipped(task.name()), policy)?;
                    Plan::Done
                }
                TaskStatus::Run => {
                    crate::vprintln!("  Testing {}...", task.name());
                    Plan::Dispatch(Job {
                        local,
                        node: id,
                        hash: None,
                    })
                }
            });
        }
    };

    if !ctx.config.force {
        let deps = graph.dep_names(id);
        if let Some(entry) = state.cache.steps.get_mut(&node.name) {
            match entry.is_fresh(&hash, &state.rebuilt, &deps) {
                FreshResult::Fresh => {
                    crate::vprintln!("  Skipping {} (unchanged)", node.name);
                    state.up_to_date += 1;
                    return Ok(Plan::Done);
                }
                FreshResult::Stale(reason) => {
                    crate::vprintln!("  stale: {} ({reason})", node.name);
                }
            }
        }
    }

    let verb = match node.kind {
        NodeKind::Install(_) => "Installing",
        _ => "Linking",
    };
    crate::dprintln!("  {verb} {}...", node.name);
    Ok(Plan::Dispatch(Job {
        local,
        node: id,
        hash: Some(hash),
    }))
}

/// Run one job on a worker thread.
fn run_job(graph: &BuildGraph, ctx: &BuildContext, job: Job) -> JobOutcome {
    let Job { local, node, hash } = job;
    let start = Instant::now();
    let built = |output: Result<PathBuf>| match output {
        Ok(output) => JobOutcome::Built {
            local,
            hash,
            output,
            duration: start.elapsed(),
        },
        Err(error) => JobOutcome::Error { local, error },
    };

    match graph.node(node).kind {
        NodeKind::Link(ref step) => built(step.run(&ctx.config.root)),
        NodeKind::Install(ref step) => built(step.run()),
        NodeKind::Test(ref task) => {
            let policy = &ctx.config.policy;
            let result = task
                .execute(policy, &ctx.environment, graph)
                .and_then(|outcome| {
                    let passed = outcome.status == TestStatus::Passed;
                    ctx.reporter.report(outcome, policy)?;
                    Ok(passed)
                });
            match result {
                Ok(passed) => JobOutcome::Tested {
                    local,
                    passed,
                    duration: start.elapsed(),
                },
                Err(error) => JobOutcome::Error { local, error },
            }
        }
    }
}

fn install_hash(step: &InstallStep) -> String {
    hash_args(&[
        "install".as_ref(),
        step.source_output.as_os_str(),
        step.dest_dir.as_os_str(),
    ])
}

fn record_step(
    graph: &BuildGraph,
    id: NodeId,
    hash: Option<String>,
    output: &Path,
    state: &mut BuildState,
) {
    let node = graph.node(id);
    let inputs = match node.kind {
        NodeKind::Link(ref step) => step.inputs.clone(),
        NodeKind::Install(ref step) => vec![step.source_output.clone()],
        NodeKind::Test(_) => return,
    };
    if let Some(hash) = hash {
        state
            .cache
            .steps
            .insert(node.name.clone(), StepEntry::from_step(hash, output, &inputs));
    }
    state.rebuilt.insert(node.name.clone());
    state.built += 1;
}

fn record_test(graph: &BuildGraph, id: NodeId, passed: bool, state: &mut BuildState) {
    if let NodeKind::Test(ref task) = graph.node(id).kind {
        state
            .cache
            .record_test(task.name(), &task.artifact().path, passed);
    }
}

fn release(
    local: usize,
    dependents: &[Vec<usize>],
    in_degree: &mut [usize],
    ready: &mut VecDeque<usize>,
) {
    for &dep in &dependents[local] {
        in_degree[dep] -= 1;
        if in_degree[dep] == 0 {
            ready.push_back(dep);
        }
    }
}
