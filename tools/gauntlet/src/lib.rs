//! Build-pipeline test orchestrator.
//!
//! gauntlet reads a `gauntlet.toml` manifest, runs the link and install
//! steps it declares, and then runs every produced executable that is marked
//! as a test. Tests are scheduled in a dedicated group after all other steps,
//! share one environment that puts every linked artifact's directory on the
//! loader search path, and are reported as `passed` / `FAIL` as they finish.
//!
//! Pipeline: load manifest → validate → resolve config → lower into a build
//! graph → register tests → schedule groups → report.

pub mod cache;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod graph;
pub mod hook;
pub mod log;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod report;
pub mod scheduler;
pub mod step;
pub mod task;
pub mod validate;
pub mod verbose;
