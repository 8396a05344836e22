//! Console verbosity.
//!
//! Test verdicts for failures, errors and the closing summary are always
//! printed. Everything else is gated on a process-wide level:
//!
//! | level   | flag | adds                                                  |
//! |---------|------|-------------------------------------------------------|
//! | Quiet   | `-q` | nothing                                               |
//! | Default |      | `Linking`/`Installing` lines, passed tests            |
//! | Verbose | `-v` | skipped steps and tests, stale reasons, timings       |

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Console verbosity level. Higher levels print more.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// `-q`.
    Quiet = 0,
    /// No flag.
    Default = 1,
    /// `-v`.
    Verbose = 2,
}

impl Verbosity {
    /// Level selected by the `-q`/`-v` flags. clap rejects both at once;
    /// quiet wins if a caller passes both anyway.
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, true) => Self::Verbose,
            (false, false) => Self::Default,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Quiet,
            2 => Self::Verbose,
            _ => Self::Default,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Verbosity::Default as u8);

/// Set the level from the command-line flags.
pub fn init(quiet: bool, verbose: bool) {
    LEVEL.store(Verbosity::from_flags(quiet, verbose) as u8, Ordering::Relaxed);
}

/// Current level.
pub fn verbosity() -> Verbosity {
    Verbosity::from_raw(LEVEL.load(Ordering::Relaxed))
}

/// Whether output tagged with `level` should be printed.
pub fn enabled(level: Verbosity) -> bool {
    verbosity() >= level
}

/// Shorthand for `enabled(Verbosity::Verbose)`.
pub fn is_verbose() -> bool {
    enabled(Verbosity::Verbose)
}

/// `println!` at [`Verbosity::Verbose`].
#[macro_export]
macro_rules! vprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::enabled($crate::verbose::Verbosity::Verbose) {
            println!($($arg)*);
        }
    };
}

/// `println!` at [`Verbosity::Default`]; silent under `-q`.
#[macro_export]
macro_rules! dprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::enabled($crate::verbose::Verbosity::Default) {
            println!($($arg)*);
        }
    };
}

/// Prints `  <label>: <elapsed>` when dropped, in verbose mode only.
pub struct Timer {
    label: &'static str,
    start: Instant,
}

impl Timer {
    /// Start timing `label`.
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if is_verbose() {
            println!("  {}: {:.1?}", self.label, self.start.elapsed());
        }
    }
}
