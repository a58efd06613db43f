//! `-v` and `-q` flags for the fetcher.
//!
//! Warnings are shown by default.
//! - `-q` only shows errors, `-qq` silences logging
//! - `-v` shows info
//! - `-vv` shows debug, which includes route and connection decisions
//! - `-vvv` shows trace

use log::LevelFilter;

#[derive(clap::Args, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// Pass many times for more log output
    ///
    /// By default, warnings and errors are logged. Passing `-v` one time also
    /// prints info messages, `-vv` enables debug logging, and `-vvv` trace.
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet",
    )]
    verbose: u8,

    /// Less output per occurrence
    #[arg(
        long,
        short = 'q',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "verbose",
    )]
    quiet: u8,
}

impl Verbosity {
    /// Get the log level filter.
    pub(crate) const fn log_level_filter(self) -> LevelFilter {
        level_filter(self.verbosity())
    }

    #[allow(clippy::cast_possible_wrap)]
    const fn verbosity(self) -> i8 {
        level_value(LevelFilter::Warn) - (self.quiet as i8) + (self.verbose as i8)
    }
}

const fn level_value(level: LevelFilter) -> i8 {
    match level {
        LevelFilter::Off => -1,
        LevelFilter::Error => 0,
        LevelFilter::Warn => 1,
        LevelFilter::Info => 2,
        LevelFilter::Debug => 3,
        LevelFilter::Trace => 4,
    }
}

const fn level_filter(verbosity: i8) -> LevelFilter {
    match verbosity {
        i8::MIN..=-1 => LevelFilter::Off,
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
