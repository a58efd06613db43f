use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

use crate::verbosity::Verbosity;

/// Initialize the logging system with the given verbosity level.
///
/// `RUST_LOG` takes precedence over the command line flags.
pub(crate) fn init_logging(verbose: Verbosity) {
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);
    builder
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false);

    if std::env::var("RUST_LOG").is_err() {
        // Other crates, hyper included, stay at `warn`
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("httpd", verbose.log_level_filter())
            .filter_module("httpd_lib", verbose.log_level_filter());
    }

    builder.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    builder.init();
}
