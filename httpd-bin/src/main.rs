//! `httpd` fetches URLs through a pooled, multiplexed HTTP/1.1 and HTTP/2
//! client engine.
//!
//! The binary is a wrapper around httpd-lib: every URL becomes a call on the
//! engine's dispatcher, and the final status of each call is printed as it
//! completes.
//!
//! Fetch a single page:
//! ```sh
//! httpd https://example.com/
//! ```
//!
//! Fetch many pages, at most two at a time per host:
//! ```sh
//! httpd --max-concurrency-per-host 2 https://example.com/a https://example.com/b https://example.com/c
//! ```
//!
//! Send a `HEAD` request with a custom header and a deadline:
//! ```sh
//! httpd -X HEAD -H "Accept: text/html" --timeout 5s https://example.com/
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]

use anyhow::Result;
use clap::Parser;
use httpd_lib::HttpdBuilder;
use log::error;

mod fetch;
mod logging;
mod options;
mod verbosity;

use crate::logging::init_logging;
use crate::options::HttpdOptions;

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator, such as a failure to start the runtime.
    #[allow(unused)]
    UnexpectedFailure = 1,
    FetchFailure = 2,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't run destructors, so the work happens in
    // another function.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Set up the runtime and fetch every URL
fn run_main() -> Result<i32> {
    let opts = HttpdOptions::parse();
    init_logging(opts.config.verbose);

    let engine = match opts.engine_config() {
        Ok(engine) => engine,
        Err(e) => {
            error!("Error while loading config: {e:#}");
            return Ok(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(async {
        let client = match HttpdBuilder::from_config(&engine).and_then(HttpdBuilder::client) {
            Ok(client) => client,
            Err(e) => {
                error!("Invalid configuration: {e}");
                return ExitCode::ConfigFile;
            }
        };
        fetch::fetch(
            &client,
            &opts.urls,
            &opts.config.method,
            &opts.config.header_map(),
        )
        .await
    });
    Ok(exit_code as i32)
}
