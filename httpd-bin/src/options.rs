use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use clap::builder::TypedValueParser;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use httpd_lib::HttpdConfig;

use crate::verbosity::Verbosity;

pub(crate) const HTTPD_CONFIG_FILE: &str = "httpd.toml";

const HELP_MSG_CONFIG_FILE: &str = "Configuration file to use

Engine settings in TOML: timeouts, protocols, connection specs, pool and
dispatcher limits, proxy and credentials. Flags given on the command line
take precedence.

[default: httpd.toml]";

/// Parse a single header into a [`HeaderName`] and [`HeaderValue`]
///
/// Headers are expected to be in format `Header-Name: Header-Value`.
/// The header name and value are trimmed of whitespace.
///
/// # Errors
///
/// This fails if the header does not contain a `:` character or if the name
/// or value are not valid in HTTP.
fn parse_single_header(header: &str) -> Result<(HeaderName, HeaderValue)> {
    let Some((name, value)) = header.split_once(':') else {
        return Err(anyhow!(
            "Invalid header format. Expected colon-separated string in the format 'HeaderName: HeaderValue'"
        ));
    };
    let name = name.trim();
    let name = HeaderName::from_str(name)
        .map_err(|e| anyhow!("Unable to convert header name '{name}': {e}"))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| anyhow!("Unable to read value of header with name '{name}': {e}"))?;
    Ok((name, value))
}

/// Parses a single `--header` argument
#[derive(Clone, Debug)]
struct HeaderParser;

impl TypedValueParser for HeaderParser {
    type Value = (HeaderName, HeaderValue);

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> Result<Self::Value, clap::Error> {
        let header = value.to_str().ok_or_else(|| {
            clap::Error::raw(
                clap::error::ErrorKind::InvalidValue,
                "Header contains invalid UTF-8",
            )
        })?;
        parse_single_header(header)
            .map_err(|e| clap::Error::raw(clap::error::ErrorKind::InvalidValue, e.to_string()))
    }
}

/// httpd fetches URLs concurrently through a pooled, multiplexed HTTP/1.1
/// and HTTP/2 client engine and prints the final status of each.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct HttpdOptions {
    /// URLs to fetch
    #[arg(name = "urls", required = true)]
    pub(crate) urls: Vec<String>,

    /// Configuration file to use
    #[arg(short, long = "config")]
    #[arg(help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,
}

/// Settings given on the command line
#[derive(Parser, Debug, Clone)]
pub(crate) struct Config {
    /// Verbose program output
    #[clap(flatten)]
    pub(crate) verbose: Verbosity,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    pub(crate) method: Method,

    /// Custom request header, as `Name: Value`. May be repeated.
    #[arg(short = 'H', long = "header", value_parser = HeaderParser)]
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,

    /// Bound of each whole call, e.g. `10s` or `1m 30s`
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub(crate) timeout: Option<Duration>,

    /// Maximum number of redirects and other follow-up requests per call
    #[arg(short, long)]
    pub(crate) max_redirects: Option<usize>,

    /// Maximum number of calls running at once
    #[arg(long)]
    pub(crate) max_concurrency: Option<usize>,

    /// Maximum number of calls to one host running at once
    #[arg(long)]
    pub(crate) max_concurrency_per_host: Option<usize>,

    /// Report redirects instead of following them
    #[arg(long)]
    pub(crate) no_follow_redirects: bool,
}

impl Config {
    /// Overlay the command line settings on engine settings from a file
    pub(crate) fn merge(&self, engine: &mut HttpdConfig) {
        if let Some(timeout) = self.timeout {
            engine.call_timeout = timeout;
        }
        if let Some(max_redirects) = self.max_redirects {
            engine.max_redirects = max_redirects;
        }
        if let Some(max_requests) = self.max_concurrency {
            engine.max_requests = max_requests;
        }
        if let Some(max_requests_per_host) = self.max_concurrency_per_host {
            engine.max_requests_per_host = max_requests_per_host;
        }
        if self.no_follow_redirects {
            engine.follow_redirects = false;
        }
    }

    /// The headers to send with every request
    pub(crate) fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        headers
    }
}

impl HttpdOptions {
    /// Engine settings from the configuration file, if any, with the command
    /// line settings merged in.
    ///
    /// An explicitly given file must exist; the default file is only read if
    /// it is present in the working directory.
    pub(crate) fn engine_config(&self) -> Result<HttpdConfig> {
        let mut engine = match &self.config_file {
            Some(path) => load_from_file(path).with_context(|| {
                format!("Cannot load configuration file `{}`", path.display())
            })?,
            None => {
                let default_config = PathBuf::from(HTTPD_CONFIG_FILE);
                if default_config.is_file() {
                    load_from_file(&default_config).with_context(|| {
                        format!(
                            "Cannot load default configuration file `{}`",
                            default_config.display()
                        )
                    })?
                } else {
                    HttpdConfig::default()
                }
            }
        };
        self.config.merge(&mut engine);
        Ok(engine)
    }
}

fn load_from_file(path: &Path) -> Result<HttpdConfig> {
    HttpdConfig::load(path).context("Failed to parse configuration file")
}
