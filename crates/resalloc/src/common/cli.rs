use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::allocation::request::ResourceRequest;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to a configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "RESALLOC_CONFIG",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: Option<PathBuf>,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "RESALLOC_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::RESALLOC_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Start a worker process
    Worker(WorkerStartOpts),
    /// Allocate a worker for a resource request
    Allocate(AllocateOpts),
    /// Show how each allocator rates a resource request
    Rate(RateOpts),
}

#[derive(Parser)]
pub struct WorkerStartOpts {
    /// Name of the worker
    #[arg(long)]
    pub name: String,
}

#[derive(Parser)]
pub struct RequestOpts {
    /// Constraint of the request in the form `<key>=<value>`.
    /// Set-valued keys take a comma separated list.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub assignments: Vec<String>,

    /// Path to a JSON or TOML (`.toml` extension) file with the request
    #[arg(long, value_hint = clap::ValueHint::FilePath, conflicts_with = "assignments")]
    pub request_file: Option<PathBuf>,
}

impl RequestOpts {
    pub fn load_request(&self) -> crate::Result<ResourceRequest> {
        match &self.request_file {
            Some(path) => load_request_file(path),
            None => ResourceRequest::from_assignments(&self.assignments),
        }
    }
}

fn load_request_file(path: &Path) -> crate::Result<ResourceRequest> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => ResourceRequest::from_toml(&content),
        _ => ResourceRequest::from_json(&content),
    }
}

#[derive(Parser)]
pub struct AllocateOpts {
    #[clap(flatten)]
    pub request: RequestOpts,

    /// Keep the worker running until Ctrl-C is pressed
    #[arg(long)]
    pub hold: bool,

    /// Stop waiting for free capacity after this duration (e.g. `30s`, `5m`)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

#[derive(Parser)]
pub struct RateOpts {
    #[clap(flatten)]
    pub request: RequestOpts,
}
