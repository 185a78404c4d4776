use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the demo service under a name.
    Serve(ServeArgs),
    /// Send one message to a service and print the reply.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Service name to register.
    pub name: String,
    /// Code signing requirement clients must satisfy.
    #[arg(long, value_name = "REQUIREMENT")]
    pub requirement: Option<String>,
    /// Register in the privileged namespace.
    #[arg(long)]
    pub privileged: bool,
    /// Length of one `pause` second, in milliseconds.
    #[arg(long, value_name = "MS", default_value = "1000")]
    pub pause_unit_ms: u64,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Service name to connect to.
    pub service: String,
    /// Message name.
    pub message: String,
    /// JSON payload. Defaults to null.
    #[arg(long)]
    pub json: Option<String>,
    /// Send without waiting for a reply.
    #[arg(long)]
    pub oneway: bool,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Code signing requirement the service must satisfy.
    #[arg(long, value_name = "REQUIREMENT")]
    pub requirement: Option<String>,
    /// Look the service up in the privileged namespace.
    #[arg(long)]
    pub privileged: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Multi-threaded runtime for one command.
pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
