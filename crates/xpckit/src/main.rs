mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "xpckit", version, about = "Typed IPC messaging CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true, env = "XPCKIT_FORMAT")]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        global = true,
        env = "XPCKIT_LOG_FORMAT"
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        global = true,
        env = "XPCKIT_LOG_LEVEL"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "xpckit",
            "send",
            "com.example.echo",
            "capitalize",
            "--json",
            "\"hi\"",
            "--timeout",
            "2s",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.service, "com.example.echo");
        assert_eq!(args.message, "capitalize");
        assert_eq!(args.json.as_deref(), Some("\"hi\""));
        assert!(!args.oneway);
    }

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "xpckit",
            "--log-level",
            "error",
            "serve",
            "com.example.echo",
            "--requirement",
            "anchor self",
            "--pause-unit-ms",
            "10",
        ])
        .expect("serve args should parse");

        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.requirement.as_deref(), Some("anchor self"));
        assert_eq!(args.pause_unit_ms, 10);
        assert!(!args.privileged);
    }

    #[test]
    fn serve_requires_a_name() {
        let err = Cli::try_parse_from(["xpckit", "serve"]).expect_err("name is required");
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["xpckit", "version", "--format", "json"])
            .expect("global flag after subcommand should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
    }
}
