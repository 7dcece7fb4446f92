//! Admin command line for the fsgate policy engine.
//!
//! Subcommands exit with 0 on success and the platform status code
//! otherwise; the first error is printed with its hex status.

#![deny(unsafe_code)]

use clap::{Parser, Subcommand};
use fsgate_core::action::{RuleMajor, RuleMinor};
use fsgate_core::config::Config;
use fsgate_core::rule::Rule;
use fsgate_core::status::OpStatus;
use fsgate_core::version::CoreVersion;
use thiserror::Error;
use tokio::net::TcpStream;
use wire::{read_frame, WireError};

mod client;
mod output;

use client::Client;
use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "fsgate", about = "Administer the fsgate file-access policy engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print admin and core versions
    Version,
    /// Make unload acceptable, then request engine unload
    Unload,
    /// Make detach acceptable, then detach from a volume
    Detach {
        #[arg(long)]
        volume: String,
    },
    /// Add a rule
    Add {
        #[arg(long = "major-type")]
        major_type: RuleMajor,
        #[arg(long = "minor-type")]
        minor_type: Option<RuleMinor>,
        #[arg(long)]
        expr: String,
    },
    /// Remove a rule by identity
    Remove {
        #[arg(long = "major-type")]
        major_type: RuleMajor,
        #[arg(long = "minor-type")]
        minor_type: Option<RuleMinor>,
        #[arg(long)]
        expr: String,
    },
    /// Print all rules
    Query {
        #[arg(long, value_enum, default_value = "list")]
        format: OutputFormat,
    },
    /// Print rules matching a path
    CheckMatched {
        #[arg(long)]
        path: String,
        #[arg(long, value_enum, default_value = "list")]
        format: OutputFormat,
    },
    /// Stream audit records until interrupted
    Monitor {
        #[arg(long, value_enum, default_value = "list")]
        format: OutputFormat,
    },
    /// Remove every rule
    Cleanup,
}

/// Admin-side failures; each carries the status reported on exit.
#[derive(Debug, Error)]
enum CliError {
    #[error("cannot reach the engine: {0}")]
    Connect(std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("engine refused the request")]
    Failed(OpStatus),
}

impl CliError {
    fn status(&self) -> OpStatus {
        match self {
            CliError::Connect(_) => OpStatus::PORT_DISCONNECTED,
            CliError::Wire(e) => e.status(),
            CliError::Failed(status) => *status,
        }
    }
}

const ADMIN_VERSION: CoreVersion = CoreVersion { major: 0, minor: 1, patch: 0, build: 0 };

#[tokio::main]
async fn main() {
    fsgate_core::logging::init();
    let cli = Cli::parse();
    let config = Config::from_env();
    match run(cli.cmd, &config).await {
        Ok(()) => {}
        Err(e) => {
            let status = e.status();
            eprintln!("error: {status} ({e})");
            // Exit with the platform status code, as the shell sees it.
            std::process::exit(status.0);
        }
    }
}

async fn run(cmd: Command, config: &Config) -> Result<(), CliError> {
    match cmd {
        Command::Version => {
            let mut client = Client::connect(&config.control_addr).await?;
            let core = client.core_version().await?;
            println!("admin version: {}", output::format_version(ADMIN_VERSION));
            println!("core version:  {}", output::format_version(core));
            Ok(())
        }
        Command::Unload => {
            let mut client = Client::connect(&config.control_addr).await?;
            client.set_unload_acceptable(true).await?;
            // The unload itself is issued by the hosting service; from here
            // the destructive path is unblocked.
            println!("unload acceptable; engine unload requested");
            Ok(())
        }
        Command::Detach { volume } => {
            let mut client = Client::connect(&config.control_addr).await?;
            client.set_detach_acceptable(true).await?;
            println!("detach acceptable; detach requested for {volume}");
            Ok(())
        }
        Command::Add { major_type, minor_type, expr } => {
            let rule = build_rule(major_type, minor_type, &expr)?;
            let mut client = Client::connect(&config.control_addr).await?;
            let added = client.add_rules(vec![rule]).await?;
            println!("{added} rule(s) added");
            Ok(())
        }
        Command::Remove { major_type, minor_type, expr } => {
            let rule = build_rule(major_type, minor_type, &expr)?;
            let mut client = Client::connect(&config.control_addr).await?;
            let removed = client.remove_rules(vec![rule]).await?;
            println!("{removed} rule(s) removed");
            Ok(())
        }
        Command::Query { format } => {
            let mut client = Client::connect(&config.control_addr).await?;
            let rules = client.query_rules().await?;
            output::print_rules(&rules, format);
            Ok(())
        }
        Command::CheckMatched { path, format } => {
            let mut client = Client::connect(&config.control_addr).await?;
            let rules = client.check_matched(&path).await?;
            output::print_rules(&rules, format);
            Ok(())
        }
        Command::Monitor { format } => monitor_stream(&config.monitor_addr, format).await,
        Command::Cleanup => {
            let mut client = Client::connect(&config.control_addr).await?;
            let removed = client.cleanup_rules().await?;
            println!("{removed} rule(s) removed");
            Ok(())
        }
    }
}

fn build_rule(
    major: RuleMajor,
    minor: Option<RuleMinor>,
    expr: &str,
) -> Result<Rule, CliError> {
    Rule::new(major, minor.unwrap_or(RuleMinor::None), expr)
        .map_err(|_| CliError::Failed(OpStatus::INVALID_PARAMETER))
}

/// Attach to the monitor channel and print records until interrupted.
async fn monitor_stream(addr: &str, format: OutputFormat) -> Result<(), CliError> {
    let mut stream = TcpStream::connect(addr).await.map_err(CliError::Connect)?;
    output::print_record_header(format);
    loop {
        tokio::select! {
            frame = read_frame(&mut stream) => match frame? {
                Some(body) => {
                    let records = wire::decode_frame(&body)?;
                    for record in &records {
                        output::print_record(record, format);
                    }
                }
                None => {
                    eprintln!("monitor channel closed by the engine");
                    return Err(CliError::Failed(OpStatus::PORT_DISCONNECTED));
                }
            },
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
    }
}
