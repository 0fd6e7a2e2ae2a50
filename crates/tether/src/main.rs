//! `tether`: a local SOCKS5/HTTP proxy that reaches the network through a
//! phone's SOCKS5 proxy over an `adb forward` tunnel.
//!
//! Logging goes to stderr. `-v` raises the level, and `TETHER_LOG` takes an
//! `EnvFilter` directive such as `tether_relay=debug` that overrides it.
//! Failures exit with a sysexits-style status, see [`CliError::exit_code`].

mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if let Err(e) = dispatch(cli).await {
        tracing::debug!(error = ?e, code = e.exit_code(), "tether exiting");
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check => commands::check::check(cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
    }
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("TETHER_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
