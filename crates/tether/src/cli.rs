use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "tether",
    about = "Route a desktop browser through a phone's proxy over a USB tunnel"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay and keep it running until Ctrl-C
    Run(RunArgs),
    /// Check that the relay can start and the tunnel is reachable
    Check,
    /// Manage tether configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Port the browser connects to
    #[arg(long, value_name = "PORT")]
    pub listen_port: Option<u16>,

    /// Local end of the forwarded tunnel
    #[arg(long, value_name = "PORT")]
    pub tunnel_port: Option<u16>,

    /// Proxy port on the phone (used when forwarding with --device)
    #[arg(long, value_name = "PORT")]
    pub remote_port: Option<u16>,

    /// Protocol offered to the browser
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolArg>,

    /// Forward the tunnel port to this device with adb before starting
    #[arg(long, value_name = "SERIAL")]
    pub device: Option<String>,

    /// Send a SOCKS5 method greeting to the phone before each CONNECT
    #[arg(long)]
    pub negotiate: bool,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolArg {
    Socks5,
    Http,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
