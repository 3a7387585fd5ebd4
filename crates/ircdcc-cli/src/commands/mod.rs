//! CLI command definitions and handlers.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

pub mod chat;
pub mod config;
pub mod get;
pub mod parse;
pub mod send;
pub mod session;

/// Load configuration with graceful fallback to defaults.
///
/// A missing or unreadable config file is not fatal for a one-shot transfer.
pub fn load_config() -> ircdcc_core::config::Config {
    match ircdcc_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "using default configuration");
            ircdcc_core::config::Config::default()
        }
    }
}

/// ircdcc - IRC DCC file transfers
#[derive(Parser)]
#[command(name = "ircdcc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Offer a file to a nick
    Send(SendArgs),

    /// Accept an offer read from stdin
    Get(GetArgs),

    /// Offer or accept a DCC chat
    Chat(ChatArgs),

    /// Decode a DCC request line and print it as JSON
    Parse(ParseArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// How to settle a destination conflict without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConflictChoice {
    /// Take whatever the engine suggests
    Default,
    /// Continue a partial file
    Resume,
    /// Start over
    Overwrite,
    /// Save under a free name
    Rename,
    /// Give up on the download
    Cancel,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// File to offer
    pub file: PathBuf,

    /// Nick to offer it to
    #[arg(short, long)]
    pub nick: String,

    /// Let the receiver listen (passive DCC)
    #[arg(long)]
    pub passive: bool,

    /// Address to announce instead of the detected one
    #[arg(long)]
    pub own_ip: Option<IpAddr>,

    /// Wait for each acknowledgement before sending more
    #[arg(long)]
    pub acked: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the get command
#[derive(Parser)]
pub struct GetArgs {
    /// Our own nick, used in the printed replies
    #[arg(short, long, default_value = "me")]
    pub nick: String,

    /// Folder to save into
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// What to do when the destination already exists
    #[arg(long, value_enum, default_value = "default")]
    pub on_conflict: ConflictChoice,

    /// Address to announce for passive offers
    #[arg(long)]
    pub own_ip: Option<IpAddr>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the chat command
#[derive(Parser)]
pub struct ChatArgs {
    /// Nick to offer a chat to; without it, wait for an offer on stdin
    #[arg(short, long)]
    pub nick: Option<String>,

    /// Let the partner listen (passive DCC)
    #[arg(long, requires = "nick")]
    pub passive: bool,

    /// Address to announce instead of the detected one
    #[arg(long)]
    pub own_ip: Option<IpAddr>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the parse command
#[derive(Parser)]
pub struct ParseArgs {
    /// The request, e.g. `DCC SEND file.txt 3232235777 5000 1024`
    pub line: String,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config actions
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a default config file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}
