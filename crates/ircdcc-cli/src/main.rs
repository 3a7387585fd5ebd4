//! ircdcc CLI - drive DCC file transfers from a terminal
//!
//! The CLI has no IRC connection of its own. DCC requests it wants to send
//! are printed as CTCP lines for you (or a script) to relay through an IRC
//! client, and requests from the peer are read back from stdin.
//!
//! ## Quick Start
//!
//! ```bash
//! # Offer a file to alice, then paste her answers into stdin
//! ircdcc send ./report.pdf --nick alice
//!
//! # Accept an offer by pasting the DCC SEND line
//! ircdcc get --nick bob
//!
//! # Chat with alice; once connected, stdin lines are sent to her
//! ircdcc chat --nick alice
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.silent);

    match cli.command {
        Command::Send(args) => commands::send::run(args).await,
        Command::Get(args) => commands::get::run(args).await,
        Command::Chat(args) => commands::chat::run(args).await,
        Command::Parse(args) => commands::parse::run(&args),
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging(verbose: u8, silent: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = match (silent, verbose) {
        (true, _) => "error",
        (false, 0) => "warn,ircdcc=info,ircdcc_core=info",
        (false, 1) => "warn,ircdcc=debug,ircdcc_core=debug",
        (false, _) => "warn,ircdcc=trace,ircdcc_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}
