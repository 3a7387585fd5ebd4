//! Get command implementation.
//!
//! Waits for a DCC SEND offer on stdin and downloads it.

use anyhow::Result;

use super::session::{with_own_ip, Outcome, Output, Session};
use super::GetArgs;

/// Run the get command.
pub async fn run(args: GetArgs) -> Result<()> {
    let mut config = with_own_ip(super::load_config(), args.own_ip);
    config.transfer.auto_accept = true;

    let output = Output {
        quiet: args.quiet,
        json: args.json,
    };
    let mut session = Session::new(config, args.on_conflict, output);
    if let Some(folder) = args.output.clone() {
        session.manager.set_default_incoming_folder(folder);
    }

    if !args.quiet && !args.json {
        eprintln!();
        eprintln!("  ircdcc v{}", ircdcc_core::VERSION);
        eprintln!("  {}", "-".repeat(37));
        eprintln!(
            "  Saving to {}",
            session.manager.config().general.download_root().display()
        );
        eprintln!("  Paste the DCC SEND offer (`<nick> DCC SEND ...` or a raw IRC line):");
        eprintln!();
    }

    match session.run(None, &args.nick, true).await? {
        Outcome::Finished(snapshot) => session.report(&snapshot),
        Outcome::Cancelled => {
            eprintln!("  Download cancelled.");
            Ok(())
        }
        Outcome::Interrupted => {
            eprintln!("  No transfer completed.");
            Ok(())
        }
    }
}
