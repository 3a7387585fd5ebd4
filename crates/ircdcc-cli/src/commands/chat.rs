//! Chat command implementation.
//!
//! Offers a DCC chat to a nick, or waits for an offer on stdin and accepts
//! it. Once connected, stdin lines go to the partner and the partner's
//! lines are printed as `<nick> text`.

use anyhow::{bail, Result};

use super::session::{with_own_ip, Output, Session, CONNECTION};
use super::{ChatArgs, ConflictChoice};

/// Run the chat command.
pub async fn run(args: ChatArgs) -> Result<()> {
    let mut config = with_own_ip(super::load_config(), args.own_ip);
    config.chat.auto_accept = args.nick.is_none();

    let output = Output {
        quiet: args.quiet,
        json: false,
    };
    let mut session = Session::new(config, ConflictChoice::Default, output);

    let tracked = match &args.nick {
        Some(nick) => {
            let Some(id) = session.manager.offer_chat(CONNECTION, nick, args.passive) else {
                bail!("Cannot offer a chat to {nick}");
            };
            if !args.quiet {
                eprintln!();
                eprintln!("  ircdcc v{}", ircdcc_core::VERSION);
                eprintln!("  {}", "-".repeat(37));
                eprintln!(
                    "  Offering a chat to {nick}{}",
                    if args.passive { " [passive]" } else { "" }
                );
                eprintln!("  Relay the line above to {nick}, then paste the replies here.");
                eprintln!();
            }
            Some(id)
        }
        None => {
            if !args.quiet {
                eprintln!("  Paste the DCC CHAT offer (`<nick> DCC CHAT ...` or a raw IRC line):");
            }
            None
        }
    };

    match session.run_chat(tracked).await? {
        Some(snapshot) => session.report_chat(&snapshot),
        None => {
            eprintln!("  No chat took place.");
            Ok(())
        }
    }
}
