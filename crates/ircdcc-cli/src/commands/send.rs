//! Send command implementation.
//!
//! Queues an upload, prints the DCC SEND offer and waits for the peer's
//! answers on stdin.

use anyhow::{bail, Result};

use super::session::{with_own_ip, Outcome, Output, Session, CONNECTION};
use super::{ConflictChoice, SendArgs};
use crate::ui::format_size;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let mut config = with_own_ip(super::load_config(), args.own_ip);
    if args.passive {
        config.transfer.passive_send = true;
    }
    if args.acked {
        config.transfer.fast_send = false;
    }

    let output = Output {
        quiet: args.quiet,
        json: args.json,
    };
    let mut session = Session::new(config, ConflictChoice::Default, output);

    let id = session.manager.new_upload();
    if let Some(upload) = session.manager.upload_mut(id) {
        upload.info_mut().set_connection_id(CONNECTION);
        upload.info_mut().set_partner_nick(&args.nick);
        upload.set_file_path(args.file.clone());
    }

    if !session.manager.queue(id) {
        let reason = session
            .take_finished(id)
            .map_or_else(|| "validation failed".to_string(), |s| s.status_detail);
        bail!("Cannot offer {}: {}", args.file.display(), reason);
    }

    if !args.quiet && !args.json {
        if let Some(info) = session.manager.upload(id).map(|u| u.info()) {
            eprintln!();
            eprintln!("  ircdcc v{}", ircdcc_core::VERSION);
            eprintln!("  {}", "-".repeat(37));
            eprintln!(
                "  Offering {} ({}) to {}{}",
                info.file_name(),
                format_size(info.file_size()),
                args.nick,
                if info.is_reverse() { " [passive]" } else { "" }
            );
            eprintln!("  Relay the line below to {}, then paste the replies here.", args.nick);
            eprintln!();
        }
    }

    session.manager.start(id);

    match session.run(Some(id), &args.nick, false).await? {
        Outcome::Finished(snapshot) => session.report(&snapshot),
        Outcome::Cancelled | Outcome::Interrupted => {
            eprintln!("  Transfer cancelled.");
            Ok(())
        }
    }
}
