//! Parse command implementation.

use anyhow::{Context, Result};

use ircdcc_core::protocol::{DccMessage, SendKind};

use super::ParseArgs;

/// Decode a DCC request and print it as JSON.
pub fn run(args: &ParseArgs) -> Result<()> {
    let message = DccMessage::parse(&args.line)
        .with_context(|| format!("Not a DCC request: {}", args.line))?;

    let kind = message.send_kind().map(|kind| match kind {
        SendKind::Active => "active",
        SendKind::Passive => "passive",
        SendKind::ReverseAck => "reverse_ack",
    });

    let output = serde_json::json!({
        "command": message.command(),
        "send_kind": kind,
        "message": message,
        "canonical": message.to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
