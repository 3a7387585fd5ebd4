//! Terminal driver for a [`TransferManager`].
//!
//! Outgoing DCC requests are printed to stdout as IRC lines, ready to be
//! relayed by an IRC client. Replies from the peer are read from stdin,
//! either as raw IRC lines or in the short `nick DCC ...` form. Once a chat
//! is connected, stdin lines are chat text instead.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use ircdcc_core::chat::{ChatEvent, ChatSnapshot, ChatStatus};
use ircdcc_core::config::Config;
use ircdcc_core::host::{
    Collaborators, ResumeAction, ResumeDecision, ResumeQuestion, ResumeResolver, ServerLink,
};
use ircdcc_core::io::IoEvent;
use ircdcc_core::manager::{TransferEvent, TransferManager};
use ircdcc_core::protocol::{DccMessage, SendKind};
use ircdcc_core::transfer::{ConnectionId, TransferId, TransferSnapshot, TransferStatus};

use super::ConflictChoice;
use crate::ui;

/// The CLI drives exactly one IRC connection.
pub const CONNECTION: ConnectionId = 1;

/// Prints DCC requests as IRC lines.
struct StdioServer;

impl ServerLink for StdioServer {
    fn send_dcc(
        &mut self,
        _connection: ConnectionId,
        nick: &str,
        message: &DccMessage,
    ) -> ircdcc_core::Result<()> {
        println!("{}", irc_line(nick, message));
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// Forwards questions to the session loop.
struct ChannelResolver(mpsc::UnboundedSender<ResumeQuestion>);

impl ResumeResolver for ChannelResolver {
    fn ask(&mut self, question: ResumeQuestion) {
        if self.0.send(question).is_err() {
            tracing::warn!("conflict question dropped, session is closing");
        }
    }
}

/// Output flags shared by the commands.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub quiet: bool,
    pub json: bool,
}

/// A manager plus the channels the terminal loop drains.
pub struct Session {
    pub manager: TransferManager,
    io_events: mpsc::Receiver<IoEvent>,
    updates: mpsc::UnboundedReceiver<TransferEvent>,
    questions: mpsc::UnboundedReceiver<ResumeQuestion>,
    on_conflict: ConflictChoice,
    output: Output,
}

/// Why [`Session::run`] returned.
pub enum Outcome {
    /// The tracked transfer finished
    Finished(TransferSnapshot),
    /// A conflict was answered with Cancel
    Cancelled,
    /// stdin closed or ctrl-c
    Interrupted,
}

/// Which DCC requests a session handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Files,
    Chat,
}

impl Session {
    pub fn new(config: Config, on_conflict: ConflictChoice, output: Output) -> Self {
        let policy = config.policy.clone();
        let (questions_tx, questions) = mpsc::unbounded_channel();
        let collaborators = Collaborators {
            server: Box::new(StdioServer),
            resolver: Box::new(ChannelResolver(questions_tx)),
            authorizer: Box::new(policy),
        };
        let (mut manager, io_events) = TransferManager::new(config, collaborators);
        let updates = manager.subscribe();
        Self {
            manager,
            io_events,
            updates,
            questions,
            on_conflict,
            output,
        }
    }

    /// Runs until the tracked transfer finishes.
    ///
    /// With `tracked` unset, the first offer read from stdin becomes the
    /// tracked transfer (only when `accept_offers` is set).
    pub async fn run(
        &mut self,
        mut tracked: Option<TransferId>,
        nick: &str,
        accept_offers: bool,
    ) -> Result<Outcome> {
        let mut ticks = tokio::time::interval(self.manager.config().transfer.speed_sample_interval);
        let mut report = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                Some(event) = self.io_events.recv() => self.manager.handle_io(event),
                _ = ticks.tick() => self.manager.sample_meters(Instant::now()),
                _ = report.tick() => {
                    if let Some(id) = tracked {
                        self.show_progress(id);
                    }
                }
                Some(question) = self.questions.recv() => {
                    if !self.answer(&question) && Some(question.transfer) == tracked {
                        return Ok(Outcome::Cancelled);
                    }
                }
                Some(update) = self.updates.recv() => {
                    if let Some(snapshot) = self.on_update(update, tracked) {
                        return Ok(Outcome::Finished(snapshot));
                    }
                }
                line = lines.next_line(), if stdin_open => {
                    match line.context("Failed to read stdin")? {
                        Some(line) => {
                            if let Some(id) = self.on_line(&line, accept_offers && tracked.is_none(), Expect::Files) {
                                tracked.get_or_insert(id);
                            }
                        }
                        None => {
                            stdin_open = false;
                            if tracked.is_none() {
                                return Ok(Outcome::Interrupted);
                            }
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(%nick, "interrupted");
                    self.manager.abort_all();
                    return Ok(Outcome::Interrupted);
                }
            }
        }
    }

    /// Runs a chat until it ends. Before it connects, stdin carries DCC
    /// replies; afterwards every line is sent to the partner. Closing stdin
    /// closes the chat.
    ///
    /// With `tracked` unset, the first chat offer read from stdin is tracked.
    pub async fn run_chat(&mut self, mut tracked: Option<TransferId>) -> Result<Option<ChatSnapshot>> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                Some(event) = self.io_events.recv() => self.manager.handle_io(event),
                Some(update) = self.updates.recv() => {
                    if let Some(snapshot) = self.on_chat_update(update, tracked) {
                        return Ok(Some(snapshot));
                    }
                }
                line = lines.next_line(), if stdin_open => {
                    match line.context("Failed to read stdin")? {
                        Some(line) => match tracked {
                            Some(id) if self.manager.chat(id).is_some_and(|c| c.status() == ChatStatus::Chatting) => {
                                self.manager.send_chat_line(id, &line);
                            }
                            _ => {
                                if let Some(id) = self.on_line(&line, tracked.is_none(), Expect::Chat) {
                                    tracked.get_or_insert(id);
                                }
                            }
                        },
                        None => {
                            stdin_open = false;
                            match tracked {
                                Some(id) => self.manager.close_chat(id),
                                None => return Ok(None),
                            }
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    self.manager.abort_all();
                    return Ok(None);
                }
            }
        }
    }

    /// Drains pending updates and returns the final snapshot of `id`, if
    /// it already finished.
    pub fn take_finished(&mut self, id: TransferId) -> Option<TransferSnapshot> {
        let mut found = None;
        while let Ok(update) = self.updates.try_recv() {
            if let TransferEvent::Finished(snapshot) = update {
                if snapshot.id == id {
                    found = Some(snapshot);
                }
            }
        }
        found
    }

    fn on_line(&mut self, line: &str, accept_offers: bool, expect: Expect) -> Option<TransferId> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (nick, message) = match parse_inbound(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("  Ignoring input: {e:#}");
                return None;
            }
        };
        let is_chat = matches!(message, DccMessage::Chat { .. } | DccMessage::RejectChat);
        if is_chat != (expect == Expect::Chat) {
            eprintln!(
                "  Ignoring DCC {} from {nick}: not handled by this command",
                message.command()
            );
            return None;
        }
        if is_offer(&message) && !accept_offers {
            eprintln!("  Ignoring offer from {nick}: not accepting offers here");
            return None;
        }
        match self.manager.handle_message(CONNECTION, &nick, &message) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, %nick, "DCC request not handled");
                if let Some(hint) = e.suggestion() {
                    eprintln!("  {hint}");
                }
                None
            }
        }
    }

    /// Applies the configured conflict answer. Returns false on Cancel.
    fn answer(&mut self, question: &ResumeQuestion) -> bool {
        let wanted = match self.on_conflict {
            ConflictChoice::Default => question.default,
            ConflictChoice::Resume => ResumeAction::Resume,
            ConflictChoice::Overwrite => ResumeAction::Overwrite,
            ConflictChoice::Rename => ResumeAction::Rename,
            ConflictChoice::Cancel => ResumeAction::Cancel,
        };
        let action = if question.enabled.contains(&wanted) {
            wanted
        } else {
            question.default
        };

        if !self.output.quiet {
            eprintln!("  {} ({})", question.message, question.path.display());
        }
        let decision = match action {
            ResumeAction::Resume => ResumeDecision::Resume,
            ResumeAction::Overwrite => ResumeDecision::Overwrite,
            ResumeAction::Rename => ResumeDecision::Rename(free_path(&question.path)),
            ResumeAction::Cancel => ResumeDecision::Cancel,
        };
        if !self.output.quiet {
            eprintln!("  Answering: {action:?}");
        }
        let cancelled = decision == ResumeDecision::Cancel;
        if !self.manager.resolve_conflict(question.transfer, decision) {
            tracing::warn!(transfer_id = %question.transfer, "conflict answer was not accepted");
        }
        !cancelled
    }

    fn on_update(
        &mut self,
        update: TransferEvent,
        tracked: Option<TransferId>,
    ) -> Option<TransferSnapshot> {
        match update {
            TransferEvent::StatusChanged(change) => {
                if Some(change.id) == tracked && !self.output.quiet && !change.new.is_terminal() {
                    eprintln!("\n  {}: {}", change.new, change.detail);
                }
                None
            }
            TransferEvent::Finished(snapshot) if Some(snapshot.id) == tracked => Some(snapshot),
            TransferEvent::Finished(snapshot) => {
                tracing::info!(transfer_id = %snapshot.id, status = %snapshot.status, "transfer finished");
                None
            }
            TransferEvent::Added { .. } | TransferEvent::Queued { .. } | TransferEvent::Chat(_) => {
                None
            }
        }
    }

    fn on_chat_update(
        &self,
        update: TransferEvent,
        tracked: Option<TransferId>,
    ) -> Option<ChatSnapshot> {
        let TransferEvent::Chat(event) = update else {
            return None;
        };
        match event {
            ChatEvent::Line { id, text } if Some(id) == tracked => {
                let nick = self
                    .manager
                    .chat(id)
                    .map(|c| c.partner_nick().to_string())
                    .unwrap_or_default();
                println!("<{nick}> {text}");
                let _ = std::io::stdout().flush();
                None
            }
            ChatEvent::StatusChanged { id, new, detail, .. } if Some(id) == tracked => {
                if !self.output.quiet && !new.is_terminal() && !detail.is_empty() {
                    eprintln!("  {new}: {detail}");
                }
                None
            }
            ChatEvent::Finished(snapshot) if Some(snapshot.id) == tracked => Some(snapshot),
            ChatEvent::Finished(snapshot) => {
                tracing::info!(chat_id = %snapshot.id, status = %snapshot.status, "chat finished");
                None
            }
            ChatEvent::Added { .. } | ChatEvent::Line { .. } | ChatEvent::StatusChanged { .. } => {
                None
            }
        }
    }

    fn show_progress(&self, id: TransferId) {
        if self.output.quiet {
            return;
        }
        let Some(transfer) = self.manager.get(id) else {
            return;
        };
        let info = transfer.info();
        if info.status() != TransferStatus::Transferring {
            return;
        }
        let snapshot = info.snapshot();
        if self.output.json {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::debug!(error = %e, "could not encode progress"),
            }
        } else {
            eprint!("\r{}    ", ui::progress_line(&snapshot));
            let _ = std::io::stderr().flush();
        }
    }

    /// Prints how a chat ended and maps failure to an error.
    pub fn report_chat(&self, snapshot: &ChatSnapshot) -> Result<()> {
        if !self.output.quiet {
            match snapshot.status {
                ChatStatus::Closed => eprintln!("  Chat with {} closed.", snapshot.partner_nick),
                _ => eprintln!("  Chat {}: {}", snapshot.status, snapshot.status_detail),
            }
        }
        if snapshot.status == ChatStatus::Closed {
            Ok(())
        } else {
            bail!("{}", snapshot.status_detail)
        }
    }

    /// Prints the final result and maps failure to an error.
    pub fn report(&self, snapshot: &TransferSnapshot) -> Result<()> {
        if self.output.json {
            println!("{}", serde_json::to_string_pretty(snapshot)?);
        } else if !self.output.quiet {
            eprintln!();
            match snapshot.status {
                TransferStatus::Done => {
                    eprintln!(
                        "  Transfer complete: {} ({})",
                        snapshot.file_name,
                        ui::format_size(snapshot.file_size)
                    );
                    if let Some(path) = &snapshot.file_path {
                        eprintln!("  Saved to {}", path.display());
                    }
                }
                _ => eprintln!("  Transfer {}: {}", snapshot.status, snapshot.status_detail),
            }
            eprintln!();
        }

        if snapshot.status == TransferStatus::Done {
            Ok(())
        } else {
            bail!("{}", snapshot.status_detail)
        }
    }
}

/// Whether `message` opens a new download or chat, as opposed to answering
/// one of ours.
fn is_offer(message: &DccMessage) -> bool {
    match message {
        DccMessage::Send { .. } => message.send_kind() != Some(SendKind::ReverseAck),
        DccMessage::Chat { port, token, .. } => token.is_none() || *port == 0,
        _ => false,
    }
}

/// Formats an outgoing DCC request as an IRC line.
///
/// REJECT answers an offer, so it travels as a CTCP reply (NOTICE).
pub fn irc_line(nick: &str, message: &DccMessage) -> String {
    let verb = if matches!(message, DccMessage::Reject { .. } | DccMessage::RejectChat) {
        "NOTICE"
    } else {
        "PRIVMSG"
    };
    format!("{verb} {nick} :\u{1}{message}\u{1}")
}

/// Reads an inbound request.
///
/// Accepts `:nick!user@host PRIVMSG me :\x01DCC ...\x01` (or NOTICE) and the
/// short form `nick DCC ...`.
pub fn parse_inbound(line: &str) -> Result<(String, DccMessage)> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(':') {
        let (prefix, rest) = rest
            .split_once(' ')
            .context("IRC line has no command")?;
        let nick = prefix.split('!').next().unwrap_or(prefix);
        let (_, body) = rest
            .split_once(" :")
            .context("IRC line has no trailing parameter")?;
        let message = DccMessage::parse(body)?;
        return Ok((nick.to_string(), message));
    }

    let (nick, body) = line
        .split_once(char::is_whitespace)
        .context("expected `<nick> DCC ...`")?;
    if nick.is_empty() {
        bail!("missing nick");
    }
    Ok((nick.to_string(), DccMessage::parse(body)?))
}

/// First `name (n).ext` next to `path` that does not exist yet.
pub fn free_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Applies a command-line address override.
pub fn with_own_ip(mut config: Config, own_ip: Option<IpAddr>) -> Config {
    if own_ip.is_some() {
        config.network.own_ip = own_ip;
    }
    config
}
