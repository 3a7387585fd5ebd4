//! DCC chat sessions.
//!
//! A chat is negotiated like a file offer, with `DCC CHAT chat` in place of
//! `DCC SEND`, and then carries newline-terminated text lines in both
//! directions until either side closes the socket.
//!
//! ## Lifecycle
//!
//! ```text
//! Configuring -> Queued -> WaitingRemote | Connecting
//!             -> Chatting -> Closed | Failed | Aborted
//! ```
//!
//! Either side may listen. A self-opened active chat listens and offers its
//! port; a passive one offers port 0 with a token and connects once the
//! partner answers with its own listening address. Chats share the id space
//! of the [`TransferManager`](crate::manager::TransferManager) that owns them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;

use crate::common;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::host::ServerLink;
use crate::io::{DataSocket, Deadline, IoDriver, IoEventKind, Listener, TaskGuard};
use crate::manager::ReverseTokens;
use crate::protocol::DccMessage;
use crate::transfer::{ConnectionId, TransferId};

/// A received line longer than this is handed out without its terminator.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Chat status, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    /// Fields are being filled in
    Configuring,
    /// Validated; an incoming offer waits here for accept or reject
    Queued,
    /// Waiting for the partner to answer or connect
    WaitingRemote,
    /// Opening the connection
    Connecting,
    /// Connected and exchanging lines
    Chatting,
    /// Ended by either side after connecting
    Closed,
    /// Ended with an error
    Failed,
    /// Cancelled or rejected locally before connecting
    Aborted,
}

impl ChatStatus {
    /// Closed, Failed or Aborted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Aborted)
    }

    /// Lowercase name for display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuring => "configuring",
            Self::Queued => "queued",
            Self::WaitingRemote => "waiting",
            Self::Connecting => "connecting",
            Self::Chatting => "chatting",
            Self::Closed => "closed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications about chats, published through
/// [`TransferEvent::Chat`](crate::manager::TransferEvent::Chat).
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A chat was registered
    Added {
        /// New chat
        id: TransferId,
        /// Whether we offered it
        self_opened: bool,
    },
    /// A chat changed status
    StatusChanged {
        /// Chat that moved
        id: TransferId,
        /// Status before
        old: ChatStatus,
        /// Status after
        new: ChatStatus,
        /// Status detail after the change
        detail: String,
    },
    /// The partner sent a line
    Line {
        /// Chat it arrived on
        id: TransferId,
        /// Line text without its terminator
        text: String,
    },
    /// A chat reached a terminal status and was removed
    Finished(ChatSnapshot),
}

/// Immutable copy of a chat's fields.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSnapshot {
    /// Handle of the chat
    pub id: TransferId,
    /// Status when the snapshot was taken
    pub status: ChatStatus,
    /// Detail for that status
    pub status_detail: String,
    /// Failure classification, when failed
    pub failure_kind: Option<ErrorKind>,
    /// IRC connection
    pub connection_id: Option<ConnectionId>,
    /// Partner nick
    pub partner_nick: String,
    /// Partner address
    pub partner_ip: Option<IpAddr>,
    /// Partner port
    pub partner_port: u16,
    /// Our address
    pub own_ip: Option<IpAddr>,
    /// Our port
    pub own_port: u16,
    /// We offered the chat
    pub self_opened: bool,
    /// Passive negotiation
    pub reverse: bool,
    /// Passive token
    pub reverse_token: Option<String>,
    /// Connected at
    pub connected_at: Option<DateTime<Utc>>,
    /// Finished at
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything a chat may touch while it handles one call or event.
pub(crate) struct ChatCtx<'a> {
    pub id: TransferId,
    pub config: &'a Config,
    pub io: &'a IoDriver,
    pub server: &'a mut dyn ServerLink,
    pub tokens: &'a ReverseTokens,
    pub events: &'a mut Vec<ChatEvent>,
}

impl ChatCtx<'_> {
    fn own_ip(&self, connection: Option<ConnectionId>) -> Option<IpAddr> {
        common::resolve_own_ip(&self.config.network, &*self.server, connection)
    }

    fn send_dcc(&mut self, chat: &DccChat, message: &DccMessage) -> Result<()> {
        let connection = chat
            .connection_id
            .ok_or(Error::MissingField("No IRC connection was given"))?;
        tracing::debug!(chat_id = %self.id, nick = %chat.partner_nick, %message, "sending DCC request");
        self.server.send_dcc(connection, &chat.partner_nick, message)
    }

    fn listen(&self, own_ip: IpAddr) -> Result<Listener> {
        let range = self.config.chat.listen_range(&self.config.network);
        self.io.listen(self.id, Some(own_ip), range)
    }
}

/// One DCC chat, offered by us or by the partner.
#[derive(Debug)]
pub struct DccChat {
    id: TransferId,
    status: ChatStatus,
    status_detail: String,
    failure: Option<ErrorKind>,
    connection_id: Option<ConnectionId>,
    partner_nick: String,
    partner_ip: Option<IpAddr>,
    partner_port: u16,
    own_ip: Option<IpAddr>,
    own_port: u16,
    self_opened: bool,
    reverse: bool,
    reverse_token: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    listener: Option<Listener>,
    connector: Option<TaskGuard>,
    socket: Option<DataSocket>,
    /// Received bytes not yet terminated by a newline
    pending: Vec<u8>,
    deadline: Deadline,
}

impl DccChat {
    pub(crate) fn new(id: TransferId, self_opened: bool) -> Self {
        Self {
            id,
            status: ChatStatus::Configuring,
            status_detail: String::new(),
            failure: None,
            connection_id: None,
            partner_nick: String::new(),
            partner_ip: None,
            partner_port: 0,
            own_ip: None,
            own_port: 0,
            self_opened,
            reverse: false,
            reverse_token: None,
            connected_at: None,
            finished_at: None,
            listener: None,
            connector: None,
            socket: None,
            pending: Vec::new(),
            deadline: Deadline::default(),
        }
    }

    /// Handle inside the manager.
    pub const fn id(&self) -> TransferId {
        self.id
    }

    /// Current status.
    pub const fn status(&self) -> ChatStatus {
        self.status
    }

    /// Human-readable detail for the current status.
    pub fn status_detail(&self) -> &str {
        &self.status_detail
    }

    /// Failure classification, once failed.
    pub const fn failure(&self) -> Option<ErrorKind> {
        self.failure
    }

    /// IRC connection the chat was negotiated on.
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Partner nick.
    pub fn partner_nick(&self) -> &str {
        &self.partner_nick
    }

    /// Partner address.
    pub const fn partner_ip(&self) -> Option<IpAddr> {
        self.partner_ip
    }

    /// Partner port.
    pub const fn partner_port(&self) -> u16 {
        self.partner_port
    }

    /// Our announced address.
    pub const fn own_ip(&self) -> Option<IpAddr> {
        self.own_ip
    }

    /// Our listening or connected port.
    pub const fn own_port(&self) -> u16 {
        self.own_port
    }

    /// Whether we offered the chat.
    pub const fn is_self_opened(&self) -> bool {
        self.self_opened
    }

    /// Whether the listening side is the one that received the offer.
    pub const fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Passive negotiation token.
    pub fn reverse_token(&self) -> Option<&str> {
        self.reverse_token.as_deref()
    }

    /// Sets the IRC connection.
    pub fn set_connection_id(&mut self, connection: ConnectionId) -> bool {
        self.configure(|chat| chat.connection_id = Some(connection))
    }

    /// Sets the partner nick.
    pub fn set_partner_nick(&mut self, nick: &str) -> bool {
        self.configure(|chat| chat.partner_nick = nick.to_string())
    }

    /// Sets the address the partner listens on.
    pub fn set_partner_ip(&mut self, ip: IpAddr) -> bool {
        self.configure(|chat| chat.partner_ip = Some(ip))
    }

    /// Sets the port the partner listens on.
    pub fn set_partner_port(&mut self, port: u16) -> bool {
        self.configure(|chat| chat.partner_port = port)
    }

    /// Overrides the address announced to the partner.
    pub fn set_own_ip(&mut self, ip: IpAddr) -> bool {
        self.configure(|chat| chat.own_ip = Some(ip))
    }

    /// Chooses a passive negotiation. An incoming passive offer carries the
    /// partner's token.
    pub fn set_reverse(&mut self, reverse: bool, token: Option<String>) -> bool {
        self.configure(|chat| {
            chat.reverse = reverse;
            chat.reverse_token = token;
        })
    }

    fn configure(&mut self, apply: impl FnOnce(&mut Self)) -> bool {
        if self.status != ChatStatus::Configuring {
            return false;
        }
        apply(self);
        true
    }

    /// Immutable copy of the current fields.
    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            id: self.id,
            status: self.status,
            status_detail: self.status_detail.clone(),
            failure_kind: self.failure,
            connection_id: self.connection_id,
            partner_nick: self.partner_nick.clone(),
            partner_ip: self.partner_ip,
            partner_port: self.partner_port,
            own_ip: self.own_ip,
            own_port: self.own_port,
            self_opened: self.self_opened,
            reverse: self.reverse,
            reverse_token: self.reverse_token.clone(),
            connected_at: self.connected_at,
            finished_at: self.finished_at,
        }
    }

    /// Validates the fields and moves to `Queued`.
    pub(crate) fn queue(&mut self, ctx: &mut ChatCtx<'_>) -> bool {
        if self.status != ChatStatus::Configuring {
            return false;
        }
        if let Err(e) = self.check_fields() {
            self.fail(ctx, e);
            return false;
        }
        self.set_status(ctx, ChatStatus::Queued, "");
        true
    }

    fn check_fields(&self) -> Result<()> {
        if self.connection_id.is_none() {
            return Err(Error::MissingField("No IRC connection was given"));
        }
        if self.partner_nick.is_empty() {
            return Err(Error::MissingField("No partner nick was given"));
        }
        if !self.self_opened {
            if self.reverse && self.reverse_token.is_none() {
                return Err(Error::MissingField("No reverse token was given"));
            }
            if !self.reverse && (self.partner_ip.is_none() || self.partner_port == 0) {
                return Err(Error::MissingField("No partner address was given"));
            }
        }
        Ok(())
    }

    /// Leaves `Queued`: offers the chat, or accepts the partner's offer.
    pub(crate) fn start(&mut self, ctx: &mut ChatCtx<'_>) {
        if self.status != ChatStatus::Queued {
            return;
        }
        if !self.self_opened && !self.reverse {
            if let Some(ip) = self.partner_ip {
                self.connect_to(ctx, ip, self.partner_port);
            }
            return;
        }

        if self.own_ip.is_none() {
            self.own_ip = ctx.own_ip(self.connection_id);
        }
        let Some(own_ip) = self.own_ip else {
            self.fail(ctx, Error::NoOwnAddress);
            return;
        };

        if self.self_opened && self.reverse {
            let token = ctx.tokens.next().to_string();
            self.reverse_token = Some(token.clone());
            self.set_status(
                ctx,
                ChatStatus::WaitingRemote,
                "Awaiting acceptance by remote user...",
            );
            self.deadline
                .arm(ctx.io, ctx.id, ctx.config.transfer.send_timeout);
            self.offer(ctx, own_ip, 0, Some(token));
            return;
        }

        let listener = match ctx.listen(own_ip) {
            Ok(listener) => listener,
            Err(e) => {
                self.fail(ctx, e);
                return;
            }
        };
        let port = listener.port;
        self.listener = Some(listener);
        self.own_port = port;

        let detail = format!(
            "Offering DCC Chat connection to {} on port {port}...",
            self.partner_nick
        );
        self.set_status(ctx, ChatStatus::WaitingRemote, detail);
        if self.self_opened {
            self.deadline
                .arm(ctx.io, ctx.id, ctx.config.transfer.send_timeout);
            self.offer(ctx, own_ip, port, None);
        } else {
            self.deadline
                .arm(ctx.io, ctx.id, ctx.config.transfer.negotiation_timeout);
            let token = self.reverse_token.clone();
            self.offer(ctx, own_ip, port, token);
        }
    }

    fn offer(&mut self, ctx: &mut ChatCtx<'_>, own_ip: IpAddr, port: u16, token: Option<String>) {
        let message = DccMessage::Chat {
            address: own_ip,
            port,
            token,
        };
        if let Err(e) = ctx.send_dcc(self, &message) {
            tracing::debug!(chat_id = %ctx.id, error = %e, "could not send chat request");
            self.fail(ctx, Error::ServerUnavailable("the DCC CHAT request"));
        }
    }

    /// Turns down an incoming offer and tells the partner.
    pub(crate) fn reject_offer(&mut self, ctx: &mut ChatCtx<'_>) -> bool {
        if self.self_opened || self.status != ChatStatus::Queued {
            return false;
        }
        if let Err(e) = ctx.send_dcc(self, &DccMessage::RejectChat) {
            tracing::debug!(chat_id = %ctx.id, error = %e, "could not send REJECT");
        }
        self.clean_up();
        self.set_status(ctx, ChatStatus::Aborted, "You rejected the DCC Chat offer.");
        true
    }

    /// The partner turned our offer down.
    pub(crate) fn rejected(&mut self, ctx: &mut ChatCtx<'_>) {
        self.fail(ctx, Error::Rejected("Chat"));
    }

    /// The partner answered our passive offer and listens at `ip:port`.
    pub(crate) fn connect_to_partner(&mut self, ctx: &mut ChatCtx<'_>, ip: IpAddr, port: u16) {
        if self.status != ChatStatus::WaitingRemote || !self.self_opened || !self.reverse {
            return;
        }
        self.connect_to(ctx, ip, port);
    }

    fn connect_to(&mut self, ctx: &mut ChatCtx<'_>, ip: IpAddr, port: u16) {
        self.partner_ip = Some(ip);
        self.partner_port = port;
        let detail = format!(
            "Establishing DCC Chat connection to {} ({ip}:{port})...",
            self.partner_nick
        );
        self.set_status(ctx, ChatStatus::Connecting, detail);
        self.deadline
            .arm(ctx.io, ctx.id, ctx.config.transfer.negotiation_timeout);

        let addr = SocketAddr::new(ip, port);
        tracing::debug!(chat_id = %ctx.id, %addr, "connecting to chat partner");
        self.connector = Some(ctx.io.connect(ctx.id, addr));
    }

    /// Queues `text` plus a newline on the socket. Only while chatting.
    pub(crate) fn send_line(&mut self, text: &str) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };
        if self.status != ChatStatus::Chatting {
            return false;
        }
        let mut line = text.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
        line.push(b'\n');
        socket.send(line);
        true
    }

    /// Ends the chat locally: `Closed` once connected, `Aborted` before.
    pub(crate) fn close(&mut self, ctx: &mut ChatCtx<'_>) {
        if self.status.is_terminal() {
            return;
        }
        let status = if self.status == ChatStatus::Chatting {
            ChatStatus::Closed
        } else {
            ChatStatus::Aborted
        };
        self.clean_up();
        self.set_status(ctx, status, "");
    }

    pub(crate) fn on_io(&mut self, ctx: &mut ChatCtx<'_>, event: IoEventKind) {
        match event {
            IoEventKind::Accepted(stream) if self.listener.is_some() => {
                self.established(ctx, stream);
            }
            IoEventKind::Connected(stream) if self.connector.is_some() => {
                self.established(ctx, stream);
            }
            IoEventKind::AcceptFailed(reason) | IoEventKind::ConnectFailed(reason)
                if self.socket.is_none() =>
            {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Received(data) if self.socket.is_some() => self.read_lines(ctx, &data),
            IoEventKind::Closed if self.socket.is_some() => {
                let rest = std::mem::take(&mut self.pending);
                self.emit_line(ctx, &rest);
                self.clean_up();
                self.set_status(ctx, ChatStatus::Closed, "Connection closed.");
            }
            IoEventKind::SocketError(reason) if self.socket.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::TimedOut(generation) => {
                if self.deadline.expired(generation) {
                    self.fail(ctx, Error::Timeout);
                }
            }
            other => tracing::trace!(chat_id = %ctx.id, ?other, "ignoring stale event"),
        }
    }

    fn established(&mut self, ctx: &mut ChatCtx<'_>, stream: TcpStream) {
        self.deadline.stop();
        self.listener = None;
        self.connector = None;

        if let Ok(local) = stream.local_addr() {
            self.own_port = local.port();
        }
        if let Ok(peer) = stream.peer_addr() {
            self.partner_ip = Some(peer.ip());
            self.partner_port = peer.port();
        }
        self.socket = Some(ctx.io.attach_chat(ctx.id, stream));

        let detail = format!("Established DCC Chat connection to {}.", self.partner_nick);
        self.set_status(ctx, ChatStatus::Chatting, detail);
        tracing::info!(chat_id = %ctx.id, nick = %self.partner_nick, "chat connected");
    }

    fn read_lines(&mut self, ctx: &mut ChatCtx<'_>, data: &[u8]) {
        if self.status != ChatStatus::Chatting {
            return;
        }
        self.pending.extend_from_slice(data);
        while let Some(at) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=at).collect();
            self.emit_line(ctx, &line[..at]);
        }
        if self.pending.len() > MAX_LINE_LENGTH {
            let line = std::mem::take(&mut self.pending);
            self.emit_line(ctx, &line);
        }
    }

    fn emit_line(&self, ctx: &mut ChatCtx<'_>, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            return;
        }
        ctx.events.push(ChatEvent::Line {
            id: self.id,
            text: text.to_string(),
        });
    }

    /// Ends the chat with an error. Ignored once terminal.
    pub(crate) fn fail(&mut self, ctx: &mut ChatCtx<'_>, error: Error) {
        if self.status.is_terminal() {
            return;
        }
        tracing::warn!(chat_id = %ctx.id, nick = %self.partner_nick, error = %error, "chat failed");
        self.clean_up();
        self.failure = Some(error.kind());
        self.set_status(ctx, ChatStatus::Failed, error.to_string());
    }

    fn clean_up(&mut self) {
        self.deadline.stop();
        self.listener = None;
        self.connector = None;
        self.socket = None;
        self.pending.clear();
    }

    fn set_status(&mut self, ctx: &mut ChatCtx<'_>, status: ChatStatus, detail: impl Into<String>) {
        let old = self.status;
        self.status_detail = detail.into();
        if old == status {
            return;
        }
        debug_assert!(status > old, "backward transition {old} -> {status}");
        self.status = status;
        match status {
            ChatStatus::Chatting => self.connected_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }

        tracing::debug!(
            chat_id = %self.id,
            nick = %self.partner_nick,
            %old,
            new = %status,
            detail = %self.status_detail,
            "chat status changed"
        );
        ctx.events.push(ChatEvent::StatusChanged {
            id: self.id,
            old,
            new: status,
            detail: self.status_detail.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recording(Vec<DccMessage>);

    impl ServerLink for Recording {
        fn send_dcc(&mut self, _: ConnectionId, _: &str, message: &DccMessage) -> Result<()> {
            self.0.push(message.clone());
            Ok(())
        }
    }

    fn lines(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Line { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_status_order() {
        assert!(ChatStatus::Queued < ChatStatus::WaitingRemote);
        assert!(ChatStatus::Connecting < ChatStatus::Chatting);
        assert!(ChatStatus::Closed.is_terminal());
        assert!(!ChatStatus::Chatting.is_terminal());
    }

    #[test]
    fn test_setters_locked_after_configuring() {
        let mut chat = DccChat::new(TransferId::new(1), true);
        assert!(chat.set_partner_nick("alice"));
        chat.status = ChatStatus::Queued;
        assert!(!chat.set_partner_nick("bob"));
        assert!(!chat.set_reverse(true, None));
        assert_eq!(chat.partner_nick(), "alice");
    }

    #[test]
    fn test_incoming_offer_needs_address() {
        let mut chat = DccChat::new(TransferId::new(1), false);
        chat.set_connection_id(1);
        chat.set_partner_nick("alice");
        assert!(matches!(chat.check_fields(), Err(Error::MissingField(_))));

        chat.set_partner_ip(IpAddr::from([127, 0, 0, 1]));
        chat.set_partner_port(7000);
        assert!(chat.check_fields().is_ok());

        let mut reverse = DccChat::new(TransferId::new(2), false);
        reverse.set_connection_id(1);
        reverse.set_partner_nick("alice");
        reverse.set_reverse(true, None);
        assert!(reverse.check_fields().is_err());
    }

    #[tokio::test]
    async fn test_lines_are_split_and_trimmed() {
        let config = Config::default();
        let (io, _rx) = IoDriver::channel(8, false);
        let mut server = Recording::default();
        let tokens = ReverseTokens::default();
        let mut events = Vec::new();
        let mut ctx = ChatCtx {
            id: TransferId::new(1),
            config: &config,
            io: &io,
            server: &mut server,
            tokens: &tokens,
            events: &mut events,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut far = client.expect("connect");
        let (near, _) = accepted.expect("accept");

        let mut chat = DccChat::new(TransferId::new(1), true);
        chat.set_partner_nick("alice");
        chat.status = ChatStatus::WaitingRemote;
        chat.listener = Some(ctx.listen(IpAddr::from([127, 0, 0, 1])).expect("listen"));
        chat.on_io(&mut ctx, IoEventKind::Accepted(near));
        assert_eq!(chat.status(), ChatStatus::Chatting);
        assert_eq!(chat.status_detail(), "Established DCC Chat connection to alice.");

        chat.on_io(&mut ctx, IoEventKind::Received(b"hello\r\nwor".to_vec()));
        chat.on_io(&mut ctx, IoEventKind::Received(b"ld\n\n".to_vec()));
        chat.on_io(&mut ctx, IoEventKind::Received(b"tail".to_vec()));
        chat.on_io(&mut ctx, IoEventKind::Closed);

        assert_eq!(lines(ctx.events.as_slice()), vec!["hello", "world", "tail"]);
        assert_eq!(chat.status(), ChatStatus::Closed);
        assert_eq!(chat.status_detail(), "Connection closed.");
        assert!(!chat.send_line("late"));
        far.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_overlong_line_is_flushed() {
        let config = Config::default();
        let (io, _rx) = IoDriver::channel(8, false);
        let mut server = Recording::default();
        let tokens = ReverseTokens::default();
        let mut events = Vec::new();
        let mut ctx = ChatCtx {
            id: TransferId::new(1),
            config: &config,
            io: &io,
            server: &mut server,
            tokens: &tokens,
            events: &mut events,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _far = client.expect("connect");
        let (near, _) = accepted.expect("accept");

        let mut chat = DccChat::new(TransferId::new(1), false);
        chat.status = ChatStatus::Connecting;
        chat.connector = Some(io.connect(TransferId::new(1), addr));
        chat.on_io(&mut ctx, IoEventKind::Connected(near));

        chat.on_io(&mut ctx, IoEventKind::Received(vec![b'x'; MAX_LINE_LENGTH + 1]));
        let got = lines(ctx.events.as_slice());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), MAX_LINE_LENGTH + 1);
        assert!(chat.pending.is_empty());
    }

    #[tokio::test]
    async fn test_reject_offer_sends_reject() {
        let config = Config::default();
        let (io, _rx) = IoDriver::channel(8, false);
        let mut server = Recording::default();
        let tokens = ReverseTokens::default();
        let mut events = Vec::new();
        let mut chat = DccChat::new(TransferId::new(1), false);
        chat.set_connection_id(1);
        chat.set_partner_nick("alice");
        chat.set_partner_ip(IpAddr::from([127, 0, 0, 1]));
        chat.set_partner_port(7000);

        {
            let mut ctx = ChatCtx {
                id: TransferId::new(1),
                config: &config,
                io: &io,
                server: &mut server,
                tokens: &tokens,
                events: &mut events,
            };
            assert!(chat.queue(&mut ctx));
            assert!(chat.reject_offer(&mut ctx));
            assert!(!chat.reject_offer(&mut ctx));
        }

        assert_eq!(server.0, vec![DccMessage::RejectChat]);
        assert_eq!(chat.status(), ChatStatus::Aborted);
        assert_eq!(chat.status_detail(), "You rejected the DCC Chat offer.");
    }
}
