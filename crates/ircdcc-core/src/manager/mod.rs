//! Registry of live transfers and chats.
//!
//! The manager owns every transfer and chat, hands out [`TransferId`]s,
//! matches inbound DCC negotiation messages to the transfer or chat they
//! belong to, and reports status changes to subscribers. A transfer is
//! removed as soon as it reaches `Done`, `Failed` or `Aborted`; a chat once it
//! is `Closed`, `Failed` or `Aborted`.
//!
//! ## Driving the manager
//!
//! ```rust,ignore
//! let (mut manager, mut events) = TransferManager::new(config, collaborators);
//! let mut ticks = tokio::time::interval(manager.config().transfer.speed_sample_interval);
//! loop {
//!     tokio::select! {
//!         Some(event) = events.recv() => manager.handle_io(event),
//!         _ = ticks.tick() => manager.sample_meters(Instant::now()),
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::chat::{ChatCtx, ChatEvent, ChatSnapshot, ChatStatus, DccChat};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{Authorizer, Collaborators, ResumeDecision, ResumeResolver, ServerLink};
use crate::io::{IoDriver, IoEvent};
use crate::protocol::{DccMessage, SendKind};
use crate::transfer::recv::default_destination_in;
use crate::transfer::{
    ConnectionId, Ctx, DccTransfer, Direction, StatusChange, TransferId, TransferRecv,
    TransferRef, TransferSend, TransferSnapshot, TransferStatus,
};

/// Capacity of the I/O event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// First token handed out for passive offers.
const FIRST_REVERSE_TOKEN: u64 = 1001;

/// Process-lifetime counter for passive offer tokens.
#[derive(Debug)]
pub struct ReverseTokens(AtomicU64);

impl ReverseTokens {
    /// Starts counting at `first`.
    #[must_use]
    pub const fn new(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }

    /// Returns a token that was never returned before.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ReverseTokens {
    fn default() -> Self {
        Self::new(FIRST_REVERSE_TOKEN)
    }
}

/// Whether a receive that is connecting or transferring writes to `path`.
pub(crate) fn writing_to(receivers: &BTreeMap<TransferId, TransferRecv>, path: &Path) -> bool {
    receivers.values().any(|recv| {
        let info = recv.info();
        matches!(
            info.status(),
            TransferStatus::Connecting | TransferStatus::Transferring
        ) && info.file_path() == Some(path)
    })
}

/// Notifications for subscribers.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A transfer was registered
    Added {
        /// New transfer
        id: TransferId,
        /// Its direction
        direction: Direction,
    },
    /// A transfer changed status
    StatusChanged(StatusChange),
    /// A new transfer passed validation
    Queued {
        /// Queued transfer
        id: TransferId,
        /// Its direction
        direction: Direction,
    },
    /// A transfer reached a terminal status and was removed
    Finished(TransferSnapshot),
    /// Something happened to a chat
    Chat(ChatEvent),
}

/// Builds the context a transfer gets for one call.
macro_rules! ctx {
    ($self:ident, $id:expr, $changes:expr) => {
        Ctx {
            id: $id,
            config: &$self.config,
            io: &$self.io,
            server: &mut *$self.server,
            resolver: &mut *$self.resolver,
            authorizer: &*$self.authorizer,
            tokens: &$self.tokens,
            receivers: &$self.receivers,
            changes: $changes,
        }
    };
}

/// Owns and coordinates all DCC transfers of one application.
pub struct TransferManager {
    config: Config,
    io: IoDriver,
    server: Box<dyn ServerLink>,
    resolver: Box<dyn ResumeResolver>,
    authorizer: Box<dyn Authorizer>,
    receivers: BTreeMap<TransferId, TransferRecv>,
    senders: BTreeMap<TransferId, TransferSend>,
    chats: BTreeMap<TransferId, DccChat>,
    next_id: u64,
    tokens: ReverseTokens,
    default_incoming_folder: PathBuf,
    observers: Vec<mpsc::UnboundedSender<TransferEvent>>,
}

impl TransferManager {
    /// Creates a manager and the I/O event channel its owner must drain into
    /// [`TransferManager::handle_io`].
    #[must_use]
    pub fn new(config: Config, collaborators: Collaborators) -> (Self, mpsc::Receiver<IoEvent>) {
        let (io, events) = IoDriver::channel(EVENT_CHANNEL_CAPACITY, config.network.tcp_keepalive);
        let default_incoming_folder = config.general.download_root();
        let manager = Self {
            config,
            io,
            server: collaborators.server,
            resolver: collaborators.resolver,
            authorizer: collaborators.authorizer,
            receivers: BTreeMap::new(),
            senders: BTreeMap::new(),
            chats: BTreeMap::new(),
            next_id: 1,
            tokens: ReverseTokens::default(),
            default_incoming_folder,
            observers: Vec::new(),
        };
        (manager, events)
    }

    /// Active configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribes to transfer notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Registers a download in `Configuring`. Fill it in through
    /// [`TransferManager::download_mut`], then queue it.
    pub fn new_download(&mut self) -> TransferId {
        let id = self.allocate_id();
        self.receivers.insert(id, TransferRecv::new(id));
        tracing::debug!(transfer_id = %id, "download registered");
        self.publish(TransferEvent::Added {
            id,
            direction: Direction::Receive,
        });
        id
    }

    /// Registers an upload in `Configuring`. Passive by default when
    /// `transfer.passive_send` is set.
    pub fn new_upload(&mut self) -> TransferId {
        let id = self.allocate_id();
        self.senders
            .insert(id, TransferSend::new(id, self.config.transfer.passive_send));
        tracing::debug!(transfer_id = %id, "upload registered");
        self.publish(TransferEvent::Added {
            id,
            direction: Direction::Send,
        });
        id
    }

    /// A registered download.
    pub fn download(&self, id: TransferId) -> Option<&TransferRecv> {
        self.receivers.get(&id)
    }

    /// A registered download, for its setters.
    pub fn download_mut(&mut self, id: TransferId) -> Option<&mut TransferRecv> {
        self.receivers.get_mut(&id)
    }

    /// A registered upload.
    pub fn upload(&self, id: TransferId) -> Option<&TransferSend> {
        self.senders.get(&id)
    }

    /// A registered upload, for its setters.
    pub fn upload_mut(&mut self, id: TransferId) -> Option<&mut TransferSend> {
        self.senders.get_mut(&id)
    }

    /// A registered transfer of either direction.
    pub fn get(&self, id: TransferId) -> Option<TransferRef<'_>> {
        self.receivers
            .get(&id)
            .map(TransferRef::Recv)
            .or_else(|| self.senders.get(&id).map(TransferRef::Send))
    }

    /// Snapshots of every registered transfer, downloads first.
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.receivers
            .values()
            .map(|t| t.info().snapshot())
            .chain(self.senders.values().map(|t| t.info().snapshot()))
            .collect()
    }

    /// Validates a transfer and moves it to `Queued`.
    ///
    /// Returns `false` if the transfer is unknown, was not `Configuring`, or
    /// failed validation (in which case it is now `Failed` and removed).
    pub fn queue(&mut self, id: TransferId) -> bool {
        if self.receivers.contains_key(&id) {
            self.with_recv(id, |t, ctx| t.queue(ctx)).unwrap_or(false)
        } else {
            self.with_send(id, |t, ctx| t.queue(ctx)).unwrap_or(false)
        }
    }

    /// Starts a queued transfer.
    pub fn start(&mut self, id: TransferId) {
        if self.with_recv(id, |t, ctx| t.start(ctx)).is_none() {
            self.with_send(id, |t, ctx| t.start(ctx));
        }
    }

    /// Cancels a transfer, or closes a chat.
    pub fn abort(&mut self, id: TransferId) {
        if self.with_recv(id, |t, ctx| t.abort(ctx)).is_none()
            && self.with_send(id, |t, ctx| t.abort(ctx)).is_none()
        {
            self.with_chat(id, |c, ctx| c.close(ctx));
        }
    }

    /// Aborts every live transfer and closes every chat.
    pub fn abort_all(&mut self) {
        let ids: Vec<TransferId> = self
            .receivers
            .keys()
            .chain(self.senders.keys())
            .chain(self.chats.keys())
            .copied()
            .collect();
        for id in ids {
            self.abort(id);
        }
    }

    /// Answers a [`ResumeQuestion`](crate::host::ResumeQuestion).
    ///
    /// Returns `false` if the download is gone, no question is pending, or
    /// the answer was not one of the offered actions.
    pub fn resolve_conflict(&mut self, id: TransferId, decision: ResumeDecision) -> bool {
        self.with_recv(id, |t, ctx| t.resolve(ctx, decision))
            .unwrap_or(false)
    }

    /// Matches an inbound `DCC ACCEPT` to a download that asked to resume.
    ///
    /// A download whose partner port equals `port` wins; otherwise the
    /// first name match is used, since NAT may rewrite the port. The
    /// partner port is compared rather than our own: the `DCC RESUME` we sent
    /// named the sender's port, and a download has not bound a port of its
    /// own by the time the `ACCEPT` arrives.
    ///
    /// Returns `None` if nothing matched or the match has no `DCC RESUME`
    /// outstanding.
    pub fn resume_download(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        file_name: &str,
        port: u16,
        position: u64,
    ) -> Option<TransferId> {
        let id = best_match(self.receivers.values().filter_map(|recv| {
            let info = recv.info();
            let hit = matches!(
                info.status(),
                TransferStatus::Queued | TransferStatus::WaitingRemote
            ) && info.is_resumed()
                && info.connection_id() == Some(connection)
                && info.partner_nick().eq_ignore_ascii_case(nick)
                && info.file_name() == file_name;
            hit.then_some((info.id(), info.partner_port() == port))
        }))?;

        self.with_recv(id, |t, ctx| t.start_resume(ctx, position))
            .unwrap_or(false)
            .then_some(id)
    }

    /// Matches an inbound `DCC RESUME` to an upload and answers with
    /// `DCC ACCEPT` at the same position.
    pub fn resume_upload(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        file_name: &str,
        port: u16,
        position: u64,
        token: Option<&str>,
    ) -> Option<TransferId> {
        let id = best_match(self.senders.values().filter_map(|send| {
            let info = send.info();
            let hit = matches!(
                info.status(),
                TransferStatus::Queued | TransferStatus::WaitingRemote
            ) && !info.is_resumed()
                && info.connection_id() == Some(connection)
                && info.partner_nick().eq_ignore_ascii_case(nick)
                && info.file_name() == file_name
                && token.is_none_or(|token| info.reverse_token() == Some(token));
            hit.then_some((info.id(), info.own_port() == port))
        }))?;

        let token = token.map(str::to_string);
        self.with_send(id, |t, ctx| t.accept_resume(ctx, port, position, token));
        Some(id)
    }

    /// Matches the receiver's answer to one of our passive offers and
    /// connects to the address it reported.
    #[allow(clippy::too_many_arguments)]
    pub fn start_reverse_sending(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        file_name: &str,
        host: IpAddr,
        port: u16,
        size: u64,
        token: &str,
    ) -> Option<TransferId> {
        let id = self.senders.values().find_map(|send| {
            let info = send.info();
            let hit = info.status() == TransferStatus::WaitingRemote
                && info.is_reverse()
                && info.connection_id() == Some(connection)
                && info.partner_nick().eq_ignore_ascii_case(nick)
                && info.file_name() == file_name
                && info.file_size() == size
                && info.reverse_token() == Some(token);
            hit.then_some(info.id())
        })?;

        self.with_send(id, |t, ctx| t.connect_to_receiver(ctx, host, port));
        Some(id)
    }

    /// Fails the pending upload the peer refused with `DCC REJECT`.
    pub fn reject_send(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        file_name: &str,
    ) -> Option<TransferId> {
        let id = self.senders.values().find_map(|send| {
            let info = send.info();
            let hit = matches!(
                info.status(),
                TransferStatus::Queued | TransferStatus::WaitingRemote
            ) && info.connection_id() == Some(connection)
                && info.partner_nick().eq_ignore_ascii_case(nick)
                && info.file_name() == file_name;
            hit.then_some(info.id())
        })?;

        self.with_send(id, |t, ctx| t.reject(ctx));
        Some(id)
    }

    /// Starts every queued download on `connection` from `nick` named
    /// `file_name`. `None` matches anything.
    pub fn accept_dcc_get(
        &mut self,
        connection: ConnectionId,
        nick: Option<&str>,
        file_name: Option<&str>,
    ) -> Vec<TransferId> {
        let ids: Vec<TransferId> = self
            .receivers
            .values()
            .map(TransferRecv::info)
            .filter(|info| {
                info.status() == TransferStatus::Queued
                    && info.connection_id() == Some(connection)
                    && nick.is_none_or(|nick| info.partner_nick().eq_ignore_ascii_case(nick))
                    && file_name.is_none_or(|name| info.file_name() == name)
            })
            .map(|info| info.id())
            .collect();

        for &id in &ids {
            self.start(id);
        }
        ids
    }

    /// Next passive offer token. Never repeats within the process.
    pub fn generate_reverse_token_number(&self) -> u64 {
        self.tokens.next()
    }

    /// Whether a connecting or transferring download writes to `path`.
    pub fn is_local_file_in_writing_process(&self, path: &Path) -> bool {
        writing_to(&self.receivers, path)
    }

    /// Whether any transfer is moving data.
    pub fn has_active_transfers(&self) -> bool {
        self.receivers
            .values()
            .map(TransferRecv::info)
            .chain(self.senders.values().map(TransferSend::info))
            .any(|info| info.status() == TransferStatus::Transferring)
    }

    /// Changes the download root. Queued downloads still headed for the
    /// default destination under the old root follow it.
    pub fn set_default_incoming_folder(&mut self, folder: PathBuf) {
        let old = std::mem::replace(&mut self.default_incoming_folder, folder.clone());
        self.config.general.download_dir = Some(folder.clone());
        if old == folder {
            return;
        }

        let general = &self.config.general;
        for recv in self.receivers.values_mut() {
            let info = recv.info();
            if info.status() != TransferStatus::Queued {
                continue;
            }
            let previous = default_destination_in(
                &old,
                general,
                info.partner_nick(),
                recv.save_file_name(),
            );
            if info.file_path() != Some(previous.as_path()) {
                continue;
            }
            let next = default_destination_in(
                &folder,
                general,
                info.partner_nick(),
                recv.save_file_name(),
            );
            tracing::debug!(transfer_id = %info.id(), path = %next.display(), "destination follows new download folder");
            recv.set_file_path(next);
        }
    }

    /// Registers a chat we offer, in `Configuring`. Fill it in through
    /// [`TransferManager::chat_mut`], then queue and start it.
    pub fn new_chat(&mut self) -> TransferId {
        self.register_chat(true)
    }

    fn register_chat(&mut self, self_opened: bool) -> TransferId {
        let id = self.allocate_id();
        self.chats.insert(id, DccChat::new(id, self_opened));
        tracing::debug!(chat_id = %id, self_opened, "chat registered");
        self.publish(TransferEvent::Chat(ChatEvent::Added { id, self_opened }));
        id
    }

    /// A registered chat.
    pub fn chat(&self, id: TransferId) -> Option<&DccChat> {
        self.chats.get(&id)
    }

    /// A registered chat, for its setters.
    pub fn chat_mut(&mut self, id: TransferId) -> Option<&mut DccChat> {
        self.chats.get_mut(&id)
    }

    /// Snapshots of every registered chat.
    pub fn chat_snapshots(&self) -> Vec<ChatSnapshot> {
        self.chats.values().map(DccChat::snapshot).collect()
    }

    /// Validates a chat and moves it to `Queued`. A chat that fails
    /// validation is `Failed` and removed.
    pub fn queue_chat(&mut self, id: TransferId) -> bool {
        self.with_chat(id, |c, ctx| c.queue(ctx)).unwrap_or(false)
    }

    /// Starts a queued chat: sends our offer, or accepts the partner's.
    pub fn start_chat(&mut self, id: TransferId) {
        self.with_chat(id, |c, ctx| c.start(ctx));
    }

    /// Offers a chat to `nick`. A passive offer (`reverse`) lets the partner
    /// listen instead of us.
    ///
    /// Returns `None` if the offer failed validation.
    pub fn offer_chat(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        reverse: bool,
    ) -> Option<TransferId> {
        let id = self.new_chat();
        if let Some(chat) = self.chats.get_mut(&id) {
            chat.set_connection_id(connection);
            chat.set_partner_nick(nick);
            chat.set_reverse(reverse, None);
        }
        if !self.queue_chat(id) {
            return None;
        }
        self.start_chat(id);
        Some(id)
    }

    /// Accepts an incoming chat offer that is waiting in `Queued`.
    pub fn accept_chat(&mut self, id: TransferId) -> bool {
        let waiting = self
            .chats
            .get(&id)
            .is_some_and(|c| !c.is_self_opened() && c.status() == ChatStatus::Queued);
        if waiting {
            self.start_chat(id);
        }
        waiting
    }

    /// Turns down an incoming chat offer with `DCC REJECT CHAT`.
    pub fn reject_chat_offer(&mut self, id: TransferId) -> bool {
        self.with_chat(id, |c, ctx| c.reject_offer(ctx))
            .unwrap_or(false)
    }

    /// Fails our pending chat offer that `nick` refused.
    pub fn reject_chat(&mut self, connection: ConnectionId, nick: &str) -> Option<TransferId> {
        let id = self.chats.values().find_map(|chat| {
            let hit = chat.status() == ChatStatus::WaitingRemote
                && chat.is_self_opened()
                && chat.connection_id() == Some(connection)
                && chat.partner_nick().eq_ignore_ascii_case(nick);
            hit.then_some(chat.id())
        })?;

        self.with_chat(id, |c, ctx| c.rejected(ctx));
        Some(id)
    }

    /// Matches the partner's answer to one of our passive chat offers and
    /// connects to the address it reported.
    pub fn start_reverse_chat(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        host: IpAddr,
        port: u16,
        token: &str,
    ) -> Option<TransferId> {
        let id = self.chats.values().find_map(|chat| {
            let hit = chat.status() == ChatStatus::WaitingRemote
                && chat.is_self_opened()
                && chat.is_reverse()
                && chat.connection_id() == Some(connection)
                && chat.partner_nick().eq_ignore_ascii_case(nick)
                && chat.reverse_token() == Some(token);
            hit.then_some(chat.id())
        })?;

        self.with_chat(id, |c, ctx| c.connect_to_partner(ctx, host, port));
        Some(id)
    }

    /// Sends one line to a connected chat partner.
    ///
    /// Returns `false` unless the chat is `Chatting`.
    pub fn send_chat_line(&mut self, id: TransferId, text: &str) -> bool {
        self.chats
            .get_mut(&id)
            .is_some_and(|chat| chat.send_line(text))
    }

    /// Ends a chat from our side.
    pub fn close_chat(&mut self, id: TransferId) {
        self.with_chat(id, |c, ctx| c.close(ctx));
    }

    /// Whether any chat is connected.
    pub fn has_active_chats(&self) -> bool {
        self.chats
            .values()
            .any(|chat| chat.status() == ChatStatus::Chatting)
    }

    fn add_chat_offer(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        address: IpAddr,
        port: u16,
        token: Option<String>,
    ) -> TransferId {
        let id = self.register_chat(false);
        if let Some(chat) = self.chats.get_mut(&id) {
            chat.set_connection_id(connection);
            chat.set_partner_nick(nick);
            chat.set_partner_ip(address);
            if token.is_some() {
                chat.set_reverse(true, token);
            } else {
                chat.set_partner_port(port);
            }
        }
        tracing::info!(chat_id = %id, %nick, "incoming chat offer");

        if self.queue_chat(id) && self.config.chat.auto_accept {
            self.start_chat(id);
        }
        id
    }

    /// Dispatches a parsed inbound DCC request from `nick`.
    ///
    /// An offer creates a queued download or chat, started right away with
    /// `transfer.auto_accept` or `chat.auto_accept`. Answers to our own
    /// requests must match a live transfer or chat; a miss is an
    /// [`Error::UnmatchedMessage`].
    pub fn handle_message(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        message: &DccMessage,
    ) -> Result<Option<TransferId>> {
        let unmatched = |file: &str| Error::UnmatchedMessage {
            command: message.command(),
            nick: nick.to_string(),
            file: file.to_string(),
        };

        match message {
            DccMessage::Send {
                file_name,
                address,
                port,
                size,
                token,
            } => {
                if message.send_kind() == Some(SendKind::ReverseAck) {
                    let token = token.as_deref().unwrap_or_default();
                    return self
                        .start_reverse_sending(
                            connection, nick, file_name, *address, *port, *size, token,
                        )
                        .map(Some)
                        .ok_or_else(|| unmatched(file_name));
                }
                Ok(Some(self.add_offer(
                    connection,
                    nick,
                    file_name,
                    *address,
                    *port,
                    *size,
                    token.clone(),
                )))
            }
            DccMessage::Accept {
                file_name,
                port,
                position,
                ..
            } => self
                .resume_download(connection, nick, file_name, *port, *position)
                .map(Some)
                .ok_or_else(|| unmatched(file_name)),
            DccMessage::Resume {
                file_name,
                port,
                position,
                token,
            } => self
                .resume_upload(
                    connection,
                    nick,
                    file_name,
                    *port,
                    *position,
                    token.as_deref(),
                )
                .map(Some)
                .ok_or_else(|| unmatched(file_name)),
            DccMessage::Reject { file_name } => self
                .reject_send(connection, nick, file_name)
                .map(Some)
                .ok_or_else(|| unmatched(file_name)),
            DccMessage::Chat {
                address,
                port,
                token,
            } => match token {
                Some(token) if *port != 0 => self
                    .start_reverse_chat(connection, nick, *address, *port, token)
                    .map(Some)
                    .ok_or_else(|| unmatched("chat")),
                _ => Ok(Some(self.add_chat_offer(
                    connection,
                    nick,
                    *address,
                    *port,
                    token.clone(),
                ))),
            },
            DccMessage::RejectChat => self
                .reject_chat(connection, nick)
                .map(Some)
                .ok_or_else(|| unmatched("chat")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_offer(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        file_name: &str,
        address: IpAddr,
        port: u16,
        size: u64,
        token: Option<String>,
    ) -> TransferId {
        let id = self.new_download();
        if let Some(recv) = self.receivers.get_mut(&id) {
            recv.info_mut().set_connection_id(connection);
            recv.info_mut().set_partner_nick(nick);
            recv.set_partner_ip(address);
            recv.set_file_name(file_name);
            recv.set_file_size(size);
            if token.is_some() {
                recv.set_reverse(true, token);
            } else {
                recv.set_partner_port(port);
            }
        }
        tracing::info!(transfer_id = %id, %nick, file = %file_name, size, "incoming file offer");

        if self.queue(id) && self.config.transfer.auto_accept {
            self.start(id);
        }
        id
    }

    /// Feeds one I/O completion to its transfer. Events for transfers that
    /// are gone are dropped.
    pub fn handle_io(&mut self, event: IoEvent) {
        let IoEvent { transfer, kind } = event;
        if self.receivers.contains_key(&transfer) {
            self.with_recv(transfer, |t, ctx| t.on_io(ctx, kind));
        } else if self.senders.contains_key(&transfer) {
            self.with_send(transfer, |t, ctx| t.on_io(ctx, kind));
        } else if self.chats.contains_key(&transfer) {
            self.with_chat(transfer, |c, ctx| c.on_io(ctx, kind));
        } else {
            tracing::debug!(transfer_id = %transfer, ?kind, "dropping event for unknown transfer");
        }
    }

    /// Takes a speed sample of every transferring transfer.
    pub fn sample_meters(&mut self, now: Instant) {
        for recv in self.receivers.values_mut() {
            recv.info_mut().sample(now);
        }
        for send in self.senders.values_mut() {
            send.info_mut().sample(now);
        }
    }

    fn allocate_id(&mut self) -> TransferId {
        let id = TransferId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn with_recv<R>(
        &mut self,
        id: TransferId,
        f: impl FnOnce(&mut TransferRecv, &mut Ctx<'_>) -> R,
    ) -> Option<R> {
        let mut recv = self.receivers.remove(&id)?;
        let mut changes = Vec::new();
        let result = f(&mut recv, &mut ctx!(self, id, &mut changes));

        let finished = recv.info().is_finished().then(|| recv.info().snapshot());
        if finished.is_none() {
            self.receivers.insert(id, recv);
        }
        self.settle(changes, finished);
        Some(result)
    }

    fn with_send<R>(
        &mut self,
        id: TransferId,
        f: impl FnOnce(&mut TransferSend, &mut Ctx<'_>) -> R,
    ) -> Option<R> {
        let mut send = self.senders.remove(&id)?;
        let mut changes = Vec::new();
        let result = f(&mut send, &mut ctx!(self, id, &mut changes));

        let finished = send.info().is_finished().then(|| send.info().snapshot());
        if finished.is_none() {
            self.senders.insert(id, send);
        }
        self.settle(changes, finished);
        Some(result)
    }

    fn with_chat<R>(
        &mut self,
        id: TransferId,
        f: impl FnOnce(&mut DccChat, &mut ChatCtx<'_>) -> R,
    ) -> Option<R> {
        let mut chat = self.chats.remove(&id)?;
        let mut events = Vec::new();
        let result = f(
            &mut chat,
            &mut ChatCtx {
                id,
                config: &self.config,
                io: &self.io,
                server: &mut *self.server,
                tokens: &self.tokens,
                events: &mut events,
            },
        );

        let finished = chat.status().is_terminal().then(|| chat.snapshot());
        if finished.is_none() {
            self.chats.insert(id, chat);
        }
        for event in events {
            self.publish(TransferEvent::Chat(event));
        }
        if let Some(snapshot) = finished {
            tracing::debug!(chat_id = %snapshot.id, status = %snapshot.status, "chat removed");
            self.publish(TransferEvent::Chat(ChatEvent::Finished(snapshot)));
        }
        Some(result)
    }

    fn settle(&mut self, changes: Vec<StatusChange>, finished: Option<TransferSnapshot>) {
        for change in changes {
            let queued = (change.old == TransferStatus::Configuring
                && change.new == TransferStatus::Queued)
                .then_some(TransferEvent::Queued {
                    id: change.id,
                    direction: change.direction,
                });
            self.publish(TransferEvent::StatusChanged(change));
            if let Some(event) = queued {
                self.publish(event);
            }
        }
        if let Some(snapshot) = finished {
            tracing::debug!(transfer_id = %snapshot.id, status = %snapshot.status, "transfer removed");
            self.publish(TransferEvent::Finished(snapshot));
        }
    }

    fn publish(&mut self, event: TransferEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Picks the first exact match, else the first candidate.
fn best_match(candidates: impl Iterator<Item = (TransferId, bool)>) -> Option<TransferId> {
    let mut fallback = None;
    for (id, exact) in candidates {
        if exact {
            return Some(id);
        }
        fallback.get_or_insert(id);
    }
    fallback
}
