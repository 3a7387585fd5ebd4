//! Receiving side of a DCC file transfer.
//!
//! ```text
//! start() -> Preparing --(sink open)-----------------------------+
//!              |  existing file: ask resolver, or auto-resume    |
//!              v                                                 v
//!          resume? -> WaitingRemote --ACCEPT--> connect_with_sender
//!                                                 | active:  Connecting -> connect
//!                                                 | passive: WaitingRemote -> listen,
//!                                                 |          send reverse acknowledgement
//!                                                 v
//!                                            Transferring -> final ack -> flush -> Done
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use tokio::net::TcpStream;

use super::{Ctx, DccTransfer, Direction, TransferId, TransferInfo, TransferStatus};
use crate::config::GeneralConfig;
use crate::error::Error;
use crate::host::{ResumeAction, ResumeDecision, ResumeQuestion};
use crate::io::{
    DataSocket, Deadline, FileSink, IoEventKind, Listener, OpenMode, SinkEvent, TaskGuard,
};
use crate::protocol::{encode_ack, sanitize_file_name, DccMessage, UNNAMED_FILE};
use crate::transfer::write_cache::{CacheEvent, WriteCacheHandler};

/// A destination conflict waiting for the user.
#[derive(Debug)]
struct PendingConflict {
    existing_size: Option<u64>,
    enabled: Vec<ResumeAction>,
}

/// A download.
#[derive(Debug)]
pub struct TransferRecv {
    info: TransferInfo,
    save_file_name: String,
    listener: Option<Listener>,
    connector: Option<TaskGuard>,
    socket: Option<DataSocket>,
    opening: Option<FileSink>,
    cache: Option<WriteCacheHandler<FileSink>>,
    deadline: Deadline,
    pending: Option<PendingConflict>,
}

impl TransferRecv {
    pub(crate) fn new(id: TransferId) -> Self {
        Self {
            info: TransferInfo::new(id, Direction::Receive),
            save_file_name: String::new(),
            listener: None,
            connector: None,
            socket: None,
            opening: None,
            cache: None,
            deadline: Deadline::default(),
            pending: None,
        }
    }

    /// Shared fields.
    pub const fn info(&self) -> &TransferInfo {
        &self.info
    }

    /// Shared fields, for the identity setters.
    pub fn info_mut(&mut self) -> &mut TransferInfo {
        &mut self.info
    }

    /// Name the file is saved under locally.
    pub fn save_file_name(&self) -> &str {
        &self.save_file_name
    }

    /// Whether a destination conflict is waiting for an answer.
    pub const fn awaiting_decision(&self) -> bool {
        self.pending.is_some()
    }

    /// Sets the sender's address.
    pub fn set_partner_ip(&mut self, ip: IpAddr) -> bool {
        self.configure(|info| info.partner_ip = Some(ip))
    }

    /// Sets the sender's port. Ignored for passive offers.
    pub fn set_partner_port(&mut self, port: u16) -> bool {
        if self.info.reverse {
            return self.info.configuring();
        }
        self.configure(|info| info.partner_port = port)
    }

    /// Sets the announced size.
    pub fn set_file_size(&mut self, size: u64) -> bool {
        self.configure(|info| info.file_size = size)
    }

    /// Sets the offered file name. The local name is a sanitized copy.
    pub fn set_file_name(&mut self, name: &str) -> bool {
        if !self.info.configuring() {
            return false;
        }
        self.info.file_name = name.to_string();
        self.save_file_name = sanitize_file_name(name);
        true
    }

    /// Overrides the destination. Allowed until the destination is settled.
    pub fn set_file_path(&mut self, path: PathBuf) -> bool {
        if !matches!(
            self.info.status,
            TransferStatus::Configuring | TransferStatus::Queued | TransferStatus::Preparing
        ) {
            return false;
        }
        if let Some(name) = path.file_name() {
            self.save_file_name = name.to_string_lossy().into_owned();
        }
        self.info.file_path = Some(path);
        true
    }

    /// Marks the offer as passive. The token is mandatory in that case.
    pub fn set_reverse(&mut self, reverse: bool, token: Option<String>) -> bool {
        if !self.info.configuring() || (reverse && token.is_none()) {
            return false;
        }
        self.info.reverse = reverse;
        if reverse {
            self.info.partner_port = 0;
            self.info.reverse_token = token;
        } else {
            self.info.reverse_token = None;
        }
        true
    }

    fn configure(&mut self, apply: impl FnOnce(&mut TransferInfo)) -> bool {
        if !self.info.configuring() {
            return false;
        }
        apply(&mut self.info);
        true
    }

    /// The peer accepted our resume request at `position`.
    ///
    /// Returns `false` without touching the transfer unless a `DCC RESUME`
    /// is outstanding, i.e. the destination is open and we are waiting.
    pub(crate) fn start_resume(&mut self, ctx: &mut Ctx<'_>, position: u64) -> bool {
        if self.info.status != TransferStatus::WaitingRemote || self.cache.is_none() {
            tracing::warn!(
                transfer_id = %ctx.id,
                status = %self.info.status,
                position,
                "ignoring ACCEPT without an outstanding RESUME"
            );
            return false;
        }
        tracing::debug!(transfer_id = %ctx.id, position, "resume accepted");
        self.deadline.stop();
        let expected = self.info.transferring_position;
        if position != expected {
            self.fail(
                ctx,
                Error::ResumeMismatch {
                    expected,
                    actual: position,
                },
            );
            return true;
        }
        self.info.transfer_start_position = position;
        self.connect_with_sender(ctx);
        true
    }

    /// Applies the user's answer to a destination conflict.
    pub(crate) fn resolve(&mut self, ctx: &mut Ctx<'_>, decision: ResumeDecision) -> bool {
        if self.info.status != TransferStatus::Preparing {
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if !pending.enabled.contains(&decision.action()) {
            tracing::warn!(transfer_id = %ctx.id, ?decision, "answer was not offered");
            self.pending = Some(pending);
            return false;
        }

        match decision {
            ResumeDecision::Resume => {
                self.prepare_local(ctx, OpenMode::Resume(pending.existing_size.unwrap_or(0)));
            }
            ResumeDecision::Overwrite => self.prepare_local(ctx, OpenMode::Overwrite),
            ResumeDecision::Rename(path) => {
                self.set_file_path(path);
                self.prepare_local(ctx, OpenMode::Create);
            }
            ResumeDecision::Cancel => {
                self.info.resumed = false;
                self.info.transferring_position = 0;
                self.info.transfer_start_position = 0;
                self.info.set_status(ctx, TransferStatus::Queued, "");
            }
        }
        true
    }

    fn prepare_local(&mut self, ctx: &mut Ctx<'_>, mode: OpenMode) {
        let Some(path) = self.info.file_path.clone() else {
            self.fail(ctx, Error::MissingField("No destination was given"));
            return;
        };
        self.info.resumed = matches!(mode, OpenMode::Resume(_));
        self.info.transferring_position = match mode {
            OpenMode::Resume(offset) => offset,
            OpenMode::Create | OpenMode::Overwrite => 0,
        };

        if ctx.is_local_file_in_writing_process(&path) {
            self.ask(
                ctx,
                "The file is used by another transfer.".to_string(),
                None,
                vec![ResumeAction::Rename, ResumeAction::Cancel],
                ResumeAction::Rename,
            );
            return;
        }

        tracing::debug!(transfer_id = %ctx.id, path = %path.display(), ?mode, "opening destination");
        self.opening = Some(ctx.io.open_sink(ctx.id, path, mode, self.info.file_size));
    }

    fn ask(
        &mut self,
        ctx: &mut Ctx<'_>,
        message: String,
        existing_size: Option<u64>,
        enabled: Vec<ResumeAction>,
        default: ResumeAction,
    ) {
        let path = self.info.file_path.clone().unwrap_or_default();
        self.pending = Some(PendingConflict {
            existing_size,
            enabled: enabled.clone(),
        });
        self.info
            .set_status(ctx, TransferStatus::Preparing, message.clone());
        tracing::info!(transfer_id = %ctx.id, path = %path.display(), %message, "destination needs a decision");
        ctx.resolver.ask(ResumeQuestion {
            transfer: ctx.id,
            message,
            path,
            existing_size,
            offered_size: self.info.file_size,
            enabled,
            default,
        });
    }

    fn on_sink_event(&mut self, ctx: &mut Ctx<'_>, event: SinkEvent) {
        match event {
            SinkEvent::Opened => {
                let Some(sink) = self.opening.take() else {
                    return;
                };
                self.cache = Some(WriteCacheHandler::new(sink));
                if self.info.resumed {
                    self.request_resume(ctx);
                } else {
                    self.connect_with_sender(ctx);
                }
            }
            SinkEvent::Partial(size) => {
                if self.opening.take().is_none() {
                    return;
                }
                if ctx.config.transfer.auto_resume {
                    self.prepare_local(ctx, OpenMode::Resume(size));
                } else {
                    self.ask(
                        ctx,
                        format!(
                            "A partial file of {size} bytes already exists (offered: {} bytes).",
                            self.info.file_size
                        ),
                        Some(size),
                        vec![
                            ResumeAction::Resume,
                            ResumeAction::Overwrite,
                            ResumeAction::Rename,
                            ResumeAction::Cancel,
                        ],
                        ResumeAction::Resume,
                    );
                }
            }
            SinkEvent::Exists(size) => {
                if self.opening.take().is_some() {
                    self.ask(
                        ctx,
                        "The file already exists.".to_string(),
                        Some(size),
                        vec![
                            ResumeAction::Overwrite,
                            ResumeAction::Rename,
                            ResumeAction::Cancel,
                        ],
                        ResumeAction::Overwrite,
                    );
                }
            }
            SinkEvent::FolderFailed(reason) | SinkEvent::OpenFailed(reason) => {
                if self.opening.take().is_some() {
                    self.ask(
                        ctx,
                        format!("Could not open the destination: {reason}"),
                        None,
                        vec![ResumeAction::Rename, ResumeAction::Cancel],
                        ResumeAction::Rename,
                    );
                }
            }
            SinkEvent::Written => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.on_sink_ready();
                }
            }
            SinkEvent::Flushed => {
                let done = self
                    .cache
                    .as_mut()
                    .is_some_and(|cache| cache.on_sink_flushed() == CacheEvent::Done);
                if done {
                    self.local_write_done(ctx);
                }
            }
            SinkEvent::Failed(reason) => {
                let failed = self
                    .cache
                    .as_mut()
                    .map(|cache| cache.on_sink_error(reason.clone()));
                if let Some(CacheEvent::Error(reason)) = failed {
                    self.fail(ctx, Error::Write(reason));
                }
            }
        }
    }

    fn request_resume(&mut self, ctx: &mut Ctx<'_>) {
        self.info.set_status(
            ctx,
            TransferStatus::WaitingRemote,
            "Waiting for remote host's acceptance",
        );
        self.deadline
            .arm(ctx.io, ctx.id, ctx.config.transfer.negotiation_timeout);

        let message = DccMessage::Resume {
            file_name: self.info.file_name.clone(),
            port: self.info.partner_port,
            position: self.info.transferring_position,
            token: self.info.reverse_token.clone(),
        };
        if let Err(e) = ctx.send_dcc(&self.info, &message) {
            tracing::debug!(transfer_id = %ctx.id, error = %e, "could not send RESUME");
            self.fail(ctx, Error::ServerUnavailable("DCC RESUME"));
        }
    }

    fn connect_with_sender(&mut self, ctx: &mut Ctx<'_>) {
        let timeout = ctx.config.transfer.negotiation_timeout;

        if self.info.reverse {
            if self.info.own_ip.is_none() {
                self.info.own_ip = ctx.own_ip(self.info.connection_id);
            }
            let Some(own_ip) = self.info.own_ip else {
                self.fail(ctx, Error::NoOwnAddress);
                return;
            };
            let listener = match ctx.io.listen(ctx.id, Some(own_ip), ctx.config.network.port_range) {
                Ok(listener) => listener,
                Err(e) => {
                    self.fail(ctx, e);
                    return;
                }
            };
            self.info.own_port = listener.port;
            self.listener = Some(listener);

            self.info
                .set_status(ctx, TransferStatus::WaitingRemote, "Waiting for connection");
            self.deadline.arm(ctx.io, ctx.id, timeout);

            let message = DccMessage::Send {
                file_name: self.info.file_name.clone(),
                address: own_ip,
                port: self.info.own_port,
                size: self.info.file_size,
                token: self.info.reverse_token.clone(),
            };
            if let Err(e) = ctx.send_dcc(&self.info, &message) {
                tracing::debug!(transfer_id = %ctx.id, error = %e, "could not send reverse acknowledgement");
                self.fail(ctx, Error::ServerUnavailable("the passive DCC SEND acknowledgement"));
            }
        } else {
            let Some(ip) = self.info.partner_ip else {
                self.fail(ctx, Error::MissingField("No sender address was given"));
                return;
            };
            self.info.set_status(ctx, TransferStatus::Connecting, "");
            self.deadline.arm(ctx.io, ctx.id, timeout);
            let addr = SocketAddr::new(ip, self.info.partner_port);
            tracing::debug!(transfer_id = %ctx.id, %addr, "connecting to sender");
            self.connector = Some(ctx.io.connect(ctx.id, addr));
        }
    }

    fn start_receiving(&mut self, ctx: &mut Ctx<'_>, stream: TcpStream) {
        self.deadline.stop();
        if let Ok(local) = stream.local_addr() {
            self.info.own_port = local.port();
        }
        if self.info.reverse {
            if let Ok(peer) = stream.peer_addr() {
                self.info.partner_ip = Some(peer.ip());
                self.info.partner_port = peer.port();
            }
        }
        self.socket = Some(ctx.io.attach_download(ctx.id, stream));
        self.info.transfer_start_position = self.info.transferring_position;
        self.info.set_status(ctx, TransferStatus::Transferring, "");
        tracing::info!(
            transfer_id = %ctx.id,
            file = %self.save_file_name,
            from = self.info.transfer_start_position,
            size = self.info.file_size,
            "receiving"
        );
    }

    fn read_data(&mut self, ctx: &mut Ctx<'_>, data: &[u8]) {
        if self.info.status != TransferStatus::Transferring || self.socket.is_none() {
            return;
        }
        let received = self.info.transferring_position + data.len() as u64;
        if received > self.info.file_size {
            self.fail(
                ctx,
                Error::Overrun {
                    received,
                    expected: self.info.file_size,
                },
            );
            return;
        }
        let Some(cache) = self.cache.as_mut() else {
            self.fail(
                ctx,
                Error::Internal("received data without an open destination".to_string()),
            );
            return;
        };
        cache.append(data);
        cache.write(false);
        self.info.advance_to(received);
        self.send_ack(ctx);
    }

    fn send_ack(&mut self, ctx: &Ctx<'_>) {
        let position = self.info.transferring_position;
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        socket.send(encode_ack(position, ctx.config.transfer.ack_byte_order).to_vec());

        if position == self.info.file_size {
            tracing::debug!(transfer_id = %ctx.id, position, "sent final ACK");
            socket.stop_reading();
            if let Some(cache) = self.cache.as_mut() {
                cache.close();
            }
        }
    }

    fn local_write_done(&mut self, ctx: &mut Ctx<'_>) {
        tracing::info!(
            transfer_id = %ctx.id,
            file = %self.save_file_name,
            size = self.info.file_size,
            "download complete"
        );
        self.clean_up();
        self.info.set_status(ctx, TransferStatus::Done, "");
        self.info.signal_done();
    }
}

impl DccTransfer for TransferRecv {
    fn info(&self) -> &TransferInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut TransferInfo {
        &mut self.info
    }

    fn queue(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.info.status != TransferStatus::Configuring {
            return false;
        }
        let Some(partner_ip) = self.info.partner_ip else {
            self.fail(ctx, Error::MissingField("No sender address was given"));
            return false;
        };
        if self.info.own_ip.is_none() {
            self.info.own_ip = ctx.own_ip(self.info.connection_id);
        }
        if !ctx.authorizer.may_receive() {
            self.fail(ctx, Error::NotAuthorized("receive"));
            return false;
        }
        if partner_ip.is_unspecified() {
            self.fail(ctx, Error::InvalidAddress(partner_ip.to_string()));
            return false;
        }
        if self.info.file_size == 0 {
            self.fail(ctx, Error::UnsupportedSize(0));
            return false;
        }
        if !self.info.reverse && self.info.partner_port == 0 {
            self.fail(ctx, Error::MissingField("No sender port was given"));
            return false;
        }
        if self.info.file_name.is_empty() {
            self.info.file_name = UNNAMED_FILE.to_string();
            self.save_file_name = UNNAMED_FILE.to_string();
        }
        if self.info.file_path.is_none() {
            self.info.file_path = Some(default_destination(
                &ctx.config.general,
                &self.info.partner_nick,
                &self.save_file_name,
            ));
        }
        self.finish_queue(ctx)
    }

    fn start(&mut self, ctx: &mut Ctx<'_>) {
        if self.info.status != TransferStatus::Queued {
            return;
        }
        self.info.set_status(ctx, TransferStatus::Preparing, "");
        self.prepare_local(ctx, OpenMode::Create);
    }

    fn abort(&mut self, ctx: &mut Ctx<'_>) {
        if self.info.status.is_terminal() {
            return;
        }
        if self.info.status == TransferStatus::Queued {
            let message = DccMessage::Reject {
                file_name: self.info.file_name.clone(),
            };
            if let Err(e) = ctx.send_dcc(&self.info, &message) {
                tracing::debug!(transfer_id = %ctx.id, error = %e, "could not send REJECT");
            }
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.write(true);
        }
        self.clean_up();
        self.info.set_status(ctx, TransferStatus::Aborted, "");
        self.info.signal_done();
    }

    fn on_io(&mut self, ctx: &mut Ctx<'_>, event: IoEventKind) {
        match event {
            IoEventKind::Accepted(stream) if self.listener.is_some() => {
                self.listener = None;
                self.start_receiving(ctx, stream);
            }
            IoEventKind::AcceptFailed(reason) if self.listener.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Connected(stream) if self.connector.is_some() => {
                self.connector = None;
                self.start_receiving(ctx, stream);
            }
            IoEventKind::ConnectFailed(reason) if self.connector.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Received(data) => self.read_data(ctx, &data),
            IoEventKind::Closed => {
                let complete = self.info.transferring_position == self.info.file_size;
                if self.socket.is_some() && !complete {
                    self.fail(
                        ctx,
                        Error::ConnectionClosed {
                            position: self.info.transferring_position,
                            size: self.info.file_size,
                        },
                    );
                }
            }
            IoEventKind::SocketError(reason) if self.socket.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Sink(event) => self.on_sink_event(ctx, event),
            IoEventKind::TimedOut(generation) => {
                if self.deadline.expired(generation) {
                    self.fail(ctx, Error::Timeout);
                }
            }
            other => tracing::trace!(transfer_id = %ctx.id, ?other, "ignoring stale event"),
        }
    }

    fn clean_up(&mut self) {
        self.deadline.stop();
        self.listener = None;
        self.connector = None;
        self.pending = None;
        if let Some(mut socket) = self.socket.take() {
            socket.stop_reading();
        }
        if let Some(sink) = self.opening.take() {
            sink.kill();
        }
        if let Some(mut cache) = self.cache.take() {
            cache.close_now();
        }
    }
}

/// Where a download lands when no path was given.
///
/// `root[/nick]/[nick.]name`, with the nick sanitized like a file name so it
/// cannot escape the root.
#[must_use]
pub fn default_destination(general: &GeneralConfig, nick: &str, save_name: &str) -> PathBuf {
    default_destination_in(&general.download_root(), general, nick, save_name)
}

pub(crate) fn default_destination_in(
    root: &Path,
    general: &GeneralConfig,
    nick: &str,
    save_name: &str,
) -> PathBuf {
    let nick = sanitize_file_name(nick);
    let mut dir = root.to_path_buf();
    if general.create_partner_folder {
        dir.push(&nick);
    }
    if general.add_partner_prefix {
        dir.join(format!("{nick}.{save_name}"))
    } else {
        dir.join(save_name)
    }
}
