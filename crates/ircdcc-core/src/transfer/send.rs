//! Sending side of a DCC file transfer.
//!
//! An active offer listens and waits for the receiver to connect. A passive
//! offer announces port 0 with a token; the receiver answers with its own
//! listening address and we connect to it.
//!
//! The receiver acknowledges the running byte count in 4-byte messages. In
//! acknowledged mode the next chunk waits for the acknowledgement of the
//! previous one; in fast mode chunks go out back to back. Either way the
//! transfer is only done once the acknowledgement reaches the file size.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::net::TcpStream;

use super::{Ctx, DccTransfer, Direction, TransferId, TransferInfo, TransferStatus};
use crate::error::Error;
use crate::io::{Deadline, IoEventKind, Listener, TaskGuard, Upload};
use crate::protocol::{decode_ack, sanitize_file_name, widen_ack, DccMessage, ACK_SIZE};

/// An upload.
#[derive(Debug)]
pub struct TransferSend {
    info: TransferInfo,
    listener: Option<Listener>,
    connector: Option<TaskGuard>,
    upload: Option<Upload>,
    deadline: Deadline,
    fast_send: bool,
    chunk_size: u64,
    /// Bytes handed to the socket
    sent: u64,
    /// Upper bound of what may have been written, including a pending chunk
    requested: u64,
    /// Highest acknowledged position
    acked: u64,
    ack_buf: Vec<u8>,
}

impl TransferSend {
    pub(crate) fn new(id: TransferId, reverse: bool) -> Self {
        let mut info = TransferInfo::new(id, Direction::Send);
        info.reverse = reverse;
        Self {
            info,
            listener: None,
            connector: None,
            upload: None,
            deadline: Deadline::default(),
            fast_send: true,
            chunk_size: crate::DEFAULT_BUFFER_SIZE as u64,
            sent: 0,
            requested: 0,
            acked: 0,
            ack_buf: Vec::with_capacity(ACK_SIZE),
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

    /// Highest position the receiver acknowledged.
    pub const fn acknowledged_position(&self) -> u64 {
        self.acked
    }

    /// Whether chunks are pipelined instead of waiting for acknowledgements.
    pub const fn is_fast_send(&self) -> bool {
        self.fast_send
    }

    /// Sets the source file.
    pub fn set_file_path(&mut self, path: PathBuf) -> bool {
        self.configure(|info| info.file_path = Some(path))
    }

    /// Sets the name announced to the receiver.
    pub fn set_file_name(&mut self, name: &str) -> bool {
        self.configure(|info| info.file_name = name.to_string())
    }

    /// Announces a size other than the file's own. When set, queueing keeps
    /// it instead of taking the size from the file.
    pub fn set_file_size(&mut self, size: u64) -> bool {
        self.configure(|info| info.file_size = size)
    }

    /// Overrides the address announced in the offer.
    pub fn set_own_ip(&mut self, ip: IpAddr) -> bool {
        self.configure(|info| info.own_ip = Some(ip))
    }

    /// Chooses between an active and a passive offer.
    pub fn set_reverse(&mut self, reverse: bool) -> bool {
        self.configure(|info| info.reverse = reverse)
    }

    fn configure(&mut self, apply: impl FnOnce(&mut TransferInfo)) -> bool {
        if !self.info.configuring() {
            return false;
        }
        apply(&mut self.info);
        true
    }

    /// The receiver asked to continue at `position`. Only before the data
    /// connection and only inside the file.
    pub(crate) fn set_resume(&mut self, position: u64) -> bool {
        if self.info.status > TransferStatus::WaitingRemote || position >= self.info.file_size {
            return false;
        }
        self.info.resumed = true;
        self.info.transferring_position = position;
        self.info.transfer_start_position = position;
        true
    }

    /// Accepts a RESUME request and answers with ACCEPT at the same position.
    pub(crate) fn accept_resume(
        &mut self,
        ctx: &mut Ctx<'_>,
        port: u16,
        position: u64,
        token: Option<String>,
    ) -> bool {
        if !self.set_resume(position) {
            tracing::warn!(
                transfer_id = %ctx.id,
                position,
                size = self.info.file_size,
                "refusing resume request"
            );
            return false;
        }
        let message = DccMessage::Accept {
            file_name: self.info.file_name.clone(),
            port,
            position,
            token,
        };
        if let Err(e) = ctx.send_dcc(&self.info, &message) {
            tracing::debug!(transfer_id = %ctx.id, error = %e, "could not send ACCEPT");
            self.fail(ctx, Error::ServerUnavailable("DCC ACCEPT"));
            return false;
        }
        true
    }

    /// The receiver of a passive offer is listening at `ip:port`.
    pub(crate) fn connect_to_receiver(&mut self, ctx: &mut Ctx<'_>, ip: IpAddr, port: u16) {
        self.deadline
            .arm(ctx.io, ctx.id, ctx.config.transfer.negotiation_timeout);
        self.info.partner_ip = Some(ip);
        self.info.partner_port = port;
        self.info.set_status(ctx, TransferStatus::Connecting, "");

        let addr = SocketAddr::new(ip, port);
        tracing::debug!(transfer_id = %ctx.id, %addr, "connecting to receiver");
        self.connector = Some(ctx.io.connect(ctx.id, addr));
    }

    /// The receiver turned the offer down.
    pub(crate) fn reject(&mut self, ctx: &mut Ctx<'_>) {
        self.fail(ctx, Error::Rejected("SEND"));
    }

    fn start_sending(&mut self, ctx: &mut Ctx<'_>, stream: TcpStream) {
        self.deadline.stop();
        self.listener = None;
        self.connector = None;

        if let Ok(local) = stream.local_addr() {
            self.info.own_port = local.port();
        }
        if !self.info.reverse {
            if let Ok(peer) = stream.peer_addr() {
                self.info.partner_ip = Some(peer.ip());
                self.info.partner_port = peer.port();
            }
        }
        let Some(path) = self.info.file_path.clone() else {
            self.fail(ctx, Error::MissingField("No source file was given"));
            return;
        };

        let position = self.info.transferring_position;
        self.chunk_size = ctx.config.transfer.buffer_size as u64;
        self.upload = Some(ctx.io.attach_upload(
            ctx.id,
            stream,
            path,
            position,
            ctx.config.transfer.buffer_size,
        ));
        self.info.transfer_start_position = position;
        self.sent = position;
        self.requested = position;
        self.acked = position;
        self.ack_buf.clear();

        self.info.set_status(ctx, TransferStatus::Transferring, "");
        tracing::info!(
            transfer_id = %ctx.id,
            file = %self.info.file_name,
            from = position,
            size = self.info.file_size,
            fast = self.fast_send,
            "sending"
        );
        self.request_chunk();
    }

    fn request_chunk(&mut self) {
        if self.sent >= self.info.file_size || self.requested > self.sent {
            return;
        }
        if let Some(upload) = self.upload.as_ref() {
            self.requested = (self.sent + self.chunk_size).min(self.info.file_size);
            upload.request_chunk();
        }
    }

    fn on_sent(&mut self, bytes: usize) {
        if self.info.status != TransferStatus::Transferring {
            return;
        }
        self.sent += bytes as u64;
        self.requested = self.sent;
        if self.fast_send {
            self.info.advance_to(self.sent);
            self.request_chunk();
        } else if self.acked >= self.sent {
            self.request_chunk();
        }
    }

    fn read_acks(&mut self, ctx: &mut Ctx<'_>, data: &[u8]) {
        if self.info.status != TransferStatus::Transferring {
            return;
        }
        self.ack_buf.extend_from_slice(data);

        let order = ctx.config.transfer.ack_byte_order;
        let ceiling = self.requested.max(self.sent);
        let mut chunks = self.ack_buf.chunks_exact(ACK_SIZE);
        for chunk in &mut chunks {
            let mut raw = [0u8; ACK_SIZE];
            raw.copy_from_slice(chunk);
            let position = widen_ack(decode_ack(raw, order), ceiling);
            self.acked = self.acked.max(position.min(self.info.file_size));
        }
        let rest = chunks.remainder().to_vec();
        self.ack_buf = rest;

        if !self.fast_send {
            self.info.advance_to(self.acked);
        }

        if self.acked >= self.info.file_size {
            tracing::info!(
                transfer_id = %ctx.id,
                file = %self.info.file_name,
                size = self.info.file_size,
                "upload complete"
            );
            self.info.advance_to(self.info.file_size);
            self.clean_up();
            self.info.set_status(ctx, TransferStatus::Done, "");
            self.info.signal_done();
        } else if !self.fast_send && self.acked >= self.sent {
            self.request_chunk();
        }
    }
}

impl DccTransfer for TransferSend {
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
        if self.info.own_ip.is_none() {
            self.info.own_ip = ctx.own_ip(self.info.connection_id);
        }
        if !ctx.authorizer.may_send() {
            self.fail(ctx, Error::NotAuthorized("send"));
            return false;
        }
        let Some(path) = self.info.file_path.clone() else {
            self.fail(ctx, Error::MissingField("No source file was given"));
            return false;
        };
        if self.info.own_ip.is_none() {
            self.fail(ctx, Error::NoOwnAddress);
            return false;
        }

        if self.info.file_name.is_empty() {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.info.file_name = sanitize_file_name(&base);
        }
        // One stat of a local path, on the caller's thread. Nothing here reads
        // the file; the pump opens it asynchronously once a peer connects.
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                self.fail(ctx, Error::SourceMissing(path));
                return false;
            }
        };

        let mut name = self.info.file_name.replace('"', "_");
        if ctx.config.transfer.space_to_underscore {
            name = name.replace(' ', "_");
        }
        self.info.file_name = name;
        self.fast_send = ctx.config.transfer.fast_send;

        if self.info.file_size == 0 {
            self.info.file_size = metadata.len();
        }
        if self.info.file_size == 0 {
            self.fail(ctx, Error::EmptyFile);
            return false;
        }
        self.finish_queue(ctx)
    }

    fn start(&mut self, ctx: &mut Ctx<'_>) {
        if self.info.status != TransferStatus::Queued {
            return;
        }
        let Some(own_ip) = self.info.own_ip else {
            self.fail(ctx, Error::NoOwnAddress);
            return;
        };

        let (port, token) = if self.info.reverse {
            let token = ctx.tokens.next().to_string();
            self.info.reverse_token = Some(token.clone());
            (0, Some(token))
        } else {
            match ctx.io.listen(ctx.id, Some(own_ip), ctx.config.network.port_range) {
                Ok(listener) => {
                    let port = listener.port;
                    self.listener = Some(listener);
                    (port, None)
                }
                Err(e) => {
                    self.fail(ctx, e);
                    return;
                }
            }
        };
        self.info.own_port = port;

        self.info.set_status(
            ctx,
            TransferStatus::WaitingRemote,
            "Awaiting acceptance by remote user...",
        );
        self.deadline
            .arm(ctx.io, ctx.id, ctx.config.transfer.send_timeout);

        let message = DccMessage::Send {
            file_name: self.info.file_name.clone(),
            address: own_ip,
            port,
            size: self.info.file_size,
            token,
        };
        if let Err(e) = ctx.send_dcc(&self.info, &message) {
            tracing::debug!(transfer_id = %ctx.id, error = %e, "could not send offer");
            self.fail(ctx, Error::ServerUnavailable("the DCC SEND offer"));
        }
    }

    fn abort(&mut self, ctx: &mut Ctx<'_>) {
        if self.info.status.is_terminal() {
            return;
        }
        self.clean_up();
        self.info.set_status(ctx, TransferStatus::Aborted, "");
        self.info.signal_done();
    }

    fn on_io(&mut self, ctx: &mut Ctx<'_>, event: IoEventKind) {
        match event {
            IoEventKind::Accepted(stream) if self.listener.is_some() => {
                self.start_sending(ctx, stream);
            }
            IoEventKind::AcceptFailed(reason) if self.listener.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Connected(stream) if self.connector.is_some() => {
                self.start_sending(ctx, stream);
            }
            IoEventKind::ConnectFailed(reason) if self.connector.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::Sent(bytes) => self.on_sent(bytes),
            IoEventKind::Received(data) => self.read_acks(ctx, &data),
            IoEventKind::Closed if self.upload.is_some() => {
                self.fail(
                    ctx,
                    Error::ConnectionClosed {
                        position: self.acked,
                        size: self.info.file_size,
                    },
                );
            }
            IoEventKind::SocketError(reason) if self.upload.is_some() => {
                self.fail(ctx, Error::Socket(reason));
            }
            IoEventKind::SourceEnded if self.upload.is_some() => {
                let reason = format!(
                    "source ended at {} of {} announced bytes",
                    self.sent, self.info.file_size
                );
                self.fail(ctx, Error::Read(reason));
            }
            IoEventKind::SourceError(reason) if self.upload.is_some() => {
                self.fail(ctx, Error::Read(reason));
            }
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
        self.upload = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_send(size: u64) -> TransferSend {
        let mut send = TransferSend::new(TransferId::new(1), false);
        send.info.file_size = size;
        send.info.status = TransferStatus::WaitingRemote;
        send
    }

    #[test]
    fn test_set_resume_bounds() {
        let mut send = queued_send(1000);
        assert!(!send.set_resume(1000), "position must be inside the file");
        assert!(send.set_resume(400));
        assert_eq!(send.info().transferring_position(), 400);
        assert_eq!(send.info().transfer_start_position(), 400);
        assert!(send.info().is_resumed());

        send.info.status = TransferStatus::Connecting;
        assert!(!send.set_resume(500), "too late once connecting");
    }

    #[test]
    fn test_setters_locked_after_configuring() {
        let mut send = TransferSend::new(TransferId::new(2), true);
        assert!(send.info().is_reverse());
        assert!(send.set_reverse(false));
        assert!(send.set_file_name("a b.txt"));

        send.info.status = TransferStatus::Queued;
        assert!(!send.set_file_name("c.txt"));
        assert!(!send.set_own_ip(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(send.info().file_name(), "a b.txt");
    }
}
