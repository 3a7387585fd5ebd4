//! DCC file transfers.
//!
//! A transfer is one file offer in one direction. Both directions share the
//! identity, status and speed figures kept in [`TransferInfo`]; the
//! direction-specific negotiation lives in [`TransferRecv`] and
//! [`TransferSend`].
//!
//! ## Lifecycle
//!
//! ```text
//! Configuring -> Queued -> Preparing (receive only) | WaitingRemote
//!             -> Connecting -> Transferring -> Done | Failed | Aborted
//! ```
//!
//! Transfers are created and owned by the
//! [`TransferManager`](crate::manager::TransferManager). The caller fills in
//! the fields while the transfer is `Configuring`, then queues and starts it
//! through the manager. Network, disk and timer completions arrive as
//! [`IoEvent`](crate::io::IoEvent)s and drive the rest.

pub mod meter;
pub mod recv;
pub mod send;
pub mod write_cache;

pub use meter::{Estimate, TransferMeter};
pub use recv::TransferRecv;
pub use send::TransferSend;
pub use write_cache::{CacheEvent, WriteCacheHandler, WriteSink};

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::host::{Authorizer, ResumeResolver, ServerLink};
use crate::io::{IoDriver, IoEventKind};
use crate::manager::ReverseTokens;
use crate::protocol::DccMessage;

/// Identifies an IRC connection. Assigned by the embedding application.
pub type ConnectionId = u32;

/// Stable handle of a transfer inside its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We download
    Receive,
    /// We upload
    Send,
}

/// Transfer status, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Fields are being filled in
    Configuring,
    /// Validated and waiting to be started
    Queued,
    /// Setting up the local destination (receive only)
    Preparing,
    /// Waiting for the peer to answer over IRC
    WaitingRemote,
    /// Opening the data connection
    Connecting,
    /// Moving data
    Transferring,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
    /// Cancelled locally
    Aborted,
}

impl TransferStatus {
    /// Done, Failed or Aborted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    /// Lowercase name for display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuring => "configuring",
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::WaitingRemote => "waiting",
            Self::Connecting => "connecting",
            Self::Transferring => "transferring",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition, reported once per actual change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Transfer that moved
    pub id: TransferId,
    /// Its direction
    pub direction: Direction,
    /// Status before
    pub old: TransferStatus,
    /// Status after
    pub new: TransferStatus,
    /// Status detail after the change
    pub detail: String,
}

/// Identity, status and progress shared by both directions.
#[derive(Debug)]
pub struct TransferInfo {
    id: TransferId,
    direction: Direction,
    status: TransferStatus,
    status_detail: String,
    failure: Option<ErrorKind>,
    connection_id: Option<ConnectionId>,
    partner_nick: String,
    partner_ip: Option<IpAddr>,
    partner_port: u16,
    own_ip: Option<IpAddr>,
    own_port: u16,
    file_name: String,
    file_size: u64,
    file_path: Option<PathBuf>,
    resumed: bool,
    reverse: bool,
    reverse_token: Option<String>,
    transfer_start_position: u64,
    transferring_position: u64,
    offered_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    meter: TransferMeter,
    done_signalled: bool,
}

impl TransferInfo {
    fn new(id: TransferId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            status: TransferStatus::Configuring,
            status_detail: String::new(),
            failure: None,
            connection_id: None,
            partner_nick: String::new(),
            partner_ip: None,
            partner_port: 0,
            own_ip: None,
            own_port: 0,
            file_name: String::new(),
            file_size: 0,
            file_path: None,
            resumed: false,
            reverse: false,
            reverse_token: None,
            transfer_start_position: 0,
            transferring_position: 0,
            offered_at: None,
            started_at: None,
            finished_at: None,
            meter: TransferMeter::new(),
            done_signalled: false,
        }
    }

    /// Handle of this transfer.
    pub const fn id(&self) -> TransferId {
        self.id
    }

    /// Receive or send.
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Current status.
    pub const fn status(&self) -> TransferStatus {
        self.status
    }

    /// Human-readable detail for the current status.
    pub fn status_detail(&self) -> &str {
        &self.status_detail
    }

    /// Classification of the failure, once `Failed`.
    pub const fn failure(&self) -> Option<ErrorKind> {
        self.failure
    }

    /// IRC connection this transfer belongs to.
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Nick of the other side.
    pub fn partner_nick(&self) -> &str {
        &self.partner_nick
    }

    /// Address of the other side, once known.
    pub const fn partner_ip(&self) -> Option<IpAddr> {
        self.partner_ip
    }

    /// Port of the other side.
    pub const fn partner_port(&self) -> u16 {
        self.partner_port
    }

    /// Address we announce.
    pub const fn own_ip(&self) -> Option<IpAddr> {
        self.own_ip
    }

    /// Our port, once bound.
    pub const fn own_port(&self) -> u16 {
        self.own_port
    }

    /// File name as negotiated on the wire.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Announced size in bytes.
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Local destination or source.
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Whether the transfer continues a partial file.
    pub const fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Whether the passive (reverse) negotiation is used.
    pub const fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Token of a passive negotiation.
    pub fn reverse_token(&self) -> Option<&str> {
        self.reverse_token.as_deref()
    }

    /// Position the data connection started at.
    pub const fn transfer_start_position(&self) -> u64 {
        self.transfer_start_position
    }

    /// Bytes transferred so far, counting any resumed prefix.
    pub const fn transferring_position(&self) -> u64 {
        self.transferring_position
    }

    /// When the transfer was queued.
    pub const fn offered_at(&self) -> Option<DateTime<Utc>> {
        self.offered_at
    }

    /// When data started to flow.
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When a terminal status was reached.
    pub const fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Speed and ETA figures.
    pub const fn meter(&self) -> &TransferMeter {
        &self.meter
    }

    /// Completed percentage, 0 to 100.
    pub fn progress(&self) -> f64 {
        progress(self.transferring_position, self.file_size)
    }

    /// Sets the IRC connection. Only while `Configuring` or `Queued`.
    pub fn set_connection_id(&mut self, connection: ConnectionId) -> bool {
        if !self.identity_editable() {
            return false;
        }
        self.connection_id = Some(connection);
        true
    }

    /// Sets the partner nick. Only while `Configuring` or `Queued`.
    pub fn set_partner_nick(&mut self, nick: &str) -> bool {
        if !self.identity_editable() {
            return false;
        }
        self.partner_nick = nick.to_string();
        true
    }

    /// An immutable copy for observers.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            direction: self.direction,
            status: self.status,
            status_detail: self.status_detail.clone(),
            failure_kind: self.failure,
            connection_id: self.connection_id,
            partner_nick: self.partner_nick.clone(),
            partner_ip: self.partner_ip,
            partner_port: self.partner_port,
            own_ip: self.own_ip,
            own_port: self.own_port,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_path: self.file_path.clone(),
            resumed: self.resumed,
            reverse: self.reverse,
            reverse_token: self.reverse_token.clone(),
            transfer_start_position: self.transfer_start_position,
            transferring_position: self.transferring_position,
            offered_at: self.offered_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            average_speed: self.meter.average_speed(),
            current_speed: self.meter.current_speed(),
            time_left: self.meter.time_left(),
        }
    }

    /// Whether the transfer has reported completion.
    pub(crate) const fn is_finished(&self) -> bool {
        self.done_signalled
    }

    const fn identity_editable(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Configuring | TransferStatus::Queued
        )
    }

    fn configuring(&self) -> bool {
        self.status == TransferStatus::Configuring
    }

    pub(crate) fn sample(&mut self, now: Instant) {
        if self.status == TransferStatus::Transferring {
            self.meter
                .sample(now, self.transferring_position, self.file_size);
        }
    }

    /// Moves the position forward; never backward and never past the size.
    fn advance_to(&mut self, position: u64) {
        let capped = if self.file_size > 0 {
            position.min(self.file_size)
        } else {
            position
        };
        if capped > self.transferring_position {
            self.transferring_position = capped;
        }
    }

    fn check_identity(&self) -> Result<()> {
        if self.connection_id.is_none() {
            return Err(Error::MissingField("No IRC connection was given"));
        }
        if self.partner_nick.is_empty() {
            return Err(Error::MissingField("No partner nick was given"));
        }
        Ok(())
    }

    fn set_status(&mut self, ctx: &mut Ctx<'_>, status: TransferStatus, detail: impl Into<String>) {
        let old = self.status;
        self.status_detail = detail.into();
        if old == status {
            return;
        }
        debug_assert!(
            status > old || status == TransferStatus::Queued,
            "backward transition {old} -> {status}"
        );
        self.status = status;

        let now = Instant::now();
        match status {
            TransferStatus::Queued if old == TransferStatus::Configuring => {
                self.offered_at = Some(Utc::now());
            }
            TransferStatus::Transferring => {
                self.started_at = Some(Utc::now());
                self.meter.start(now, self.transferring_position);
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
                self.meter.finish(now, self.transferring_position, s);
            }
            _ => {}
        }

        tracing::debug!(
            transfer_id = %self.id,
            file = %self.file_name,
            %old,
            new = %status,
            detail = %self.status_detail,
            "status changed"
        );
        ctx.changes.push(StatusChange {
            id: self.id,
            direction: self.direction,
            old,
            new: status,
            detail: self.status_detail.clone(),
        });
    }

    fn signal_done(&mut self) {
        self.done_signalled = true;
    }
}

fn progress(position: u64, size: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        position as f64 / size as f64 * 100.0
    }
}

/// Immutable copy of a transfer's fields, handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    /// Handle of the transfer
    pub id: TransferId,
    /// Receive or send
    pub direction: Direction,
    /// Status when the snapshot was taken
    pub status: TransferStatus,
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
    /// Negotiated file name
    pub file_name: String,
    /// Announced size
    pub file_size: u64,
    /// Local path
    pub file_path: Option<PathBuf>,
    /// Resumed transfer
    pub resumed: bool,
    /// Passive negotiation
    pub reverse: bool,
    /// Passive token
    pub reverse_token: Option<String>,
    /// Start position of the data connection
    pub transfer_start_position: u64,
    /// Position reached
    pub transferring_position: u64,
    /// Queued at
    pub offered_at: Option<DateTime<Utc>>,
    /// Data started at
    pub started_at: Option<DateTime<Utc>>,
    /// Finished at
    pub finished_at: Option<DateTime<Utc>>,
    /// Average speed in bytes per second
    pub average_speed: Estimate<f64>,
    /// Recent speed in bytes per second
    pub current_speed: Estimate<f64>,
    /// Estimated time to completion
    pub time_left: Estimate<Duration>,
}

impl TransferSnapshot {
    /// Completed percentage, 0 to 100.
    #[must_use]
    pub fn progress(&self) -> f64 {
        progress(self.transferring_position, self.file_size)
    }
}

/// A borrowed transfer of either direction.
#[derive(Debug, Clone, Copy)]
pub enum TransferRef<'a> {
    /// A download
    Recv(&'a TransferRecv),
    /// An upload
    Send(&'a TransferSend),
}

impl TransferRef<'_> {
    /// Shared fields.
    #[must_use]
    pub const fn info(&self) -> &TransferInfo {
        match self {
            Self::Recv(t) => t.info(),
            Self::Send(t) => t.info(),
        }
    }
}

/// Everything a transfer may touch while it handles one call or event.
pub(crate) struct Ctx<'a> {
    pub id: TransferId,
    pub config: &'a Config,
    pub io: &'a IoDriver,
    pub server: &'a mut dyn ServerLink,
    pub resolver: &'a mut dyn ResumeResolver,
    pub authorizer: &'a dyn Authorizer,
    pub tokens: &'a ReverseTokens,
    pub receivers: &'a BTreeMap<TransferId, TransferRecv>,
    pub changes: &'a mut Vec<StatusChange>,
}

impl Ctx<'_> {
    pub fn own_ip(&self, connection: Option<ConnectionId>) -> Option<IpAddr> {
        common::resolve_own_ip(&self.config.network, &*self.server, connection)
    }

    pub fn send_dcc(&mut self, info: &TransferInfo, message: &DccMessage) -> Result<()> {
        let connection = info
            .connection_id
            .ok_or(Error::MissingField("No IRC connection was given"))?;
        tracing::debug!(transfer_id = %self.id, nick = %info.partner_nick, %message, "sending DCC request");
        self.server.send_dcc(connection, &info.partner_nick, message)
    }

    pub fn is_local_file_in_writing_process(&self, path: &Path) -> bool {
        crate::manager::writing_to(self.receivers, path)
    }
}

/// Direction-specific behavior driven by the manager.
pub(crate) trait DccTransfer {
    fn info(&self) -> &TransferInfo;
    fn info_mut(&mut self) -> &mut TransferInfo;

    /// Validates the fields and moves to `Queued`.
    fn queue(&mut self, ctx: &mut Ctx<'_>) -> bool;
    /// Leaves `Queued`. A no-op in any other status.
    fn start(&mut self, ctx: &mut Ctx<'_>);
    /// Cancels from any non-terminal status.
    fn abort(&mut self, ctx: &mut Ctx<'_>);
    /// Feeds one I/O completion.
    fn on_io(&mut self, ctx: &mut Ctx<'_>, event: IoEventKind);
    /// Releases sockets, timers and files.
    fn clean_up(&mut self);

    /// Ends the transfer with an error. Ignored once terminal.
    fn fail(&mut self, ctx: &mut Ctx<'_>, error: Error) {
        if self.info().status.is_terminal() {
            return;
        }
        tracing::warn!(
            transfer_id = %ctx.id,
            file = %self.info().file_name,
            error = %error,
            "transfer failed"
        );
        self.clean_up();
        let info = self.info_mut();
        info.failure = Some(error.kind());
        info.set_status(ctx, TransferStatus::Failed, error.to_string());
        info.signal_done();
    }

    /// Shared tail of `queue()`: identity checks, then `Queued`.
    fn finish_queue(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if let Err(e) = self.info().check_identity() {
            self.fail(ctx, e);
            return false;
        }
        self.info_mut().set_status(ctx, TransferStatus::Queued, "");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        assert!(TransferStatus::Configuring < TransferStatus::Queued);
        assert!(TransferStatus::WaitingRemote < TransferStatus::Connecting);
        assert!(TransferStatus::Transferring < TransferStatus::Done);
        assert!(TransferStatus::Aborted.is_terminal());
        assert!(!TransferStatus::Transferring.is_terminal());
    }

    #[test]
    fn test_identity_setters_lock_after_queue() {
        let mut info = TransferInfo::new(TransferId::new(1), Direction::Send);
        assert!(info.set_connection_id(3));
        assert!(info.set_partner_nick("alice"));

        info.status = TransferStatus::Queued;
        assert!(info.set_partner_nick("bob"));

        info.status = TransferStatus::Transferring;
        assert!(!info.set_partner_nick("carol"));
        assert!(!info.set_connection_id(4));
        assert_eq!(info.partner_nick(), "bob");
        assert_eq!(info.connection_id(), Some(3));
    }

    #[test]
    fn test_position_never_moves_back_or_past_size() {
        let mut info = TransferInfo::new(TransferId::new(1), Direction::Receive);
        info.file_size = 100;
        info.advance_to(40);
        info.advance_to(30);
        assert_eq!(info.transferring_position(), 40);
        info.advance_to(150);
        assert_eq!(info.transferring_position(), 100);
        assert!((info.progress() - 100.0).abs() < f64::EPSILON);
    }
}
