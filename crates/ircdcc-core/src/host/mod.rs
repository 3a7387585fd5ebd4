//! Collaborator interfaces.
//!
//! The engine never touches the IRC connection, the user, or the policy
//! store directly. The embedding application supplies these through the
//! traits below when it builds a [`TransferManager`](crate::manager::TransferManager).

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::protocol::DccMessage;
use crate::transfer::{ConnectionId, TransferId};

/// The IRC side of a DCC negotiation.
pub trait ServerLink: Send {
    /// Sends a DCC CTCP request to `nick` on the given connection.
    ///
    /// [`DccMessage::Reject`] and [`DccMessage::RejectChat`] travel as NOTICE
    /// replies, everything else as a PRIVMSG request. Returns an error if the connection is gone.
    fn send_dcc(&mut self, connection: ConnectionId, nick: &str, message: &DccMessage) -> Result<()>;

    /// Our address as the IRC server sees it (RPL_WELCOME / USERHOST).
    fn reported_own_ip(&self, _connection: ConnectionId) -> Option<IpAddr> {
        None
    }

    /// Local address of the socket connected to the IRC server.
    fn interface_ip(&self, _connection: ConnectionId) -> Option<IpAddr> {
        None
    }
}

/// Answers to a [`ResumeQuestion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    /// Continue the partial file
    Resume,
    /// Truncate and start over
    Overwrite,
    /// Save under another name
    Rename,
    /// Put the transfer back in the queue
    Cancel,
}

/// The user's decision, fed back through
/// [`TransferManager::resolve_conflict`](crate::manager::TransferManager::resolve_conflict).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Continue from the existing size
    Resume,
    /// Truncate the existing file
    Overwrite,
    /// Use a different destination
    Rename(PathBuf),
    /// Go back to `Queued`
    Cancel,
}

impl ResumeDecision {
    /// The action this decision answers with.
    #[must_use]
    pub const fn action(&self) -> ResumeAction {
        match self {
            Self::Resume => ResumeAction::Resume,
            Self::Overwrite => ResumeAction::Overwrite,
            Self::Rename(_) => ResumeAction::Rename,
            Self::Cancel => ResumeAction::Cancel,
        }
    }
}

/// A destination conflict the user has to settle.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeQuestion {
    /// Transfer waiting for the answer
    pub transfer: TransferId,
    /// Human-readable explanation
    pub message: String,
    /// Destination in question
    pub path: PathBuf,
    /// Size of what is already on disk, if anything
    pub existing_size: Option<u64>,
    /// Size the peer announced
    pub offered_size: u64,
    /// Answers that make sense here
    pub enabled: Vec<ResumeAction>,
    /// Answer to preselect
    pub default: ResumeAction,
}

/// Asks the user how to handle a destination conflict.
///
/// `ask` returns immediately; the answer arrives later through
/// [`TransferManager::resolve_conflict`](crate::manager::TransferManager::resolve_conflict).
pub trait ResumeResolver: Send {
    /// Presents the question.
    fn ask(&mut self, question: ResumeQuestion);
}

/// Whether file transfers are permitted at all.
pub trait Authorizer: Send {
    /// May the local user offer files?
    fn may_send(&self) -> bool;
    /// May the local user accept files?
    fn may_receive(&self) -> bool;
}

/// The collaborators a manager needs.
pub struct Collaborators {
    /// Outbound DCC messages and address hints
    pub server: Box<dyn ServerLink>,
    /// Destination conflicts
    pub resolver: Box<dyn ResumeResolver>,
    /// Permission checks
    pub authorizer: Box<dyn Authorizer>,
}
