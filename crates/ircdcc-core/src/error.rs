//! Error types for ircdcc.
//!
//! This module provides a unified error type for all DCC operations,
//! with specific error variants for different failure modes and a coarse
//! [`ErrorKind`] classification used when a transfer fails.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// A specialized `Result` type for ircdcc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure.
///
/// Every transfer that ends in `Failed` records one of these so observers can
/// tell a refused offer apart from a dropped socket without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Refused by local policy or by the input itself (authorization,
    /// zero-size file, missing name).
    PolicyRejection,
    /// A local resource ran out (no vacant port, no usable address).
    ResourceExhaustion,
    /// The peer said something that does not fit the negotiation.
    ProtocolViolation,
    /// Socket error, disconnect or timeout.
    TransportFailure,
    /// Disk read or write failed.
    StorageFailure,
    /// Bad configuration.
    Configuration,
    /// Anything else.
    Internal,
}

/// The main error type for ircdcc.
#[derive(Error, Debug)]
pub enum Error {
    /// Sending or receiving is disabled by policy
    #[error("The admin has restricted the right to {0} files")]
    NotAuthorized(&'static str),

    /// Refusing to send an empty file
    #[error("Unable to send a 0 byte file.")]
    EmptyFile,

    /// Offer with an unknown or zero size
    #[error("Unsupported negotiation (filesize={0})")]
    UnsupportedSize(u64),

    /// A required field was not set before queueing
    #[error("{0}")]
    MissingField(&'static str),

    /// The peer announced an unusable address
    #[error("Invalid sender address ({0})")]
    InvalidAddress(String),

    /// Source file for an upload does not exist
    #[error("The file \"{}\" does not exist", .0.display())]
    SourceMissing(PathBuf),

    /// No port in the configured range could be bound
    #[error("No vacant port in range {first}-{last}")]
    NoVacantPort {
        /// First port of the range
        first: u16,
        /// Last port of the range
        last: u16,
    },

    /// The OS refused to open a listening socket
    #[error("Could not open a socket: {0}")]
    ListenFailed(String),

    /// Own address could not be determined
    #[error("Could not determine own IP address")]
    NoOwnAddress,

    /// Peer accepted a resume at a different position
    #[error("Unexpected response from remote host (expected position {expected}, got {actual})")]
    ResumeMismatch {
        /// Position we asked for
        expected: u64,
        /// Position the peer answered with
        actual: u64,
    },

    /// Peer sent more bytes than announced
    #[error("Transfer error: received {received} bytes but only {expected} were announced")]
    Overrun {
        /// Bytes received so far
        received: u64,
        /// Announced file size
        expected: u64,
    },

    /// A negotiation message matched no pending transfer
    #[error("No pending transfer matches DCC {command} \"{file}\" from {nick}")]
    UnmatchedMessage {
        /// DCC command name
        command: &'static str,
        /// Partner nick
        nick: String,
        /// File name in the message
        file: String,
    },

    /// Malformed DCC message
    #[error("Malformed DCC message: {0}")]
    Parse(String),

    /// Recognized but unsupported DCC message
    #[error("Unsupported DCC request: {0}")]
    Unsupported(String),

    /// The peer refused our offer (`SEND` or `Chat`)
    #[error("DCC {0} request was rejected")]
    Rejected(&'static str),

    /// Negotiation timed out
    #[error("Timed out")]
    Timeout,

    /// Socket error during negotiation or transfer
    #[error("Socket error: {0}")]
    Socket(String),

    /// The connection closed before the transfer completed
    #[error("Remote host closed the connection at {position} of {size} bytes")]
    ConnectionClosed {
        /// Position reached when the socket closed
        position: u64,
        /// Expected size
        size: u64,
    },

    /// Could not talk to the IRC server
    #[error("Could not send {0} to the partner via the IRC server")]
    ServerUnavailable(&'static str),

    /// Disk write failed
    #[error("Write error: {0}")]
    Write(String),

    /// Disk read failed
    #[error("Read error: {0}")]
    Read(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A transfer reached a state its own bookkeeping rules out
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthorized(_)
            | Self::EmptyFile
            | Self::UnsupportedSize(_)
            | Self::MissingField(_)
            | Self::InvalidAddress(_)
            | Self::SourceMissing(_)
            | Self::Rejected(_) => ErrorKind::PolicyRejection,
            Self::NoVacantPort { .. }
            | Self::ListenFailed(_)
            | Self::NoOwnAddress => ErrorKind::ResourceExhaustion,
            Self::ResumeMismatch { .. }
            | Self::Overrun { .. }
            | Self::UnmatchedMessage { .. }
            | Self::Parse(_)
            | Self::Unsupported(_) => ErrorKind::ProtocolViolation,
            Self::Timeout
            | Self::Socket(_)
            | Self::ConnectionClosed { .. }
            | Self::ServerUnavailable(_) => ErrorKind::TransportFailure,
            Self::Write(_) | Self::Read(_) | Self::Io(_) => ErrorKind::StorageFailure,
            Self::ConfigError(_) | Self::InvalidConfig { .. } => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NoVacantPort { .. } => Some(
                "Widen [network] port_range in the config file,\n\
                 or remove it to let the OS pick a port",
            ),
            Self::NoOwnAddress => Some(
                "Set [network] own_ip in the config file to the address\n\
                 your peers can reach you on",
            ),
            Self::Timeout => Some(
                "The peer did not answer. If you are behind NAT, try a passive\n\
                 offer (--passive) so the peer listens instead",
            ),
            Self::NotAuthorized(_) => Some("Check the [policy] section of the config file"),
            _ => None,
        }
    }
}
