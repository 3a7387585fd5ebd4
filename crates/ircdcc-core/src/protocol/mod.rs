//! DCC wire grammar.
//!
//! DCC negotiation travels as CTCP requests over an IRC connection; the
//! payload travels over a direct TCP socket. This module owns the token
//! grammar of the negotiation messages and the in-band acknowledgement codec.
//! Framing the CTCP envelope (`\x01...\x01`, PRIVMSG/NOTICE) is left to the
//! IRC layer, although [`DccMessage::parse`] tolerates the delimiters.
//!
//! ## Messages
//!
//! ```text
//! DCC SEND <name> <ip> <port> <size>            active offer
//! DCC SEND <name> <ip> 0 <size> <token>         passive offer
//! DCC SEND <name> <ip> <port> <size> <token>    reverse acknowledgement
//! DCC ACCEPT <name> <port> <position> [token]   resume accepted
//! DCC RESUME <name> <port> <position> [token]   resume requested
//! DCC CHAT chat <ip> <port> [token]             chat offer
//! DCC REJECT SEND <name>                        offer refused
//! DCC REJECT CHAT chat                          chat refused
//! ```
//!
//! `<ip>` is the IPv4 address as an unsigned 32-bit decimal, or an IPv6
//! address in text form. Names containing spaces are quoted.
//!
//! ## Acknowledgement
//!
//! After every read the receiver writes the cumulative byte count back over
//! the data socket as a 4-byte integer. Only the low 32 bits are carried.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::common::{numerical_ip_to_text, text_ip_to_numerical};
use crate::error::{Error, Result};

/// CTCP delimiter byte.
pub const CTCP_DELIMITER: char = '\u{1}';

/// Size of the in-band acknowledgement.
pub const ACK_SIZE: usize = 4;

/// Name used when an offer carries no usable file name.
pub const UNNAMED_FILE: &str = "unnamed_file";

/// Byte order of the 4-byte acknowledgement.
///
/// Most clients send network order. A few historical clients used host
/// order on little-endian machines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckByteOrder {
    /// Network byte order
    #[default]
    BigEndian,
    /// Intel byte order
    LittleEndian,
}

/// Encodes the low 32 bits of `position` as an acknowledgement.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn encode_ack(position: u64, order: AckByteOrder) -> [u8; ACK_SIZE] {
    let low = position as u32;
    match order {
        AckByteOrder::BigEndian => low.to_be_bytes(),
        AckByteOrder::LittleEndian => low.to_le_bytes(),
    }
}

/// Decodes an acknowledgement.
#[must_use]
pub const fn decode_ack(bytes: [u8; ACK_SIZE], order: AckByteOrder) -> u32 {
    match order {
        AckByteOrder::BigEndian => u32::from_be_bytes(bytes),
        AckByteOrder::LittleEndian => u32::from_le_bytes(bytes),
    }
}

/// Reconstructs a full position from a 32-bit acknowledgement.
///
/// `sent` is the number of bytes actually written; the result is the largest
/// value not above `sent` whose low 32 bits equal `ack`.
#[must_use]
pub const fn widen_ack(ack: u32, sent: u64) -> u64 {
    const SPAN: u64 = 1 << 32;
    let candidate = (sent & !(SPAN - 1)) | ack as u64;
    if candidate > sent && candidate >= SPAN {
        candidate - SPAN
    } else {
        candidate
    }
}

/// A DCC negotiation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DccMessage {
    /// File offer, passive offer, or reverse acknowledgement (see
    /// [`DccMessage::send_kind`]).
    Send {
        /// Offered file name, unquoted
        file_name: String,
        /// Address of the listening side
        address: IpAddr,
        /// Listening port, zero for a passive offer
        port: u16,
        /// File size in bytes
        size: u64,
        /// Reverse token
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Resume accepted by the sender.
    Accept {
        /// File name, unquoted
        file_name: String,
        /// Port of the original offer, zero for passive
        port: u16,
        /// Accepted resume position
        position: u64,
        /// Reverse token
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Resume requested by the receiver.
    Resume {
        /// File name, unquoted
        file_name: String,
        /// Port of the original offer, zero for passive
        port: u16,
        /// Requested resume position
        position: u64,
        /// Reverse token
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Chat offer.
    Chat {
        /// Address of the listening side
        address: IpAddr,
        /// Listening port, zero for a passive offer
        port: u16,
        /// Reverse token
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// The receiver refused a file offer.
    Reject {
        /// File name, unquoted
        file_name: String,
    },
    /// The partner refused a chat offer.
    RejectChat,
}

/// How a `DCC SEND` should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// The sender listens; connect to it.
    Active,
    /// The sender cannot listen; reply with our own address.
    Passive,
    /// The reply to our passive offer; connect to the receiver.
    ReverseAck,
}

impl DccMessage {
    /// Classifies a `Send` message. Returns `None` for other commands.
    #[must_use]
    pub const fn send_kind(&self) -> Option<SendKind> {
        match self {
            Self::Send { token: None, .. } => Some(SendKind::Active),
            Self::Send {
                port: 0,
                token: Some(_),
                ..
            } => Some(SendKind::Passive),
            Self::Send { token: Some(_), .. } => Some(SendKind::ReverseAck),
            _ => None,
        }
    }

    /// Name of the DCC command.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Send { .. } => "SEND",
            Self::Accept { .. } => "ACCEPT",
            Self::Resume { .. } => "RESUME",
            Self::Chat { .. } => "CHAT",
            Self::Reject { .. } | Self::RejectChat => "REJECT",
        }
    }

    /// Parses the body of a DCC CTCP request (`DCC SEND ...`).
    ///
    /// Surrounding CTCP delimiters and whitespace are ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim().trim_matches(CTCP_DELIMITER).trim();
        let (head, rest) = split_word(line);
        if !head.eq_ignore_ascii_case("DCC") {
            return Err(Error::Parse(format!("not a DCC request: {line}")));
        }
        let (command, rest) = split_word(rest);
        let command = command.to_ascii_uppercase();

        if command == "REJECT" {
            let (kind, name) = split_word(rest);
            if kind.eq_ignore_ascii_case("CHAT") {
                return Ok(Self::RejectChat);
            }
            if !kind.eq_ignore_ascii_case("SEND") {
                return Err(Error::Unsupported(format!("REJECT {kind}")));
            }
            if name.is_empty() {
                return Err(Error::Parse("REJECT without a file name".to_string()));
            }
            return Ok(Self::Reject {
                file_name: clean_file_name(name),
            });
        }

        let args = split_arguments(rest);
        let n = args.len();
        match command.as_str() {
            "SEND" => {
                if n < 4 {
                    return Err(Error::Parse(format!("SEND needs 4 arguments, got {n}")));
                }
                if n == 4 {
                    return Ok(Self::Send {
                        file_name: recover_file_name(&args, 3),
                        address: parse_address(&args[1])?,
                        port: parse_port(&args[2])?,
                        size: parse_number(&args[3], "size")?,
                        token: None,
                    });
                }
                Ok(Self::Send {
                    file_name: recover_file_name(&args, 4),
                    address: parse_address(&args[n - 4])?,
                    port: parse_port(&args[n - 3])?,
                    size: parse_number(&args[n - 2], "size")?,
                    token: Some(args[n - 1].clone()),
                })
            }
            "ACCEPT" | "RESUME" => {
                if n < 3 {
                    return Err(Error::Parse(format!(
                        "{command} needs 3 arguments, got {n}"
                    )));
                }
                let (file_name, port, position, token) = if n >= 4 && args[n - 3] == "0" {
                    (
                        recover_file_name(&args, 3),
                        0,
                        parse_number(&args[n - 2], "position")?,
                        Some(args[n - 1].clone()),
                    )
                } else {
                    (
                        recover_file_name(&args, 2),
                        parse_port(&args[n - 2])?,
                        parse_number(&args[n - 1], "position")?,
                        None,
                    )
                };
                Ok(if command == "ACCEPT" {
                    Self::Accept {
                        file_name,
                        port,
                        position,
                        token,
                    }
                } else {
                    Self::Resume {
                        file_name,
                        port,
                        position,
                        token,
                    }
                })
            }
            "CHAT" if n > 0 && !args[0].eq_ignore_ascii_case("chat") => {
                Err(Error::Unsupported(format!("CHAT {}", args[0])))
            }
            "CHAT" => match n {
                3 => Ok(Self::Chat {
                    address: parse_address(&args[1])?,
                    port: parse_port(&args[2])?,
                    token: None,
                }),
                4 => Ok(Self::Chat {
                    address: parse_address(&args[1])?,
                    port: parse_port(&args[2])?,
                    token: Some(args[3].clone()),
                }),
                _ => Err(Error::Parse(format!("CHAT needs 3 or 4 arguments, got {n}"))),
            },
            _ => Err(Error::Unsupported(command)),
        }
    }
}

impl fmt::Display for DccMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send {
                file_name,
                address,
                port,
                size,
                token,
            } => {
                write!(
                    f,
                    "DCC SEND {} {} {port} {size}",
                    quote_file_name(file_name),
                    text_ip_to_numerical(*address)
                )?;
                write_token(f, token.as_deref())
            }
            Self::Accept {
                file_name,
                port,
                position,
                token,
            } => {
                write!(f, "DCC ACCEPT {} {port} {position}", quote_file_name(file_name))?;
                write_token(f, token.as_deref())
            }
            Self::Resume {
                file_name,
                port,
                position,
                token,
            } => {
                write!(f, "DCC RESUME {} {port} {position}", quote_file_name(file_name))?;
                write_token(f, token.as_deref())
            }
            Self::Chat {
                address,
                port,
                token,
            } => {
                write!(f, "DCC CHAT chat {} {port}", text_ip_to_numerical(*address))?;
                write_token(f, token.as_deref())
            }
            Self::Reject { file_name } => {
                write!(f, "DCC REJECT SEND {}", quote_file_name(file_name))
            }
            Self::RejectChat => f.write_str("DCC REJECT CHAT chat"),
        }
    }
}

fn write_token(f: &mut fmt::Formatter<'_>, token: Option<&str>) -> fmt::Result {
    match token {
        Some(token) => write!(f, " {token}"),
        None => Ok(()),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(at) => (&s[..at], s[at..].trim_start()),
        None => (s, ""),
    }
}

/// Splits arguments, keeping a leading quoted file name as one argument.
fn split_arguments(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut tail = rest;
    if rest.starts_with('"') && rest.matches('"').count() >= 2 {
        if let Some(last) = rest.rfind('"') {
            if rest[last + 1..].starts_with(' ') {
                args.push(rest[1..last].to_string());
                tail = &rest[last + 1..];
            }
        }
    }
    args.extend(tail.split_whitespace().map(str::to_string));
    args
}

/// Rebuilds a file name that may have been split on spaces, given how many
/// fixed arguments follow it.
fn recover_file_name(args: &[String], trailing: usize) -> String {
    let name_parts = args.len().saturating_sub(trailing).max(1);
    clean_file_name(&args[..name_parts].join(" "))
}

fn parse_address(text: &str) -> Result<IpAddr> {
    numerical_ip_to_text(text).ok_or_else(|| Error::Parse(format!("invalid address '{text}'")))
}

/// Parses a port, rejecting anything above 65535.
pub fn parse_port(text: &str) -> Result<u16> {
    text.parse::<u16>()
        .map_err(|_| Error::Parse(format!("invalid port '{text}'")))
}

fn parse_number(text: &str, what: &str) -> Result<u64> {
    text.parse::<u64>()
        .map_err(|_| Error::Parse(format!("invalid {what} '{text}'")))
}

/// Strips any number of surrounding double quotes.
#[must_use]
pub fn clean_file_name(name: &str) -> String {
    let mut name = name;
    while name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name = &name[1..name.len() - 1];
    }
    name.to_string()
}

/// Quotes a file name for the wire when it contains a space.
#[must_use]
pub fn quote_file_name(name: &str) -> String {
    if name.contains(' ') && !(name.len() >= 2 && name.starts_with('"') && name.ends_with('"')) {
        format!("\"{name}\"")
    } else {
        name.to_string()
    }
}

/// Makes a peer-supplied name safe to use as a local file name.
///
/// Keeps only the last path component, refuses hidden-file names by
/// replacing the leading dot, drops control characters, and falls back to
/// [`UNNAMED_FILE`].
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return UNNAMED_FILE.to_string();
    }
    if cleaned.starts_with('.') {
        cleaned.replace_range(..1, "_");
    }
    cleaned
}
