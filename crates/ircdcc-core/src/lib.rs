//! # ircdcc Core Library
//!
//! `ircdcc-core` implements the file transfer and chat parts of IRC's Direct
//! Client Connection (DCC) protocol: negotiating offers over an existing IRC
//! session, then moving the file or the conversation to a direct TCP
//! connection.
//!
//! ## Features
//!
//! - **Active and passive offers**: either side may listen, with a token
//!   matching the answer to a passive offer
//! - **Resume**: partial downloads continue with `DCC RESUME` / `DCC ACCEPT`
//! - **Flow control**: acknowledged or pipelined sending with 4-byte
//!   acknowledgements, including files past 4 GiB
//! - **Write-behind**: downloads never wait on the disk
//! - **Chat**: `DCC CHAT` sessions, active or passive, carrying text lines
//!
//! ## Modules
//!
//! - [`chat`] - DCC chat sessions
//! - [`common`] - Address conversion, own-address policy, listening sockets
//! - [`config`] - Configuration management
//! - [`host`] - Interfaces the embedding IRC client implements
//! - [`io`] - Background socket, disk and timer tasks
//! - [`manager`] - Registry of live transfers and message dispatch
//! - [`protocol`] - DCC wire grammar
//! - [`transfer`] - Send and receive state machines
//!
//! ## Example
//!
//! ```rust,ignore
//! use ircdcc_core::manager::TransferManager;
//!
//! let (mut manager, mut events) = TransferManager::new(config, collaborators);
//! let id = manager.new_upload();
//! if let Some(upload) = manager.upload_mut(id) {
//!     upload.info_mut().set_connection_id(1);
//!     upload.info_mut().set_partner_nick("alice");
//!     upload.set_file_path("report.pdf".into());
//! }
//! if manager.queue(id) {
//!     manager.start(id);
//! }
//! while let Some(event) = events.recv().await {
//!     manager.handle_io(event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_self)]

pub mod chat;
pub mod common;
pub mod config;
pub mod error;
pub mod host;
pub mod io;
pub mod manager;
pub mod protocol;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default send chunk size (16 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default time an offer waits for the peer, in seconds
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 180;

/// Timeout of the resume and passive negotiation phases, in seconds
pub const NEGOTIATION_TIMEOUT_SECS: u64 = 30;

/// Default interval between speed samples, in milliseconds
pub const SPEED_SAMPLE_INTERVAL_MS: u64 = 100;
