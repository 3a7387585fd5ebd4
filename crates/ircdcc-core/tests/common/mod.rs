//! Common test utilities for `ircdcc` integration tests.
//!
//! Provides filesystem fixtures, recording fakes for the host collaborators,
//! and a two-sided harness that relays DCC requests between two managers
//! while pumping their I/O events.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use ircdcc_core::chat::{ChatEvent, ChatSnapshot, ChatStatus};
use ircdcc_core::config::{Config, PolicyConfig};
use ircdcc_core::host::{Collaborators, ResumeQuestion, ResumeResolver, ServerLink};
use ircdcc_core::io::IoEvent;
use ircdcc_core::manager::{TransferEvent, TransferManager};
use ircdcc_core::protocol::DccMessage;
use ircdcc_core::transfer::{ConnectionId, StatusChange, TransferId, TransferSnapshot};

/// IRC connection used by every test peer.
pub const CONNECTION: ConnectionId = 1;

/// Loopback address announced by test peers.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// How long a harness waits for a condition.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A configuration that announces the loopback address and downloads into
/// `download_dir`.
pub fn test_config(download_dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.download_dir = Some(download_dir.to_path_buf());
    config.network.own_ip = Some(LOOPBACK);
    config
}

/// One DCC request handed to the IRC side.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Connection it was sent on
    pub connection: ConnectionId,
    /// Recipient nick
    pub nick: String,
    /// The request
    pub message: DccMessage,
}

/// Records outbound DCC requests instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct RecordingServer {
    /// Everything sent so far
    pub outbox: Arc<Mutex<Vec<Outgoing>>>,
}

impl ServerLink for RecordingServer {
    fn send_dcc(
        &mut self,
        connection: ConnectionId,
        nick: &str,
        message: &DccMessage,
    ) -> ircdcc_core::Result<()> {
        self.outbox.lock().expect("outbox lock").push(Outgoing {
            connection,
            nick: nick.to_string(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// Records destination conflicts without answering them.
#[derive(Debug, Clone, Default)]
pub struct RecordingResolver {
    /// Questions asked so far
    pub questions: Arc<Mutex<Vec<ResumeQuestion>>>,
}

impl ResumeResolver for RecordingResolver {
    fn ask(&mut self, question: ResumeQuestion) {
        self.questions.lock().expect("questions lock").push(question);
    }
}

/// A manager plus everything a test needs to observe it.
pub struct Peer {
    /// Nick this peer uses on IRC
    pub nick: &'static str,
    /// The manager under test
    pub manager: TransferManager,
    /// Its I/O event channel
    pub events: mpsc::Receiver<IoEvent>,
    /// Its notifications
    pub updates: mpsc::UnboundedReceiver<TransferEvent>,
    /// DCC requests it sent
    pub outbox: Arc<Mutex<Vec<Outgoing>>>,
    /// Conflicts it asked about
    pub questions: Arc<Mutex<Vec<ResumeQuestion>>>,
    /// Snapshots of transfers that finished
    pub finished: Vec<TransferSnapshot>,
    /// Every status change seen
    pub changes: Vec<StatusChange>,
    /// Errors from dispatching relayed requests
    pub dispatch_errors: Vec<ircdcc_core::Error>,
    /// Chats registered, with whether we offered them
    pub chats_added: Vec<(TransferId, bool)>,
    /// Chat status transitions seen
    pub chat_changes: Vec<(TransferId, ChatStatus, String)>,
    /// Lines received on chats
    pub chat_lines: Vec<(TransferId, String)>,
    /// Snapshots of chats that ended
    pub chats_finished: Vec<ChatSnapshot>,
}

impl Peer {
    /// Builds a peer with the given nick and configuration.
    pub fn new(nick: &'static str, config: Config) -> Self {
        let server = RecordingServer::default();
        let resolver = RecordingResolver::default();
        let outbox = server.outbox.clone();
        let questions = resolver.questions.clone();
        let authorizer = PolicyConfig {
            allow_sending: config.policy.allow_sending,
            allow_receiving: config.policy.allow_receiving,
        };

        let (mut manager, events) = TransferManager::new(
            config,
            Collaborators {
                server: Box::new(server),
                resolver: Box::new(resolver),
                authorizer: Box::new(authorizer),
            },
        );
        let updates = manager.subscribe();

        Self {
            nick,
            manager,
            events,
            updates,
            outbox,
            questions,
            finished: Vec::new(),
            changes: Vec::new(),
            dispatch_errors: Vec::new(),
            chats_added: Vec::new(),
            chat_changes: Vec::new(),
            chat_lines: Vec::new(),
            chats_finished: Vec::new(),
        }
    }

    /// Removes and returns the DCC requests sent so far.
    pub fn take_outbox(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.outbox.lock().expect("outbox lock"))
    }

    /// Conflicts asked about so far.
    pub fn questions(&self) -> Vec<ResumeQuestion> {
        self.questions.lock().expect("questions lock").clone()
    }

    /// Collects pending notifications.
    pub fn drain_updates(&mut self) {
        while let Ok(event) = self.updates.try_recv() {
            match event {
                TransferEvent::StatusChanged(change) => self.changes.push(change),
                TransferEvent::Finished(snapshot) => self.finished.push(snapshot),
                TransferEvent::Added { .. } | TransferEvent::Queued { .. } => {}
                TransferEvent::Chat(event) => self.record_chat(event),
            }
        }
    }

    fn record_chat(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Added { id, self_opened } => self.chats_added.push((id, self_opened)),
            ChatEvent::StatusChanged {
                id, new, detail, ..
            } => self.chat_changes.push((id, new, detail)),
            ChatEvent::Line { id, text } => self.chat_lines.push((id, text)),
            ChatEvent::Finished(snapshot) => self.chats_finished.push(snapshot),
        }
    }

    /// Lines received on a chat, in order.
    pub fn lines(&self, id: TransferId) -> Vec<&str> {
        self.chat_lines
            .iter()
            .filter(|(chat, _)| *chat == id)
            .map(|(_, text)| text.as_str())
            .collect()
    }

    /// Snapshot of a chat that ended.
    pub fn chat_finished(&self, id: TransferId) -> Option<&ChatSnapshot> {
        self.chats_finished.iter().find(|s| s.id == id)
    }

    /// Current status of a live chat.
    pub fn chat_status(&self, id: TransferId) -> Option<ChatStatus> {
        self.manager.chat(id).map(|chat| chat.status())
    }

    /// Snapshot of a transfer that finished.
    pub fn finished(&self, id: TransferId) -> Option<&TransferSnapshot> {
        self.finished.iter().find(|s| s.id == id)
    }

    /// Waits for one I/O event and feeds it to the manager.
    pub async fn step(&mut self) {
        tokio::select! {
            Some(event) = self.events.recv() => self.manager.handle_io(event),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        self.drain_updates();
    }

    /// Pumps events until `done` holds.
    pub async fn run_until(&mut self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + WAIT_LIMIT;
        self.drain_updates();
        while !done(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            self.step().await;
        }
    }
}

/// Two peers whose DCC requests are relayed to each other.
pub struct Link {
    /// Usually the sender
    pub a: Peer,
    /// Usually the receiver
    pub b: Peer,
}

impl Link {
    /// Connects two peers.
    pub fn new(a: Peer, b: Peer) -> Self {
        Self { a, b }
    }

    /// Relays pending requests, then handles one I/O event of either side.
    pub async fn step(&mut self) {
        relay(&self.a, &mut self.b);
        relay(&self.b, &mut self.a);

        tokio::select! {
            Some(event) = self.a.events.recv() => self.a.manager.handle_io(event),
            Some(event) = self.b.events.recv() => self.b.manager.handle_io(event),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        self.a.drain_updates();
        self.b.drain_updates();
    }

    /// Pumps both sides until `done` holds.
    pub async fn run_until(&mut self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + WAIT_LIMIT;
        while !done(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            self.step().await;
        }
    }
}

fn relay(from: &Peer, to: &mut Peer) {
    for outgoing in from.take_outbox() {
        if outgoing.nick != to.nick {
            continue;
        }
        if let Err(e) = to
            .manager
            .handle_message(CONNECTION, from.nick, &outgoing.message)
        {
            to.dispatch_errors.push(e);
        }
    }
    to.drain_updates();
}

/// Registers and queues an upload of `path` to `nick`.
pub fn offer_upload(peer: &mut Peer, nick: &str, path: &Path) -> TransferId {
    let id = peer.manager.new_upload();
    let upload = peer.manager.upload_mut(id).expect("upload registered");
    upload.info_mut().set_connection_id(CONNECTION);
    upload.info_mut().set_partner_nick(nick);
    upload.set_file_path(path.to_path_buf());
    assert!(peer.manager.queue(id), "upload should queue");
    id
}

/// Registers and queues a download offered by `nick` on `port`.
pub fn expect_download(peer: &mut Peer, nick: &str, name: &str, port: u16, size: u64) -> TransferId {
    let id = peer.manager.new_download();
    let download = peer.manager.download_mut(id).expect("download registered");
    download.info_mut().set_connection_id(CONNECTION);
    download.info_mut().set_partner_nick(nick);
    download.set_partner_ip(LOOPBACK);
    download.set_partner_port(port);
    download.set_file_name(name);
    download.set_file_size(size);
    assert!(peer.manager.queue(id), "download should queue");
    id
}
