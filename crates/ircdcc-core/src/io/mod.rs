//! Socket, disk and timer work for the transfer state machines.
//!
//! The state machines never await. Every slow operation runs in a spawned
//! tokio task that owns its socket, file or timer and reports back by posting
//! an [`IoEvent`] into one channel. Whoever owns the
//! [`TransferManager`](crate::manager::TransferManager) drains that channel
//! and feeds each event to
//! [`TransferManager::handle_io`](crate::manager::TransferManager::handle_io),
//! so all transfer state is mutated from one place, one event at a time.
//!
//! Handles returned from here abort their task when dropped. A transfer that
//! is aborted or finished drops its handles, and the manager discards events
//! that arrive for transfers it no longer knows.

mod sink;

pub(crate) use sink::{FileSink, OpenMode};
pub use sink::SinkEvent;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common;
use crate::error::Result;
use crate::transfer::TransferId;

/// Read buffer for data sockets.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Something finished for a transfer.
#[derive(Debug)]
pub struct IoEvent {
    /// Transfer the event belongs to
    pub transfer: TransferId,
    /// What happened
    pub kind: IoEventKind,
}

/// The kinds of completion a transfer can receive.
#[derive(Debug)]
pub enum IoEventKind {
    /// A peer connected to our listening socket
    Accepted(TcpStream),
    /// The listening socket failed
    AcceptFailed(String),
    /// Our outbound connection succeeded
    Connected(TcpStream),
    /// Our outbound connection failed
    ConnectFailed(String),
    /// Bytes arrived on the data socket
    Received(Vec<u8>),
    /// The peer closed the data socket
    Closed,
    /// Reading or writing the data socket failed
    SocketError(String),
    /// The upload pump wrote this many bytes to the socket
    Sent(usize),
    /// The upload source ended before the announced size
    SourceEnded,
    /// The upload source could not be opened or read
    SourceError(String),
    /// The download sink reported progress
    Sink(SinkEvent),
    /// A timer armed with this generation expired
    TimedOut(u64),
}

/// Aborts the task it wraps when dropped.
#[derive(Debug)]
pub(crate) struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns I/O tasks that report into one event channel.
#[derive(Debug, Clone)]
pub struct IoDriver {
    tx: mpsc::Sender<IoEvent>,
    keepalive: bool,
}

impl IoDriver {
    /// Creates a driver and the receiving end of its event channel.
    #[must_use]
    pub fn channel(capacity: usize, keepalive: bool) -> (Self, mpsc::Receiver<IoEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, keepalive }, rx)
    }

    /// Binds a listening socket for peers told to reach us at `own_ip` and
    /// waits in the background for one of them.
    pub(crate) fn listen(
        &self,
        id: TransferId,
        own_ip: Option<IpAddr>,
        port_range: Option<(u16, u16)>,
    ) -> Result<Listener> {
        let std_listener = common::bind_listener(own_ip, port_range)?;
        let port = std_listener.local_addr()?.port();
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            let kind = match TcpListener::from_std(std_listener) {
                Ok(listener) => match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(transfer_id = %id, %peer, "accepted data connection");
                        IoEventKind::Accepted(stream)
                    }
                    Err(e) => IoEventKind::AcceptFailed(e.to_string()),
                },
                Err(e) => IoEventKind::AcceptFailed(e.to_string()),
            };
            post(&tx, id, kind).await;
        });

        tracing::debug!(transfer_id = %id, port, "listening for data connection");
        Ok(Listener {
            port,
            _task: TaskGuard(task),
        })
    }

    /// Connects to a peer in the background.
    pub(crate) fn connect(&self, id: TransferId, addr: SocketAddr) -> TaskGuard {
        let tx = self.tx.clone();
        TaskGuard(tokio::spawn(async move {
            let kind = match TcpStream::connect(addr).await {
                Ok(stream) => IoEventKind::Connected(stream),
                Err(e) => IoEventKind::ConnectFailed(format!("Could not connect to {addr}: {e}")),
            };
            post(&tx, id, kind).await;
        }))
    }

    /// Arms a one-shot timer.
    pub(crate) fn timer(&self, id: TransferId, after: Duration, generation: u64) -> TaskGuard {
        let tx = self.tx.clone();
        TaskGuard(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            post(&tx, id, IoEventKind::TimedOut(generation)).await;
        }))
    }

    /// Takes over a connected socket for a download.
    pub(crate) fn attach_download(&self, id: TransferId, stream: TcpStream) -> DataSocket {
        self.attach_duplex(id, stream)
    }

    /// Takes over a connected socket for a chat session.
    pub(crate) fn attach_chat(&self, id: TransferId, stream: TcpStream) -> DataSocket {
        self.attach_duplex(id, stream)
    }

    fn attach_duplex(&self, id: TransferId, stream: TcpStream) -> DataSocket {
        self.tune(id, &stream);
        let (read_half, write_half) = stream.into_split();
        let reader = self.spawn_reader(id, read_half);

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let tx = self.tx.clone();
        // Not aborted on drop so the final acknowledgement or chat line still
        // goes out.
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    post(&tx, id, IoEventKind::SocketError(e.to_string())).await;
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        DataSocket {
            reader: Some(reader),
            writer: writer_tx,
        }
    }

    /// Takes over a connected socket for an upload of `source` from `offset`.
    pub(crate) fn attach_upload(
        &self,
        id: TransferId,
        stream: TcpStream,
        source: PathBuf,
        offset: u64,
        chunk_size: usize,
    ) -> Upload {
        self.tune(id, &stream);
        let (read_half, write_half) = stream.into_split();
        let reader = self.spawn_reader(id, read_half);

        let (next_tx, next_rx) = mpsc::unbounded_channel();
        let tx = self.tx.clone();
        let pump = tokio::spawn(pump_source(
            tx,
            id,
            write_half,
            source,
            offset,
            chunk_size.max(1),
            next_rx,
        ));

        Upload {
            _reader: reader,
            _pump: TaskGuard(pump),
            next: next_tx,
        }
    }

    /// Opens a download destination in the background.
    pub(crate) fn open_sink(
        &self,
        id: TransferId,
        path: PathBuf,
        mode: OpenMode,
        offered_size: u64,
    ) -> FileSink {
        FileSink::spawn(self.tx.clone(), id, path, mode, offered_size)
    }

    fn tune(&self, id: TransferId, stream: &TcpStream) {
        let _ = stream.set_nodelay(true);
        if self.keepalive {
            if let Err(e) = common::configure_tcp_keepalive(stream) {
                tracing::debug!(transfer_id = %id, error = %e, "could not enable keep-alive");
            }
        }
    }

    fn spawn_reader(&self, id: TransferId, mut read_half: OwnedReadHalf) -> TaskGuard {
        let tx = self.tx.clone();
        TaskGuard(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        post(&tx, id, IoEventKind::Closed).await;
                        break;
                    }
                    Ok(n) => post(&tx, id, IoEventKind::Received(buf[..n].to_vec())).await,
                    Err(e) => {
                        post(&tx, id, IoEventKind::SocketError(e.to_string())).await;
                        break;
                    }
                }
            }
        }))
    }
}

async fn post(tx: &mpsc::Sender<IoEvent>, transfer: TransferId, kind: IoEventKind) {
    if tx.send(IoEvent { transfer, kind }).await.is_err() {
        tracing::trace!(transfer_id = %transfer, "event channel closed");
    }
}

/// Reads the source one chunk per request and writes it out in full.
async fn pump_source(
    tx: mpsc::Sender<IoEvent>,
    id: TransferId,
    mut write_half: OwnedWriteHalf,
    source: PathBuf,
    offset: u64,
    chunk_size: usize,
    mut next: mpsc::UnboundedReceiver<()>,
) {
    let mut file = match tokio::fs::File::open(&source).await {
        Ok(file) => file,
        Err(e) => {
            let message = format!("Could not open \"{}\": {e}", source.display());
            post(&tx, id, IoEventKind::SourceError(message)).await;
            return;
        }
    };
    if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
        post(&tx, id, IoEventKind::SourceError(e.to_string())).await;
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    while next.recv().await.is_some() {
        match file.read(&mut buf).await {
            Ok(0) => post(&tx, id, IoEventKind::SourceEnded).await,
            Ok(n) => {
                if let Err(e) = write_half.write_all(&buf[..n]).await {
                    post(&tx, id, IoEventKind::SocketError(e.to_string())).await;
                    return;
                }
                post(&tx, id, IoEventKind::Sent(n)).await;
            }
            Err(e) => {
                post(&tx, id, IoEventKind::SourceError(e.to_string())).await;
                return;
            }
        }
    }
    let _ = write_half.shutdown().await;
}

/// A listening socket waiting for one peer.
#[derive(Debug)]
pub(crate) struct Listener {
    pub port: u16,
    _task: TaskGuard,
}

/// A connected download socket: reads in the background, writes acks.
#[derive(Debug)]
pub(crate) struct DataSocket {
    reader: Option<TaskGuard>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
}

impl DataSocket {
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.writer.send(bytes);
    }

    pub fn stop_reading(&mut self) {
        self.reader = None;
    }
}

/// A connected upload socket.
#[derive(Debug)]
pub(crate) struct Upload {
    _reader: TaskGuard,
    _pump: TaskGuard,
    next: mpsc::UnboundedSender<()>,
}

impl Upload {
    /// Asks the pump for one more chunk.
    pub fn request_chunk(&self) {
        let _ = self.next.send(());
    }
}

/// A restartable connection-timeout timer.
///
/// Each arm bumps the generation so a timeout that was already queued when
/// the timer was stopped is recognized as stale.
#[derive(Debug, Default)]
pub(crate) struct Deadline {
    guard: Option<TaskGuard>,
    generation: u64,
}

impl Deadline {
    pub fn arm(&mut self, io: &IoDriver, id: TransferId, after: Duration) {
        self.generation += 1;
        self.guard = Some(io.timer(id, after, self.generation));
    }

    pub fn stop(&mut self) {
        if self.guard.take().is_some() {
            self.generation += 1;
        }
    }

    /// True if `generation` is the live timer; disarms it.
    pub fn expired(&mut self, generation: u64) -> bool {
        if self.guard.is_some() && generation == self.generation {
            self.guard = None;
            true
        } else {
            false
        }
    }
}
