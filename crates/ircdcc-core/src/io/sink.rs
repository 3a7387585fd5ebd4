//! Asynchronous disk sink for downloads.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{post, IoEvent, IoEventKind};
use crate::transfer::write_cache::WriteSink;
use crate::transfer::TransferId;

/// How to open a download destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    /// Create, but report an existing non-empty file instead of touching it
    Create,
    /// Create or truncate
    Overwrite,
    /// Keep the first `n` bytes and append after them
    Resume(u64),
}

/// What the sink reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Destination open and ready for data
    Opened,
    /// A shorter file already exists; the sink closed without touching it
    Partial(u64),
    /// A file at least as large as the offer already exists
    Exists(u64),
    /// The destination folder could not be created
    FolderFailed(String),
    /// The destination could not be opened
    OpenFailed(String),
    /// One buffer has been written; ready for the next
    Written,
    /// Everything written and synced
    Flushed,
    /// A write failed; the sink is gone
    Failed(String),
}

#[derive(Debug)]
enum SinkCommand {
    Write(Vec<u8>),
    Finish,
}

/// Handle to the background task that owns the destination file.
///
/// Dropping the handle lets the task drain what it was already given and
/// exit. [`FileSink::kill`] stops it at once.
#[derive(Debug)]
pub(crate) struct FileSink {
    commands: mpsc::UnboundedSender<SinkCommand>,
    task: JoinHandle<()>,
}

impl FileSink {
    pub(super) fn spawn(
        tx: mpsc::Sender<IoEvent>,
        id: TransferId,
        path: PathBuf,
        mode: OpenMode,
        offered_size: u64,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(tx, id, path, mode, offered_size, rx));
        Self { commands, task }
    }

    /// Stops the task without flushing.
    pub fn kill(&self) {
        self.task.abort();
    }
}

impl WriteSink for FileSink {
    fn send(&mut self, data: Vec<u8>) {
        let _ = self.commands.send(SinkCommand::Write(data));
    }

    fn finish(&mut self) {
        let _ = self.commands.send(SinkCommand::Finish);
    }
}

async fn run(
    tx: mpsc::Sender<IoEvent>,
    id: TransferId,
    path: PathBuf,
    mode: OpenMode,
    offered_size: u64,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
) {
    let report = |event| post(&tx, id, IoEventKind::Sink(event));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent).await {
            report(SinkEvent::FolderFailed(format!("{}: {e}", parent.display()))).await;
            return;
        }
    }

    let mut file = match open(&path, mode, offered_size).await {
        Ok(Ok(file)) => file,
        Ok(Err(event)) | Err(event) => {
            report(event).await;
            return;
        }
    };
    report(SinkEvent::Opened).await;

    while let Some(command) = commands.recv().await {
        match command {
            SinkCommand::Write(data) => {
                let result = match file.write_all(&data).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => report(SinkEvent::Written).await,
                    Err(e) => {
                        report(SinkEvent::Failed(e.to_string())).await;
                        return;
                    }
                }
            }
            SinkCommand::Finish => {
                let result = match file.flush().await {
                    Ok(()) => file.sync_all().await,
                    Err(e) => Err(e),
                };
                report(match result {
                    Ok(()) => SinkEvent::Flushed,
                    Err(e) => SinkEvent::Failed(e.to_string()),
                })
                .await;
                return;
            }
        }
    }

    // Abandoned by the transfer.
    let _ = file.flush().await;
}

/// Opens the destination. The outer error is a hard failure, the inner one
/// an existing file that needs a decision.
async fn open(
    path: &Path,
    mode: OpenMode,
    offered_size: u64,
) -> Result<Result<File, SinkEvent>, SinkEvent> {
    let failed = |e: std::io::Error| SinkEvent::OpenFailed(format!("{}: {e}", path.display()));

    match mode {
        OpenMode::Create => {
            match fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => {
                    return Err(SinkEvent::OpenFailed(format!(
                        "{} is a folder",
                        path.display()
                    )))
                }
                Ok(meta) if meta.len() > 0 => {
                    let size = meta.len();
                    return Ok(Err(if size < offered_size {
                        SinkEvent::Partial(size)
                    } else {
                        SinkEvent::Exists(size)
                    }));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(failed(e)),
            }
            truncate(path).await.map(Ok).map_err(failed)
        }
        OpenMode::Overwrite => truncate(path).await.map(Ok).map_err(failed),
        OpenMode::Resume(offset) => {
            let mut file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(failed)?;
            let len = file.metadata().await.map_err(failed)?.len();
            if len < offset {
                return Err(SinkEvent::OpenFailed(format!(
                    "{} shrank to {len} bytes, cannot resume at {offset}",
                    path.display()
                )));
            }
            file.set_len(offset).await.map_err(failed)?;
            file.seek(SeekFrom::Start(offset)).await.map_err(failed)?;
            Ok(Ok(file))
        }
    }
}

async fn truncate(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}
