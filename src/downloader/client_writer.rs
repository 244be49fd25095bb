// downloader/client_writer.rs

#![forbid(unsafe_code)]

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::downloader::common::{DownloadError, Result};
use crate::downloader::queue::QueueReceiver;
use crate::task::Range;

#[derive(Debug)]
pub enum WriterCommand {
    /// Write `content` at the start of `range`.
    Piece { range: Range, content: Bytes },
    /// No more pieces, flush and stop.
    Finish,
}

/// Drains the client queue into the temporary task file.
pub struct ClientWriter {
    path: PathBuf,
    file: File,
    queue: QueueReceiver<WriterCommand>,
    written: u64,
}

impl ClientWriter {
    pub async fn create(path: &Path, queue: QueueReceiver<WriterCommand>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            queue,
            written: 0,
        })
    }

    /// Runs until the finish command. Returns the number of bytes written.
    pub async fn run(mut self) -> Result<u64> {
        while let Some(cmd) = self.queue.recv().await {
            match cmd {
                WriterCommand::Piece { range, content } => {
                    if content.len() as u64 != range.size() {
                        return Err(DownloadError::Piece {
                            range: range.to_string(),
                            reason: format!("got {} bytes", content.len()),
                        });
                    }
                    self.file.seek(SeekFrom::Start(range.start)).await?;
                    self.file.write_all(&content).await?;
                    self.written += content.len() as u64;
                    debug!(%range, "piece written");
                }
                WriterCommand::Finish => {
                    self.file.flush().await?;
                    self.file.sync_all().await?;
                    info!(path = %self.path.display(), written = self.written, "client writer finished");
                    return Ok(self.written);
                }
            }
        }
        Err(DownloadError::Internal(
            "client queue closed before finish".into(),
        ))
    }
}
