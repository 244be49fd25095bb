// downloader/power_client.rs

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, warn};

use crate::downloader::client_writer::WriterCommand;
use crate::downloader::common::{DownloadError, Result};
use crate::downloader::piece::PieceItem;
use crate::downloader::queue::QueueSender;
use crate::supernode::types::{PieceResult, PieceTask, TaskStatus};
use crate::task::{Piece, Range};

lazy_static::lazy_static! {
    static ref DEFAULT_CLIENT: Client = Client::new();
}

/// Moves the bytes of one piece from a peer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PieceFetcher: Send + Sync {
    async fn fetch(&self, task: &PieceTask, range: crate::task::Range) -> Result<Bytes>;
}

/// Fetches pieces from the peer's upload server with a ranged GET.
#[derive(Debug, Clone)]
pub struct HttpPieceFetcher {
    client: Client,
}

impl HttpPieceFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpPieceFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT.clone())
    }
}

#[async_trait]
impl PieceFetcher for HttpPieceFetcher {
    async fn fetch(&self, task: &PieceTask, range: Range) -> Result<Bytes> {
        let url = format!("http://{}:{}{}", task.peer_ip, task.peer_port, task.path);
        let resp = self
            .client
            .get(&url)
            .header(header::RANGE, format!("bytes={}", range))
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Piece {
                range: range.to_string(),
                reason: format!("peer {} answered {}", task.cid, status),
            });
        }
        Ok(resp.bytes().await?)
    }
}

/// Downloads one assigned piece and reports back: the payload to the client
/// writer, the outcome to the scheduler.
pub struct PowerClient {
    fetcher: Arc<dyn PieceFetcher>,
    piece_task: PieceTask,
    node: String,
    task_id: String,
    results: QueueSender<PieceItem>,
    writer: QueueSender<WriterCommand>,
}

impl PowerClient {
    pub fn new(
        fetcher: Arc<dyn PieceFetcher>,
        piece_task: PieceTask,
        node: String,
        task_id: String,
        results: QueueSender<PieceItem>,
        writer: QueueSender<WriterCommand>,
    ) -> Self {
        Self {
            fetcher,
            piece_task,
            node,
            task_id,
            results,
            writer,
        }
    }

    fn item(&self, result: PieceResult, content: Bytes) -> PieceItem {
        PieceItem {
            task_id: self.task_id.clone(),
            super_node: self.node.clone(),
            dst_cid: self.piece_task.cid.clone(),
            range: self.piece_task.range.clone(),
            result,
            status: TaskStatus::Running,
            content,
            piece_size: self.piece_task.piece_size,
        }
    }

    /// The assignment as a piece: range parsed, md5 split off the
    /// `"<md5>:<size>"` form the supernode sends.
    fn piece(&self) -> Result<Piece> {
        let task = &self.piece_task;
        let range: Range = task.range.parse().map_err(|reason| DownloadError::Piece {
            range: task.range.clone(),
            reason,
        })?;
        let md5 = task
            .piece_md5
            .split(':')
            .next()
            .filter(|md5| !md5.is_empty())
            .map(str::to_string);
        Ok(Piece {
            url: format!("http://{}:{}{}", task.peer_ip, task.peer_port, task.path),
            index: task.piece_num.max(0) as u32,
            range,
            md5,
        })
    }

    async fn download(&self) -> Result<Bytes> {
        let piece = self.piece()?;
        let content = self.fetcher.fetch(&self.piece_task, piece.range).await?;
        if content.len() as u64 != piece.size() {
            return Err(DownloadError::Piece {
                range: piece.range.to_string(),
                reason: format!("expected {} bytes, got {}", piece.size(), content.len()),
            });
        }
        if let Some(expected) = &piece.md5 {
            let real = format!("{:x}", md5::compute(&content));
            if &real != expected {
                return Err(DownloadError::Md5NotMatch {
                    expected: expected.clone(),
                    real,
                });
            }
        }
        debug!(index = piece.index, url = %piece.url, "piece verified");
        self.writer
            .put(WriterCommand::Piece {
                range: piece.range,
                content: content.clone(),
            })
            .await?;
        Ok(content)
    }

    pub async fn run(self) {
        let item = match self.download().await {
            Ok(content) => {
                debug!(range = %self.piece_task.range, peer = %self.piece_task.cid, "piece downloaded");
                self.item(PieceResult::SemiSuccess, content)
            }
            Err(e) => {
                warn!(range = %self.piece_task.range, peer = %self.piece_task.cid, error = %e, "piece download failed");
                self.item(PieceResult::Fail, Bytes::new())
            }
        };
        if self.results.put(item).await.is_err() {
            debug!(range = %self.piece_task.range, "scheduler gone, piece result dropped");
        }
    }
}
