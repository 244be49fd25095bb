// downloader/mod.rs

//! Two ways to get a file: `P2PDownloader` pulls pieces from peers under the
//! supernode's direction, `BackDownloader` fetches the whole file from the
//! source and is what the p2p path falls back to.

pub mod back_source;
pub mod client_writer;
pub mod common;
pub mod limit_reader;
pub mod p2p;
pub mod piece;
pub mod power_client;
pub mod queue;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

pub use back_source::BackDownloader;
pub use common::{BackSourceReason, DownloadError, Result};
pub use p2p::P2PDownloader;

/// Something that can download a file once.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn run(&self) -> Result<()>;

    /// Releases whatever `run` left behind. Safe to call more than once.
    fn cleanup(&self);
}

/// Runs `downloader` and gives up after `timeout`. On expiry the run is
/// aborted and cleaned up, so nothing it started outlives the error.
pub async fn do_download_timeout(downloader: Arc<dyn Downloader>, timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(DownloadError::InvalidTimeout(timeout));
    }

    let runner = downloader.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(DownloadError::Internal(format!("download task failed: {}", e))),
        Err(_) => {
            warn!(timeout = ?timeout, "download timeout, cleaning up");
            handle.abort();
            downloader.cleanup();
            Err(DownloadError::Timeout(timeout))
        }
    }
}

/// Hex md5 of a whole file.
pub async fn md5_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; common::COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Renames `src` onto `dst`, first checking its md5 if `expect_md5` is set.
pub async fn move_file(src: &Path, dst: &Path, expect_md5: &str) -> Result<()> {
    let start = Instant::now();
    if !expect_md5.is_empty() {
        let real = md5_file(src).await?;
        info!(src = %src.display(), md5 = %real, cost = ?start.elapsed(), "computed file md5");
        if real != expect_md5 {
            return Err(DownloadError::Md5NotMatch {
                expected: expect_md5.to_string(),
                real,
            });
        }
    }
    let result = tokio::fs::rename(src, dst).await;
    info!(src = %src.display(), dst = %dst.display(), ok = result.is_ok(), cost = ?start.elapsed(), "move file");
    Ok(result?)
}
