// lib.rs

//! Client side of a peer-to-peer file distribution system. A download is
//! registered with a supernode, pulled piece by piece from other peers and
//! falls back to the source when p2p cannot finish it.

pub mod config;
pub mod downloader;
pub mod supernode;
pub mod task;

#[cfg(test)]
pub mod test_util;

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::downloader::power_client::HttpPieceFetcher;
use crate::downloader::{
    do_download_timeout, BackDownloader, BackSourceReason, Downloader, P2PDownloader, Result,
};
use crate::supernode::{HttpSupernodeApi, SupernodeApi, SupernodeRegister, SupernodeRegistrar};
use crate::task::{Pattern, Task};

/// Downloads `task.url` to `task.target`, registering against `nodes` first
/// unless the task asks for the source directly.
pub async fn start(task: Task, nodes: Vec<String>) -> Result<()> {
    let task = Arc::new(task);
    let span = info_span!("dfget", sign = %task.sign);
    async move {
        let downloader: Arc<dyn Downloader> = match task.pattern {
            Pattern::Source => Arc::new(BackDownloader::new(task.clone(), None, "")),
            Pattern::P2p => {
                let api: Arc<dyn SupernodeApi> = Arc::new(HttpSupernodeApi::new()?);
                let registrar = Arc::new(SupernodeRegistrar::new(api.clone(), task.clone(), nodes));
                match registrar.register(task.peer_port).await {
                    Ok(result) => {
                        let timeout = task.effective_timeout(result.file_length.max(0) as u64);
                        info!(node = %result.node, task_id = %result.task_id, file_length = result.file_length, ?timeout, "registered");
                        let p2p = P2PDownloader::new(
                            task.clone(),
                            api,
                            registrar,
                            Arc::new(HttpPieceFetcher::default()),
                            result,
                        );
                        return do_download_timeout(Arc::new(p2p), timeout).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "register failed, download from source");
                        Arc::new(BackDownloader::new(
                            task.clone(),
                            Some(BackSourceReason::RegisterFail),
                            "",
                        ))
                    }
                }
            }
        };
        do_download_timeout(downloader, task.effective_timeout(0)).await
    }
    .instrument(span)
    .await
}
