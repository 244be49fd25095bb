// supernode/api.rs

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::downloader::common::{DownloadError, Result};
use crate::supernode::types::{
    PullPieceTaskRequest, PullPieceTaskResponse, RegisterRequest, RegisterResponseData, ResultInfo,
};

const REGISTER_PATH: &str = "/peer/registry";
const PULL_PIECE_TASK_PATH: &str = "/peer/task";
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Calls a supernode on behalf of the client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SupernodeApi: Send + Sync {
    async fn register(&self, node: &str, req: &RegisterRequest) -> Result<RegisterResponseData>;

    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse>;
}

/// Supernode API over plain HTTP with JSON answers.
#[derive(Debug, Clone)]
pub struct HttpSupernodeApi {
    client: Client,
}

impl HttpSupernodeApi {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_API_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(node: &str, path: &str) -> String {
        if node.starts_with("http://") || node.starts_with("https://") {
            format!("{}{}", node.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", node, path)
        }
    }
}

#[async_trait]
impl SupernodeApi for HttpSupernodeApi {
    async fn register(&self, node: &str, req: &RegisterRequest) -> Result<RegisterResponseData> {
        let url = Self::url(node, REGISTER_PATH);
        debug!(%url, cid = %req.cid, "register to supernode");
        let resp = self.client.post(&url).form(&req.to_form()).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::Supernode(format!(
                "register to {} returned {}",
                node,
                resp.status()
            )));
        }
        let info: ResultInfo = resp.json().await?;
        info.into_register_response()
    }

    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse> {
        let url = Self::url(node, PULL_PIECE_TASK_PATH);
        let resp = self.client.get(&url).query(&req.to_query()).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::Supernode(format!(
                "pull piece task from {} returned {}",
                node,
                resp.status()
            )));
        }
        let info: ResultInfo = resp.json().await?;
        info.into_pull_response()
    }
}
