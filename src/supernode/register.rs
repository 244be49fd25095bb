// supernode/register.rs

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::downloader::common::{DownloadError, Result};
use crate::supernode::api::SupernodeApi;
use crate::supernode::types::RegisterRequest;
use crate::task::Task;

/// What a successful registration hands to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResult {
    pub node: String,
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: i32,
}

/// Registers the client against some supernode, picking the node itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SupernodeRegister: Send + Sync {
    async fn register(&self, peer_port: u16) -> Result<RegisterResult>;
}

/// Tries the configured nodes in order. The node that accepted a registration
/// moves to the back, so the next call (a migration) prefers another one.
pub struct SupernodeRegistrar {
    api: Arc<dyn SupernodeApi>,
    task: Arc<Task>,
    nodes: Mutex<Vec<String>>,
}

impl SupernodeRegistrar {
    pub fn new(api: Arc<dyn SupernodeApi>, task: Arc<Task>, nodes: Vec<String>) -> Self {
        Self {
            api,
            task,
            nodes: Mutex::new(nodes),
        }
    }

    fn request(&self, peer_port: u16) -> RegisterRequest {
        RegisterRequest {
            cid: self.task.cid.clone(),
            ip: self.task.peer_ip.clone(),
            host_name: self.task.peer_ip.clone(),
            port: peer_port,
            raw_url: self.task.url.clone(),
            task_url: self.task.url.clone(),
            md5: self.task.md5.clone(),
            identifier: self.task.identifier.clone(),
            path: self.task.target.to_string_lossy().into_owned(),
            call_system: self.task.call_system.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            headers: self.task.headers.clone(),
        }
    }
}

#[async_trait]
impl SupernodeRegister for SupernodeRegistrar {
    async fn register(&self, peer_port: u16) -> Result<RegisterResult> {
        let mut nodes = self.nodes.lock().await;
        if nodes.is_empty() {
            return Err(DownloadError::Register("no supernode configured".into()));
        }

        let req = self.request(peer_port);
        let mut last_err = None;
        for i in 0..nodes.len() {
            let node = nodes[i].clone();
            match self.api.register(&node, &req).await {
                Ok(data) => {
                    nodes.rotate_left(i + 1);
                    info!(%node, task_id = %data.task_id, piece_size = data.piece_size, "registered to supernode");
                    return Ok(RegisterResult {
                        node,
                        task_id: data.task_id,
                        file_length: data.file_length,
                        piece_size: data.piece_size,
                    });
                }
                Err(e) => {
                    warn!(%node, error = %e, "register to supernode failed");
                    last_err = Some(e);
                }
            }
        }

        Err(DownloadError::Register(match last_err {
            Some(e) => e.to_string(),
            None => "all supernodes failed".into(),
        }))
    }
}
