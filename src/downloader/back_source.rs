// downloader/back_source.rs

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info, warn};

use crate::downloader::common::{BackSourceReason, DownloadError, Result};
use crate::downloader::limit_reader::LimitReader;
use crate::downloader::{move_file, Downloader};
use crate::task::Task;

#[derive(Debug, Default)]
struct TempState {
    path: Option<PathBuf>,
    cleaned: bool,
}

/// Downloads the whole file straight from the source.
pub struct BackDownloader {
    task: Arc<Task>,
    reason: Option<BackSourceReason>,
    task_id: String,
    client: Client,
    temp: Mutex<TempState>,
}

impl BackDownloader {
    pub fn new(task: Arc<Task>, reason: Option<BackSourceReason>, task_id: impl Into<String>) -> Self {
        Self {
            task,
            reason,
            task_id: task_id.into(),
            client: Client::new(),
            temp: Mutex::new(TempState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TempState> {
        self.temp.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the temporary file, while one exists.
    pub fn temp_file(&self) -> Option<PathBuf> {
        self.state().path.clone()
    }

    fn is_success_status(code: u16) -> bool {
        code < 400
    }

    async fn download(&self) -> Result<()> {
        let prefix = format!("backsource.{}.", self.task.sign);
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(self.task.target_dir())?
            .keep()
            .map_err(|e| e.error)?;
        {
            let mut state = self.state();
            if state.cleaned {
                drop(file);
                let _ = std::fs::remove_file(&temp_path);
                return Err(DownloadError::Internal("downloader already cleaned up".into()));
            }
            state.path = Some(temp_path.clone());
        }
        let mut file = tokio::fs::File::from_std(file);

        let mut request = self.client.get(&self.task.url);
        for (k, v) in self.task.header_map() {
            request = request.header(k.as_str(), v.as_str());
        }
        let resp = request.send().await?;
        let status = resp.status().as_u16();
        if !Self::is_success_status(status) {
            return Err(DownloadError::SourceStatus(status));
        }

        let mut reader = LimitReader::new(
            Box::pin(resp.bytes_stream()),
            self.task.local_limit,
            !self.task.md5.is_empty(),
        );
        let written = reader.copy_to(&mut file).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(real) = reader.md5() {
            if real != self.task.md5 {
                return Err(DownloadError::Md5NotMatch {
                    expected: self.task.md5.clone(),
                    real,
                });
            }
        }

        move_file(&temp_path, &self.task.target, "").await?;
        self.state().path = None;
        info!(target = %self.task.target.display(), bytes = written, "download from source finished");
        Ok(())
    }
}

#[async_trait]
impl Downloader for BackDownloader {
    async fn run(&self) -> Result<()> {
        if self.task.not_back_source || self.reason == Some(BackSourceReason::NoSpace) {
            let code = BackSourceReason::forced_code(self.reason);
            error!(task_id = %self.task_id, code, "download fail and not back source");
            return Err(DownloadError::NotBackSource(code));
        }

        let name = self
            .task
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(task_id = %self.task_id, reason = ?self.reason, "start download {} from the source station", name);

        let result = self.download().await;
        if let Err(e) = &result {
            warn!(task_id = %self.task_id, error = %e, "download from source failed");
        }
        self.cleanup();
        result
    }

    fn cleanup(&self) {
        let mut state = self.state();
        if state.cleaned {
            return;
        }
        if let Some(path) = state.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete temp file");
            }
        }
        state.cleaned = true;
    }
}
