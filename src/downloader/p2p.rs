// downloader/p2p.rs

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::downloader::back_source::BackDownloader;
use crate::downloader::client_writer::{ClientWriter, WriterCommand};
use crate::downloader::common::{
    backoff_jitter, BackSourceReason, DownloadError, Result, MAX_MIGRATE_TIMES,
    MAX_RUNNING_PIECES, POLL_TIMEOUT,
};
use crate::downloader::piece::{MergeOutcome, PieceItem, PieceSizeHistory, PieceTracker};
use crate::downloader::power_client::{PieceFetcher, PowerClient};
use crate::downloader::queue::{piece_queue, QueueReceiver, QueueSender};
use crate::downloader::{move_file, Downloader};
use crate::supernode::api::SupernodeApi;
use crate::supernode::register::{RegisterResult, SupernodeRegister};
use crate::supernode::types::{
    PieceResult, PieceTask, PullPieceTaskRequest, PullPieceTaskResponse, TaskCode, TaskStatus,
};
use crate::task::Task;

/// Pieces claimed at once never exceed this.
const MAX_IN_FLIGHT_PIECES: usize = MAX_RUNNING_PIECES + 1;

/// Downloads a file piece by piece from peers, as directed by a supernode.
pub struct P2PDownloader {
    task: Arc<Task>,
    api: Arc<dyn SupernodeApi>,
    register: Arc<dyn SupernodeRegister>,
    fetcher: Arc<dyn PieceFetcher>,
    register_result: RegisterResult,
    task_file: PathBuf,
    back: Mutex<Option<Arc<BackDownloader>>>,
    cleaned: AtomicBool,
}

impl P2PDownloader {
    pub fn new(
        task: Arc<Task>,
        api: Arc<dyn SupernodeApi>,
        register: Arc<dyn SupernodeRegister>,
        fetcher: Arc<dyn PieceFetcher>,
        register_result: RegisterResult,
    ) -> Self {
        let task_file = task.task_file_name();
        Self {
            task,
            api,
            register,
            fetcher,
            register_result,
            task_file,
            back: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        }
    }

    /// Keeps `back` for cleanup. Refused once cleanup has run.
    fn set_back(&self, back: Arc<BackDownloader>) -> bool {
        let mut slot = self.back.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cleaned.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(back);
        true
    }

    fn back(&self) -> Option<Arc<BackDownloader>> {
        self.back.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Downloader for P2PDownloader {
    async fn run(&self) -> Result<()> {
        let span = info_span!(
            "p2p",
            task_id = %self.register_result.task_id,
            sign = %self.task.sign,
        );
        async {
            let mut scheduler = P2PScheduler::new(self).await?;
            scheduler.run().await
        }
        .instrument(span)
        .await
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(back) = self.back() {
            back.cleanup();
        }
        match std::fs::remove_file(&self.task_file) {
            Ok(()) => debug!(path = %self.task_file.display(), "task file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.task_file.display(), error = %e, "failed to remove task file"),
        }
    }
}

/// State of one run. Everything here is touched only by the loop itself;
/// fetch workers talk to it through `queue`.
struct P2PScheduler<'a> {
    downloader: &'a P2PDownloader,
    node: String,
    task_id: String,
    sizes: PieceSizeHistory,
    pieces: PieceTracker,
    total: u64,
    queue_tx: QueueSender<PieceItem>,
    queue: QueueReceiver<PieceItem>,
    client_tx: QueueSender<WriterCommand>,
    writer: Option<JoinHandle<Result<u64>>>,
    back_source_reason: Option<BackSourceReason>,
}

impl<'a> P2PScheduler<'a> {
    async fn new(downloader: &'a P2PDownloader) -> Result<Self> {
        let result = &downloader.register_result;
        let (queue_tx, queue) = piece_queue(0);
        let (client_tx, client_rx) = piece_queue(downloader.task.client_queue_size.max(1));
        let writer = ClientWriter::create(&downloader.task_file, client_rx).await?;
        let writer = tokio::spawn(writer.run().in_current_span());

        queue_tx.try_put(PieceItem::control(
            result.task_id.clone(),
            result.node.clone(),
            TaskStatus::Start,
            PieceResult::Invalid,
        ))?;

        Ok(Self {
            downloader,
            node: result.node.clone(),
            task_id: result.task_id.clone(),
            sizes: PieceSizeHistory::new(result.piece_size),
            pieces: PieceTracker::new(),
            total: 0,
            queue_tx,
            queue,
            client_tx,
            writer: Some(writer),
            back_source_reason: None,
        })
    }

    async fn run(&mut self) -> Result<()> {
        let mut last_item = None;
        loop {
            let (go_next, item) = self.get_item(last_item.take()).await;
            last_item = item;
            if !go_next {
                continue;
            }
            let Some(mut cur) = last_item.take() else {
                continue;
            };
            info!(range = %cur.range, result = ?cur.result, status = ?cur.status, node = %cur.super_node, "p2p download");
            cur.content = Bytes::new();

            match self.pull_piece_task(&mut cur).await {
                Ok(response) => match response.code {
                    TaskCode::Continue => self.process_piece(&response, &cur).await,
                    TaskCode::Finish => match self.finish_task().await {
                        Ok(()) => return Ok(()),
                        Err(DownloadError::Md5NotMatch { expected, real }) => {
                            error!(%expected, %real, "downloaded file md5 not match");
                            self.record_reason(BackSourceReason::Md5NotMatch);
                        }
                        Err(e) => {
                            error!(error = %e, "finish task failed");
                            self.record_reason(BackSourceReason::WriteError);
                        }
                    },
                    code => {
                        warn!(code = code.code(), msg = %response.msg, "request piece result");
                        if code == TaskCode::SourceError {
                            self.record_reason(BackSourceReason::SourceError);
                        } else {
                            self.retry_later(cur).await;
                        }
                    }
                },
                Err(e) if e.is_register() => {
                    error!(error = %e, "migrate failed");
                    self.abandon_writer().await;
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "p2p download fail");
                    self.record_reason(BackSourceReason::DownloadError);
                }
            }

            if let Some(reason) = self.back_source_reason {
                return self.back_source(reason).await;
            }
        }
    }

    /// Takes the next result off the queue and merges it. Returns whether the
    /// pending item should be dispatched now, plus the pending item.
    async fn get_item(&mut self, latest: Option<PieceItem>) -> (bool, Option<PieceItem>) {
        let mut need_merge = true;
        let mut latest = latest;

        match self.queue.poll_timeout(POLL_TIMEOUT).await {
            Some(mut item) => {
                if !self.sizes.accepts(item.piece_size) {
                    debug!(range = %item.range, piece_size = item.piece_size, "stale piece size, item dropped");
                    return (false, latest);
                }
                if item.super_node != self.node {
                    item.dst_cid.clear();
                    item.super_node = self.node.clone();
                    item.task_id = self.task_id.clone();
                }
                if !item.range.is_empty() {
                    match self.pieces.merge(&item.range, item.result, item.content.len() as u64) {
                        MergeOutcome::NotTracked => {
                            warn!(range = %item.range, "piece range is neither running nor success");
                            return (false, latest);
                        }
                        MergeOutcome::Completed(len) => self.total += len,
                        MergeOutcome::Released | MergeOutcome::AlreadyDone => {}
                    }
                }
                latest = Some(item);
            }
            None => {
                warn!("get item timeout({:?}) from queue", POLL_TIMEOUT);
                need_merge = false;
            }
        }

        let Some(item) = latest.as_ref() else {
            return (false, latest);
        };
        if item.result.is_terminal() {
            need_merge = false;
        }
        let running = self.pieces.running_count();
        if need_merge && (!self.queue.is_empty() || running > MAX_RUNNING_PIECES) {
            return (false, latest);
        }
        (true, latest)
    }

    /// Asks the supernode what to do next. `wait` is retried with jitter; an
    /// error or unknown code migrates to another node and retries.
    async fn pull_piece_task(&mut self, item: &mut PieceItem) -> Result<PullPieceTaskResponse> {
        let downloader = self.downloader;
        let mut migrations = 0;
        loop {
            let req = PullPieceTaskRequest {
                src_cid: downloader.task.cid.clone(),
                dst_cid: item.dst_cid.clone(),
                range: item.range.clone(),
                result: item.result,
                status: item.status,
                task_id: item.task_id.clone(),
            };

            let res = loop {
                match downloader.api.pull_piece_task(&item.super_node, &req).await {
                    Ok(resp) if resp.code == TaskCode::Wait => {
                        let delay = backoff_jitter();
                        info!(node = %item.super_node, "pull piece task result: wait, sleep {:.3}s", delay.as_secs_f64());
                        sleep(delay).await;
                    }
                    other => break other,
                }
            };

            match res {
                Ok(resp) if resp.code.is_accepted() => return Ok(resp),
                Ok(resp) => {
                    error!(node = %item.super_node, code = resp.code.code(), "pull piece task fail and will migrate")
                }
                Err(e) => error!(node = %item.super_node, error = %e, "pull piece task error and will migrate"),
            }

            if migrations >= MAX_MIGRATE_TIMES {
                return Err(DownloadError::MigrateExhausted(migrations));
            }
            migrations += 1;

            let registered = downloader
                .register
                .register(downloader.task.peer_port)
                .await
                .map_err(|e| match e {
                    DownloadError::Register(_) => e,
                    other => DownloadError::Register(other.to_string()),
                })?;
            self.sizes.record(registered.piece_size);
            item.status = TaskStatus::Start;
            item.super_node = registered.node.clone();
            item.task_id = registered.task_id.clone();
            self.node = registered.node;
            self.task_id = registered.task_id;
            info!(node = %self.node, task_id = %self.task_id, "migrated to node");
        }
    }

    /// Starts workers for the assigned pieces. With nothing to start the
    /// scheduler refreshes its view and asks again.
    async fn process_piece(&mut self, response: &PullPieceTaskResponse, item: &PieceItem) {
        let mut has_task = false;
        let mut already_downloaded = false;

        for piece_task in &response.data {
            match self.pieces.state(&piece_task.range) {
                Some(true) => {
                    already_downloaded = true;
                    let done = PieceItem::control(
                        self.task_id.clone(),
                        self.node.clone(),
                        TaskStatus::Running,
                        PieceResult::SemiSuccess,
                    );
                    if let Err(e) = self.queue_tx.try_put(done) {
                        warn!(error = %e, "failed to queue downloaded piece");
                    }
                    break;
                }
                Some(false) => {}
                None => {
                    // Leave the rest unclaimed, the supernode hands them out again.
                    if self.pieces.running_count() >= MAX_IN_FLIGHT_PIECES {
                        debug!(range = %piece_task.range, "too many pieces in flight, deferred");
                        has_task = true;
                        continue;
                    }
                    self.pieces.start(&piece_task.range);
                    self.start_task(piece_task.clone());
                    has_task = true;
                }
            }
        }

        if !has_task && !already_downloaded {
            self.refresh(item).await;
        }
    }

    fn start_task(&self, piece_task: PieceTask) {
        debug!(range = %piece_task.range, peer = %piece_task.cid, "start piece task");
        let client = PowerClient::new(
            self.downloader.fetcher.clone(),
            piece_task,
            self.node.clone(),
            self.task_id.clone(),
            self.queue_tx.clone(),
            self.client_tx.clone(),
        );
        tokio::spawn(client.run().in_current_span());
    }

    async fn refresh(&mut self, item: &PieceItem) {
        let need_sleep = self.sizes.settle();
        if self.node != item.super_node {
            self.node = item.super_node.clone();
            self.task_id = item.task_id.clone();
        }
        if need_sleep {
            sleep(backoff_jitter()).await;
        }
        let next = PieceItem::control(
            self.task_id.clone(),
            self.node.clone(),
            TaskStatus::Running,
            PieceResult::Invalid,
        );
        if let Err(e) = self.queue_tx.try_put(next) {
            warn!(error = %e, "failed to queue refresh item");
        }
    }

    /// Queues a control item for the same node after a pause so the loop asks
    /// again. The range was already reported and merged, so it is not resent.
    async fn retry_later(&mut self, item: PieceItem) {
        sleep(backoff_jitter()).await;
        let next = PieceItem::control(item.task_id, item.super_node, TaskStatus::Running, PieceResult::Invalid);
        if let Err(e) = self.queue_tx.try_put(next) {
            warn!(error = %e, "failed to requeue item");
        }
    }

    async fn finish_task(&mut self) -> Result<()> {
        self.client_tx.put(WriterCommand::Finish).await?;
        if let Some(writer) = self.writer.take() {
            let written = writer
                .await
                .map_err(|e| DownloadError::Internal(format!("client writer panicked: {}", e)))??;
            info!(written, merged = self.total, pieces = self.pieces.success_count(), "all pieces written");
        }
        let task = &self.downloader.task;
        move_file(&self.downloader.task_file, &task.target, &task.md5).await
    }

    /// First reason wins.
    fn record_reason(&mut self, reason: BackSourceReason) {
        if self.back_source_reason.is_none() {
            self.back_source_reason = Some(reason);
        }
    }

    async fn abandon_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Err(e) = tokio::fs::remove_file(&self.downloader.task_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.downloader.task_file.display(), error = %e, "failed to remove task file");
            }
        }
    }

    async fn back_source(&mut self, reason: BackSourceReason) -> Result<()> {
        info!(reason = ?reason, code = reason.code(), "p2p failed, back to source");
        self.abandon_writer().await;
        let back = Arc::new(BackDownloader::new(
            self.downloader.task.clone(),
            Some(reason),
            self.task_id.clone(),
        ));
        if !self.downloader.set_back(back.clone()) {
            warn!("downloader already cleaned up, not going back to source");
            return Err(DownloadError::Internal("downloader already cleaned up".into()));
        }
        back.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::do_download_timeout;
    use crate::downloader::power_client::MockPieceFetcher;
    use crate::supernode::api::MockSupernodeApi;
    use crate::supernode::register::MockSupernodeRegister;
    use crate::test_util::serve;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn register_result(node: &str, task_id: &str, piece_size: i32) -> RegisterResult {
        RegisterResult {
            node: node.into(),
            task_id: task_id.into(),
            file_length: 0,
            piece_size,
        }
    }

    fn piece_task(range: &str) -> PieceTask {
        PieceTask {
            range: range.into(),
            piece_size: 4,
            cid: "peer-1".into(),
            peer_ip: "127.0.0.1".into(),
            peer_port: 1,
            path: "/peer/file/x".into(),
            ..Default::default()
        }
    }

    fn downloader(
        task: Task,
        api: MockSupernodeApi,
        register: MockSupernodeRegister,
        fetcher: MockPieceFetcher,
    ) -> P2PDownloader {
        P2PDownloader::new(
            Arc::new(task),
            Arc::new(api),
            Arc::new(register),
            Arc::new(fetcher),
            register_result("node-a", "task-a", 4),
        )
    }

    fn item(range: &str, result: PieceResult, piece_size: i32, content: &'static [u8]) -> PieceItem {
        PieceItem {
            task_id: "task-a".into(),
            super_node: "node-a".into(),
            dst_cid: "peer-1".into(),
            range: range.into(),
            result,
            status: TaskStatus::Running,
            content: Bytes::from_static(content),
            piece_size,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_three_times_then_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"origin".to_vec()).await;
        let target = dir.path().join("out.bin");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task().returning(move |node, req| {
            assert_eq!(node, "node-a");
            assert_eq!(req.task_id, "task-a");
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Ok(PullPieceTaskResponse::new(TaskCode::Wait))
            } else {
                Ok(PullPieceTaskResponse::new(TaskCode::Finish))
            }
        });
        let mut register = MockSupernodeRegister::new();
        register.expect_register().never();

        let p2p = downloader(Task::new(&url, &target), api, register, MockPieceFetcher::new());
        p2p.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(target.exists());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!p2p.task_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_then_continue_then_finish() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let mut task = Task::new("http://127.0.0.1:1/file", &target);
        task.md5 = format!("{:x}", md5::compute(b"abcd"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task().returning(move |node, req| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => {
                    assert_eq!(node, "node-a");
                    Err(DownloadError::Supernode("connection refused".into()))
                }
                1 => {
                    assert_eq!(node, "node-b");
                    assert_eq!(req.task_id, "task-b");
                    assert_eq!(req.status, TaskStatus::Start);
                    Ok(PullPieceTaskResponse::new(TaskCode::Continue)
                        .with_data(vec![piece_task("0-3")]))
                }
                _ => {
                    assert_eq!(node, "node-b");
                    assert_eq!(req.task_id, "task-b");
                    assert_eq!(req.range, "0-3");
                    assert_eq!(req.result, PieceResult::SemiSuccess);
                    Ok(PullPieceTaskResponse::new(TaskCode::Finish))
                }
            }
        });
        let mut register = MockSupernodeRegister::new();
        register
            .expect_register()
            .times(1)
            .returning(|_| Ok(register_result("node-b", "task-b", 4)));
        let mut fetcher = MockPieceFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_, _| Ok(Bytes::from_static(b"abcd")));

        let p2p = downloader(task, api, register, fetcher);
        p2p.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&target).unwrap(), b"abcd");
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_with_back_source_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"origin".to_vec()).await;
        let target = dir.path().join("out.bin");
        let mut task = Task::new(&url, &target);
        task.not_back_source = true;

        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task()
            .times(1)
            .returning(|_, _| Ok(PullPieceTaskResponse::new(TaskCode::SourceError)));

        let p2p = downloader(task, api, MockSupernodeRegister::new(), MockPieceFetcher::new());
        let err = p2p.run().await.unwrap_err();

        assert!(matches!(err, DownloadError::NotBackSource(110)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!target.exists());
        assert!(!p2p.task_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_falls_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"from origin".to_vec()).await;
        let target = dir.path().join("out.bin");

        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task()
            .returning(|_, _| Ok(PullPieceTaskResponse::new(TaskCode::SourceError)));

        let p2p = downloader(Task::new(&url, &target), api, MockSupernodeRegister::new(), MockPieceFetcher::new());
        p2p.run().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"from origin");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        p2p.cleanup();
        p2p.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"origin".to_vec()).await;
        let target = dir.path().join("out.bin");

        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task()
            .returning(|_, _| Ok(PullPieceTaskResponse::new(TaskCode::Unknown(999))));
        let mut register = MockSupernodeRegister::new();
        register
            .expect_register()
            .times(1)
            .returning(|_| Err(DownloadError::Register("all supernodes down".into())));

        let p2p = downloader(Task::new(&url, &target), api, register, MockPieceFetcher::new());
        let err = p2p.run().await.unwrap_err();

        assert!(err.is_register());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrate_exhausted_records_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("http://127.0.0.1:1/file", dir.path().join("out.bin"));
        task.not_back_source = true;

        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task()
            .times(MAX_MIGRATE_TIMES as usize + 1)
            .returning(|_, _| Err(DownloadError::Supernode("refused".into())));
        let mut register = MockSupernodeRegister::new();
        register
            .expect_register()
            .times(MAX_MIGRATE_TIMES as usize)
            .returning(|_| Ok(register_result("node-b", "task-b", 4)));

        let p2p = downloader(task, api, register, MockPieceFetcher::new());
        let err = p2p.run().await.unwrap_err();
        assert!(matches!(err, DownloadError::NotBackSource(103)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_md5_mismatch_on_finish_goes_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"the real file".to_vec();
        let (url, hits) = serve(200, body.clone()).await;
        let target = dir.path().join("out.bin");
        let mut task = Task::new(&url, &target);
        task.md5 = format!("{:x}", md5::compute(&body));

        // Finish right away: the p2p file is empty and cannot match.
        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task()
            .times(1)
            .returning(|_, _| Ok(PullPieceTaskResponse::new(TaskCode::Finish)));

        let p2p = downloader(task, api, MockSupernodeRegister::new(), MockPieceFetcher::new());
        p2p.run().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), body);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    async fn scheduler(p2p: &P2PDownloader) -> P2PScheduler<'_> {
        let mut scheduler = P2PScheduler::new(p2p).await.unwrap();
        // Drop the initial control item.
        let _ = scheduler.queue.poll_timeout(Duration::from_millis(1)).await;
        scheduler
    }

    fn idle_downloader(dir: &std::path::Path) -> P2PDownloader {
        downloader(
            Task::new("http://127.0.0.1:1/file", dir.join("out.bin")),
            MockSupernodeApi::new(),
            MockSupernodeRegister::new(),
            MockPieceFetcher::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reason_wins() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        s.record_reason(BackSourceReason::SourceError);
        s.record_reason(BackSourceReason::DownloadError);
        s.record_reason(BackSourceReason::Md5NotMatch);
        assert_eq!(s.back_source_reason, Some(BackSourceReason::SourceError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_piece_size_never_merged() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        s.pieces.start("0-3");

        s.queue_tx.try_put(item("0-3", PieceResult::SemiSuccess, 99, b"abcd")).unwrap();
        let (go, latest) = s.get_item(None).await;
        assert!(!go);
        assert!(latest.is_none());
        assert_eq!(s.pieces.state("0-3"), Some(false));
        assert_eq!(s.total, 0);

        // After a migration the old size is still tolerated until a refresh.
        s.sizes.record(8);
        s.queue_tx.try_put(item("0-3", PieceResult::SemiSuccess, 4, b"abcd")).unwrap();
        let (go, _) = s.get_item(None).await;
        assert!(go);
        assert_eq!(s.pieces.state("0-3"), Some(true));
        assert_eq!(s.total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_range_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        let pending = item("", PieceResult::Invalid, 0, b"");

        s.queue_tx.try_put(item("8-11", PieceResult::SemiSuccess, 4, b"ijkl")).unwrap();
        let (go, latest) = s.get_item(Some(pending)).await;
        assert!(!go);
        assert_eq!(latest.unwrap().range, "");
        assert_eq!(s.pieces.state("8-11"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_from_old_node_are_restamped() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        s.node = "node-b".into();
        s.task_id = "task-b".into();

        s.queue_tx.try_put(item("", PieceResult::Invalid, 0, b"")).unwrap();
        let (go, latest) = s.get_item(None).await;
        let latest = latest.unwrap();
        assert!(go);
        assert_eq!(latest.super_node, "node-b");
        assert_eq!(latest.task_id, "task-b");
        assert!(latest.dst_cid.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_gate() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        for range in ["0-3", "4-7", "8-11", "12-15"] {
            s.pieces.start(range);
        }

        // Three still running after the merge: defer.
        s.queue_tx.try_put(item("0-3", PieceResult::SemiSuccess, 4, b"abcd")).unwrap();
        let (go, latest) = s.get_item(None).await;
        assert!(!go);
        assert_eq!(s.pieces.running_count(), 3);

        // A queued follower also defers.
        s.queue_tx.try_put(item("4-7", PieceResult::SemiSuccess, 4, b"efgh")).unwrap();
        s.queue_tx.try_put(item("8-11", PieceResult::SemiSuccess, 4, b"ijkl")).unwrap();
        let (go, latest) = s.get_item(latest).await;
        assert!(!go);
        assert_eq!(latest.as_ref().unwrap().range, "4-7");

        // Last in the queue with one left running: dispatch.
        let (go, latest) = s.get_item(latest).await;
        assert!(go);
        assert_eq!(latest.unwrap().range, "8-11");
        assert_eq!(s.pieces.running_count(), 1);
        assert_eq!(s.total, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_item_bypasses_gate() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        for range in ["0-3", "4-7", "8-11", "12-15"] {
            s.pieces.start(range);
        }
        s.queue_tx.try_put(item("0-3", PieceResult::Fail, 4, b"")).unwrap();
        let (go, latest) = s.get_item(None).await;
        assert!(go);
        assert_eq!(latest.unwrap().result, PieceResult::Fail);
        assert_eq!(s.pieces.state("0-3"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_dispatches_pending_item() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        for range in ["0-3", "4-7", "8-11"] {
            s.pieces.start(range);
        }
        let pending = item("", PieceResult::SemiSuccess, 0, b"");
        let (go, latest) = s.get_item(Some(pending)).await;
        assert!(go);
        assert!(latest.is_some());

        let (go, latest) = s.get_item(None).await;
        assert!(!go);
        assert!(latest.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bound_on_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MockPieceFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _| Ok(Bytes::from_static(b"abcd")));
        let p2p = downloader(
            Task::new("http://127.0.0.1:1/file", dir.path().join("out.bin")),
            MockSupernodeApi::new(),
            MockSupernodeRegister::new(),
            fetcher,
        );
        let mut s = scheduler(&p2p).await;

        let ranges = ["0-3", "4-7", "8-11", "12-15", "16-19"];
        let response = PullPieceTaskResponse::new(TaskCode::Continue)
            .with_data(ranges.iter().map(|r| piece_task(r)).collect());
        let current = item("", PieceResult::Invalid, 0, b"");
        s.process_piece(&response, &current).await;

        assert_eq!(s.pieces.running_count(), MAX_IN_FLIGHT_PIECES);
        assert_eq!(s.pieces.state("12-15"), None);
        assert_eq!(s.pieces.state("16-19"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_downloaded_piece_queues_semi_success() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        s.pieces.start("0-3");
        s.pieces.merge("0-3", PieceResult::SemiSuccess, 4);

        let response = PullPieceTaskResponse::new(TaskCode::Continue).with_data(vec![piece_task("0-3")]);
        s.process_piece(&response, &item("", PieceResult::Invalid, 0, b"")).await;

        let queued = s.queue.poll_timeout(Duration::from_millis(1)).await.unwrap();
        assert_eq!(queued.result, PieceResult::SemiSuccess);
        assert!(queued.range.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_assignment_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let p2p = idle_downloader(dir.path());
        let mut s = scheduler(&p2p).await;
        s.sizes.record(8);

        let mut current = item("", PieceResult::Invalid, 0, b"");
        current.super_node = "node-c".into();
        current.task_id = "task-c".into();
        s.process_piece(&PullPieceTaskResponse::new(TaskCode::Continue), &current).await;

        assert_eq!(s.node, "node-c");
        assert_eq!(s.task_id, "task-c");
        assert_eq!(s.sizes.previous(), 8);
        let queued = s.queue.poll_timeout(Duration::from_millis(1)).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Running);
        assert_eq!(queued.super_node, "node-c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_piece_then_limited_keeps_asking() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task().returning(move |_, req| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert_eq!(req.range, "0-3");
                    assert_eq!(req.result, PieceResult::Fail);
                    Ok(PullPieceTaskResponse::new(TaskCode::Limited))
                }
                _ => {
                    assert!(req.range.is_empty());
                    Ok(PullPieceTaskResponse::new(TaskCode::Finish))
                }
            }
        });
        let p2p = downloader(
            Task::new("http://127.0.0.1:1/file", &target),
            api,
            MockSupernodeRegister::new(),
            MockPieceFetcher::new(),
        );
        let mut s = scheduler(&p2p).await;
        s.pieces.start("0-3");
        s.queue_tx.try_put(item("0-3", PieceResult::Fail, 4, b"")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(600), s.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(target.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_run_before_source() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"origin".to_vec()).await;
        let target = dir.path().join("out.bin");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockSupernodeApi::new();
        api.expect_pull_piece_task().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                Ok(PullPieceTaskResponse::new(TaskCode::Wait))
            } else {
                Ok(PullPieceTaskResponse::new(TaskCode::SourceError))
            }
        });
        let p2p = Arc::new(downloader(
            Task::new(&url, &target),
            api,
            MockSupernodeRegister::new(),
            MockPieceFetcher::new(),
        ));

        let err = do_download_timeout(p2p.clone(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DownloadError::Timeout(_)));

        // Long past the point where the waits would have run out.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(calls.load(Ordering::SeqCst) < 5);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!target.exists());
        assert!(!p2p.task_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_back_source_after_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(200, b"origin".to_vec()).await;
        let target = dir.path().join("out.bin");
        let p2p = downloader(
            Task::new(&url, &target),
            MockSupernodeApi::new(),
            MockSupernodeRegister::new(),
            MockPieceFetcher::new(),
        );
        let mut s = scheduler(&p2p).await;

        p2p.cleanup();
        let err = s.back_source(BackSourceReason::SourceError).await.unwrap_err();
        assert!(matches!(err, DownloadError::Internal(_)));
        assert!(p2p.back().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!target.exists());
    }
}
