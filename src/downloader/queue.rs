// downloader/queue.rs

#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::downloader::common::{DownloadError, Result};

/// Creates a piece queue. A capacity of 0 makes it unbounded.
pub fn piece_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
    }
}

/// Producer half, cheap to clone into fetch workers.
#[derive(Debug)]
pub enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        match self {
            QueueSender::Bounded(tx) => QueueSender::Bounded(tx.clone()),
            QueueSender::Unbounded(tx) => QueueSender::Unbounded(tx.clone()),
        }
    }
}

impl<T> QueueSender<T> {
    /// Puts an item. Waits for room only on a bounded queue.
    pub async fn put(&self, item: T) -> Result<()> {
        let sent = match self {
            QueueSender::Bounded(tx) => tx.send(item).await.is_ok(),
            QueueSender::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(DownloadError::Internal("piece queue closed".into()))
        }
    }

    /// Puts an item without ever waiting.
    pub fn try_put(&self, item: T) -> Result<()> {
        let sent = match self {
            QueueSender::Bounded(tx) => tx.try_send(item).is_ok(),
            QueueSender::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(DownloadError::Internal("piece queue full or closed".into()))
        }
    }
}

/// Consumer half, owned by exactly one task.
#[derive(Debug)]
pub enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Waits up to `wait` for an item.
    pub async fn poll_timeout(&mut self, wait: Duration) -> Option<T> {
        timeout(wait, self.recv()).await.ok().flatten()
    }

    /// Current depth. Racy, only good as a hint.
    pub fn len(&self) -> usize {
        match self {
            QueueReceiver::Bounded(rx) => rx.len(),
            QueueReceiver::Unbounded(rx) => rx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
