// downloader/limit_reader.rs

#![forbid(unsafe_code)]

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::{sleep, Duration, Instant};

use crate::downloader::common::{DownloadError, Result, COPY_BUFFER_SIZE};

/// Token bucket holding at most one second worth of bytes. Starts empty.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `rate` is in bytes per second and must be positive.
    pub fn new(rate: u64) -> Self {
        Self {
            rate: rate.max(1),
            tokens: 0.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }

    /// Waits until `n` bytes may pass.
    pub async fn acquire(&mut self, n: u64) {
        let mut remaining = n;
        while remaining > 0 {
            // Never ask for more than the bucket can hold.
            let want = remaining.min(self.rate) as f64;
            self.refill();
            if self.tokens < want {
                let deficit = want - self.tokens;
                sleep(Duration::from_secs_f64(deficit / self.rate as f64)).await;
                self.refill();
            }
            self.tokens -= want;
            remaining -= want as u64;
        }
    }
}

/// Copies a byte stream under a rate limit, optionally hashing what passes.
pub struct LimitReader<S> {
    inner: S,
    limiter: Option<RateLimiter>,
    md5: Option<md5::Context>,
    read: u64,
}

impl<S, E> LimitReader<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    DownloadError: From<E>,
{
    /// A `rate` of 0 disables limiting.
    pub fn new(inner: S, rate: u64, calculate_md5: bool) -> Self {
        Self {
            inner,
            limiter: (rate > 0).then(|| RateLimiter::new(rate)),
            md5: calculate_md5.then(md5::Context::new),
            read: 0,
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        let chunk = match self.inner.next().await? {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e.into())),
        };
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.acquire(chunk.len() as u64).await;
        }
        if let Some(ctx) = self.md5.as_mut() {
            ctx.consume(&chunk);
        }
        self.read += chunk.len() as u64;
        Some(Ok(chunk))
    }

    /// Drains the stream into `writer` and flushes it.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<u64> {
        let mut buffered = BufWriter::with_capacity(COPY_BUFFER_SIZE, writer);
        let mut written = 0;
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            buffered.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        buffered.flush().await?;
        Ok(written)
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Hex md5 of everything read so far, None if hashing is off.
    pub fn md5(&self) -> Option<String> {
        self.md5.clone().map(|ctx| format!("{:x}", ctx.compute()))
    }
}
