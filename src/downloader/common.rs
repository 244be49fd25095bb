// downloader/common.rs

#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// How long the scheduler waits on the result queue per iteration
pub const POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// More in-flight ranges than this defers merging
pub const MAX_RUNNING_PIECES: usize = 2;

/// Migrations allowed within a single pull
pub const MAX_MIGRATE_TIMES: u32 = 5;

/// Jittered backoff bounds in milliseconds
pub const BACKOFF_MIN_MILLIS: u64 = 600;
pub const BACKOFF_MAX_MILLIS: u64 = 2000;

/// Copy buffer used when streaming from the source
pub const COPY_BUFFER_SIZE: usize = 512 * 1024;

/// Added to a back source reason when the source may not be used
pub const FORCE_NOT_BACK_SOURCE_ADDITION: i32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download timeout({:.3}s)", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("invalid download timeout({:.3}s)", .0.as_secs_f64())]
    InvalidTimeout(Duration),
    #[error("register to supernode failed: {0}")]
    Register(String),
    #[error("supernode error: {0}")]
    Supernode(String),
    #[error("pull piece task still failing after {0} migrations")]
    MigrateExhausted(u32),
    #[error("download fail and not back source: {0}")]
    NotBackSource(i32),
    #[error("md5 not match, expected:{expected} real:{real}")]
    Md5NotMatch { expected: String, real: String },
    #[error("failed to download from source, response code:{0}")]
    SourceStatus(u16),
    #[error("piece {range} failed: {reason}")]
    Piece { range: String, reason: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DownloadError {
    pub fn is_register(&self) -> bool {
        matches!(self, DownloadError::Register(_))
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Why the task gave up on p2p and went to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackSourceReason {
    RegisterFail,
    Md5NotMatch,
    DownloadError,
    NoSpace,
    WriteError,
    SourceError,
}

impl BackSourceReason {
    pub fn code(&self) -> i32 {
        match self {
            BackSourceReason::RegisterFail => 1,
            BackSourceReason::Md5NotMatch => 2,
            BackSourceReason::DownloadError => 3,
            BackSourceReason::NoSpace => 4,
            BackSourceReason::WriteError => 6,
            BackSourceReason::SourceError => 10,
        }
    }

    /// Code reported when going back to the source is not allowed.
    pub fn forced_code(reason: Option<BackSourceReason>) -> i32 {
        reason.map(|r| r.code()).unwrap_or(0) + FORCE_NOT_BACK_SOURCE_ADDITION
    }
}

/// Random delay in [BACKOFF_MIN_MILLIS, BACKOFF_MAX_MILLIS)
pub fn backoff_jitter() -> Duration {
    let millis = rand::rng().random_range(BACKOFF_MIN_MILLIS..BACKOFF_MAX_MILLIS);
    Duration::from_millis(millis)
}
