// task.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default number of pieces the client writer may hold before fetchers block.
pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 6;

/// Download pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    #[default]
    P2p,
    Source,
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p2p" => Ok(Pattern::P2p),
            "source" => Ok(Pattern::Source),
            other => Err(format!("unknown pattern: {}", other)),
        }
    }
}

/// One download request. Read-only once the engine starts.
#[derive(Debug, Clone)]
pub struct Task {
    /// Source url of the file.
    pub url: String,
    /// Full path the finished file is placed at.
    pub target: PathBuf,
    /// Expected md5 of the whole file, empty when not checked.
    pub md5: String,
    /// Identifies the task when no md5 is given.
    pub identifier: String,
    pub call_system: String,
    /// Local rate limit in bytes per second, 0 means unlimited.
    pub local_limit: u64,
    /// Minimal rate in bytes per second, used to size the default timeout.
    pub min_rate: u64,
    /// Zero means "derive from the file length".
    pub timeout: Duration,
    pub client_queue_size: usize,
    /// Raw `Key: Value` headers for requests against the source.
    pub headers: Vec<String>,
    /// Never download from the source when p2p fails.
    pub not_back_source: bool,
    pub pattern: Pattern,

    /// `<pid>-<unix seconds>`, unique per running task.
    pub sign: String,
    /// Client id reported to the supernode.
    pub cid: String,
    pub peer_ip: String,
    pub peer_port: u16,
}

impl Task {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        let sign = new_sign();
        let peer_ip = "127.0.0.1".to_string();
        Self {
            url: url.into(),
            target: target.into(),
            md5: String::new(),
            identifier: String::new(),
            call_system: String::new(),
            local_limit: 0,
            min_rate: 0,
            timeout: Duration::ZERO,
            client_queue_size: DEFAULT_CLIENT_QUEUE_SIZE,
            headers: Vec::new(),
            not_back_source: false,
            pattern: Pattern::P2p,
            cid: format!("{}-{}", peer_ip, sign),
            sign,
            peer_ip,
            peer_port: 0,
        }
    }

    /// Changes the local address and the cid derived from it.
    pub fn with_peer(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.peer_ip = ip.into();
        self.peer_port = port;
        self.cid = format!("{}-{}", self.peer_ip, self.sign);
        self
    }

    /// Directory the temporary files live in.
    pub fn target_dir(&self) -> &Path {
        match self.target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Temporary file the p2p pieces are written into.
    pub fn task_file_name(&self) -> PathBuf {
        let name = self
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dfget".to_string());
        self.target_dir().join(format!("{}-{}", name, self.sign))
    }

    /// Merges the raw headers into a map. Duplicate keys are joined with ','.
    pub fn header_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = HashMap::new();
        for header in &self.headers {
            let Some((k, v)) = header.split_once(':') else {
                continue;
            };
            let (k, v) = (k.trim(), v.trim());
            if v.is_empty() {
                continue;
            }
            map.entry(k.to_string())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(v);
                })
                .or_insert_with(|| v.to_string());
        }
        map
    }

    /// Timeout to use when none was configured, from the file length and min rate.
    pub fn effective_timeout(&self, file_length: u64) -> Duration {
        if !self.timeout.is_zero() {
            return self.timeout;
        }
        let by_rate = if self.min_rate > 0 {
            Duration::from_secs(file_length / self.min_rate)
        } else {
            Duration::ZERO
        };
        by_rate.max(MIN_TIMEOUT)
    }
}

const MIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn new_sign() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    format!("{}-{:.3}", std::process::id(), now)
}

/// Inclusive byte interval within the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for Range {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid range: {}", s))?;
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid range start: {}", s))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid range end: {}", s))?;
        if end < start {
            return Err(format!("range end before start: {}", s));
        }
        Ok(Range { start, end })
    }
}

/// Fixed-range slice of the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub url: String,
    /// Position among all pieces of the task, starting from 0.
    pub index: u32,
    pub range: Range,
    pub md5: Option<String>,
}

impl Piece {
    pub fn size(&self) -> u64 {
        self.range.size()
    }
}
