// supernode/types.rs

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::downloader::common::{DownloadError, Result};

/// Generic success code of the supernode
pub const CODE_SUCCESS: i32 = 200;

/// Status code of a pull piece task response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCode {
    Success,
    Finish,
    Continue,
    Wait,
    Limited,
    SourceError,
    Unknown(i32),
}

impl TaskCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            CODE_SUCCESS => TaskCode::Success,
            601 => TaskCode::Finish,
            602 => TaskCode::Continue,
            603 => TaskCode::Wait,
            604 => TaskCode::Limited,
            610 => TaskCode::SourceError,
            other => TaskCode::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            TaskCode::Success => CODE_SUCCESS,
            TaskCode::Finish => 601,
            TaskCode::Continue => 602,
            TaskCode::Wait => 603,
            TaskCode::Limited => 604,
            TaskCode::SourceError => 610,
            TaskCode::Unknown(code) => *code,
        }
    }

    /// Codes the pull client hands back to the scheduler. Everything else migrates.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            TaskCode::Continue
                | TaskCode::Finish
                | TaskCode::Limited
                | TaskCode::Success
                | TaskCode::SourceError
        )
    }
}

/// Outcome of a piece as reported to the supernode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceResult {
    Fail,
    Success,
    Invalid,
    SemiSuccess,
}

impl PieceResult {
    pub fn code(&self) -> i32 {
        match self {
            PieceResult::Fail => 500,
            PieceResult::Success => 501,
            PieceResult::Invalid => 502,
            PieceResult::SemiSuccess => 503,
        }
    }

    /// Results that go straight to dispatch instead of waiting to be batched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PieceResult::Success | PieceResult::Fail | PieceResult::Invalid
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PieceResult::Success | PieceResult::SemiSuccess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Start,
    Running,
    Finish,
}

impl TaskStatus {
    pub fn code(&self) -> i32 {
        match self {
            TaskStatus::Start => 700,
            TaskStatus::Running => 701,
            TaskStatus::Finish => 702,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPieceTaskRequest {
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: PieceResult,
    pub status: TaskStatus,
    pub task_id: String,
}

impl PullPieceTaskRequest {
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("srcCid", self.src_cid.clone()),
            ("dstCid", self.dst_cid.clone()),
            ("range", self.range.clone()),
            ("result", self.result.code().to_string()),
            ("status", self.status.code().to_string()),
            ("taskId", self.task_id.clone()),
        ]
    }
}

/// One piece assignment carried by a `continue` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PieceTask {
    pub range: String,
    pub piece_num: i32,
    pub piece_size: i32,
    pub piece_md5: String,
    /// Cid of the peer serving the piece.
    pub cid: String,
    pub peer_ip: String,
    pub peer_port: u16,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPieceTaskResponse {
    pub code: TaskCode,
    pub msg: String,
    pub data: Vec<PieceTask>,
}

impl PullPieceTaskResponse {
    pub fn new(code: TaskCode) -> Self {
        Self {
            code,
            msg: String::new(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<PieceTask>) -> Self {
        self.data = data;
        self
    }
}

/// Envelope every supernode answer comes in.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultInfo {
    pub code: i32,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ResultInfo {
    pub fn into_pull_response(self) -> Result<PullPieceTaskResponse> {
        let code = TaskCode::from_code(self.code);
        let data = match (code, self.data) {
            (TaskCode::Continue, Some(value)) if !value.is_null() => serde_json::from_value(value)?,
            _ => Vec::new(),
        };
        Ok(PullPieceTaskResponse {
            code,
            msg: self.msg.unwrap_or_default(),
            data,
        })
    }

    pub fn into_register_response(self) -> Result<RegisterResponseData> {
        if self.code != CODE_SUCCESS {
            return Err(DownloadError::Register(format!(
                "code:{} msg:{}",
                self.code,
                self.msg.unwrap_or_default()
            )));
        }
        let value = self
            .data
            .ok_or_else(|| DownloadError::Register("empty register response".into()))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRequest {
    pub cid: String,
    pub ip: String,
    pub host_name: String,
    pub port: u16,
    pub raw_url: String,
    pub task_url: String,
    pub md5: String,
    pub identifier: String,
    pub path: String,
    pub call_system: String,
    pub version: String,
    pub headers: Vec<String>,
}

impl RegisterRequest {
    /// Form fields, one `headers` entry per raw header.
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("cid", self.cid.clone()),
            ("ip", self.ip.clone()),
            ("hostName", self.host_name.clone()),
            ("port", self.port.to_string()),
            ("rawUrl", self.raw_url.clone()),
            ("taskUrl", self.task_url.clone()),
            ("md5", self.md5.clone()),
            ("identifier", self.identifier.clone()),
            ("path", self.path.clone()),
            ("callSystem", self.call_system.clone()),
            ("version", self.version.clone()),
        ];
        form.extend(self.headers.iter().map(|h| ("headers", h.clone())));
        form
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponseData {
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: i32,
}
