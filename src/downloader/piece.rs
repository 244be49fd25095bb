// downloader/piece.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;

use bytes::Bytes;

use crate::supernode::types::{PieceResult, TaskStatus};

/// Work unit passed between fetch workers and the scheduler
#[derive(Debug, Clone)]
pub struct PieceItem {
    pub task_id: String,
    pub super_node: String,
    /// Cid of the peer the piece came from, empty when unknown.
    pub dst_cid: String,
    /// Empty for control items that carry no piece.
    pub range: String,
    pub result: PieceResult,
    pub status: TaskStatus,
    pub content: Bytes,
    /// Piece size negotiated when the item was created, 0 if unspecified.
    pub piece_size: i32,
}

impl PieceItem {
    /// An item without a range, used to drive the next pull.
    pub fn control(
        task_id: impl Into<String>,
        super_node: impl Into<String>,
        status: TaskStatus,
        result: PieceResult,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            dst_cid: String::new(),
            range: String::new(),
            result,
            status,
            content: Bytes::new(),
            piece_size: 0,
        }
    }
}

/// What merging a result did to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The range was never claimed, the item is dropped.
    NotTracked,
    /// The range finished, carrying its byte count.
    Completed(u64),
    /// The attempt failed and the range may be claimed again.
    Released,
    /// The range had already finished.
    AlreadyDone,
}

/// Completion state per range: `true` finished, `false` in flight, absent not tried.
#[derive(Debug, Default)]
pub struct PieceTracker {
    pieces: HashMap<String, bool>,
}

impl PieceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, range: &str) -> Option<bool> {
        self.pieces.get(range).copied()
    }

    /// Claims an untried range. Returns false if it is running or done.
    pub fn start(&mut self, range: &str) -> bool {
        if self.pieces.contains_key(range) {
            return false;
        }
        self.pieces.insert(range.to_string(), false);
        true
    }

    pub fn merge(&mut self, range: &str, result: PieceResult, len: u64) -> MergeOutcome {
        match self.pieces.get(range).copied() {
            None => MergeOutcome::NotTracked,
            Some(true) => MergeOutcome::AlreadyDone,
            Some(false) if result.is_success() => {
                self.pieces.insert(range.to_string(), true);
                MergeOutcome::Completed(len)
            }
            Some(false) => {
                self.pieces.remove(range);
                MergeOutcome::Released
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.pieces.values().filter(|done| !**done).count()
    }

    pub fn success_count(&self) -> usize {
        self.pieces.values().filter(|done| **done).count()
    }
}

/// The two most recent negotiated piece sizes. A migration moves `current`,
/// a refresh brings `previous` up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSizeHistory {
    previous: i32,
    current: i32,
}

impl PieceSizeHistory {
    pub fn new(size: i32) -> Self {
        Self {
            previous: size,
            current: size,
        }
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn previous(&self) -> i32 {
        self.previous
    }

    /// Zero means the item did not declare a size.
    pub fn accepts(&self, size: i32) -> bool {
        size == 0 || size == self.current || size == self.previous
    }

    pub fn record(&mut self, size: i32) {
        self.current = size;
    }

    /// Forgets the old size. Returns true if it differed.
    pub fn settle(&mut self) -> bool {
        if self.previous == self.current {
            return false;
        }
        self.previous = self.current;
        true
    }
}
