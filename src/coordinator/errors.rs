use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::utils::error::AppError;

pub const MAX_RECENT_ERRORS: usize = 100;

/// A failure caught inside a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleError {
    pub occurred_at: DateTime<Utc>,
    pub source: Option<String>,
    pub item_id: Option<i64>,
    pub kind: String,
    pub message: String,
}

impl CycleError {
    pub fn new(source: Option<&str>, item_id: Option<i64>, error: &AppError) -> Self {
        Self {
            occurred_at: Utc::now(),
            source: source.map(str::to_string),
            item_id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Keeps the most recent errors, dropping the oldest past capacity.
#[derive(Debug)]
pub(crate) struct ErrorBuffer {
    entries: VecDeque<CycleError>,
    capacity: usize,
}

impl ErrorBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, error: CycleError) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<CycleError> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(MAX_RECENT_ERRORS)
    }
}
