use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::browser::PageUnit;

/// Snapshot of one pooled browser session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSession {
    pub id: String,
    pub source: String,
    pub is_authenticated: bool,
    pub active_units: usize,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub error_count: u32,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub auth_metadata: Option<serde_json::Value>,
}

/// A checked-out unit of a pooled session. Hand it back with
/// [`ResourcePool::release`](super::ResourcePool::release).
pub struct SessionLease {
    pub session_id: String,
    pub source: String,
    /// Authentication state at the time the lease was granted.
    pub is_authenticated: bool,
    pub(crate) unit: Box<dyn PageUnit>,
}

impl SessionLease {
    pub fn unit(&self) -> &dyn PageUnit {
        self.unit.as_ref()
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("source", &self.source)
            .field("is_authenticated", &self.is_authenticated)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcePoolStats {
    pub sessions: usize,
    pub authenticated: usize,
    pub active_units: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub total_active_units: usize,
    pub total_waiting: usize,
    /// Capacity is exhausted when every session is full and no more may be created.
    pub at_capacity: bool,
    pub by_source: HashMap<String, SourcePoolStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: usize,
    pub demoted: usize,
}
