use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CoordinatorConfig;
use crate::events::HealthWarningKind;
use crate::pool::PoolStats;
use crate::queue::QueueStats;

/// Queue and pool state at the time of a health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub queue: QueueStats,
    pub pool: PoolStats,
    pub failure_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub snapshot: HealthSnapshot,
    pub warnings: Vec<HealthWarningKind>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Thresholds crossed by `snapshot`. Only reports; nothing is corrected.
pub fn evaluate(snapshot: &HealthSnapshot, config: &CoordinatorConfig) -> Vec<HealthWarningKind> {
    let mut warnings = Vec::new();

    let finished = snapshot.queue.completed + snapshot.queue.failed;
    if finished > 0 && snapshot.failure_ratio > config.failure_ratio_threshold {
        warnings.push(HealthWarningKind::HighFailureRatio);
    }
    if config.stuck_processing_threshold > 0 && snapshot.queue.stuck_processing >= config.stuck_processing_threshold {
        warnings.push(HealthWarningKind::StuckProcessing);
    }
    if snapshot.pool.at_capacity && snapshot.pool.total_waiting > 0 {
        warnings.push(HealthWarningKind::PoolSaturated);
    }
    warnings
}
