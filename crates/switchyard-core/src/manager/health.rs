//! Health and metrics snapshots reported by the messaging manager.

use super::consumer::ConsumerStats;
use super::producer::ProducerStats;
use super::ManagerState;
use crate::backend::BackendType;
use crate::dlq::DlqStats;
use crate::message::Timestamp;
use crate::middleware::MiddlewareStats;
use crate::routing::RoutingStats;
use serde::Serialize;
use std::collections::HashMap;

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Working, but something needs attention
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{}", name)
    }
}

/// Result of [`MessagingManager::health_check`](super::MessagingManager::health_check)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub state: ManagerState,
    pub backend_type: BackendType,
    pub backend_connected: bool,
    pub consumers: usize,
    pub active_consumers: usize,
    pub producers: usize,
    pub pending_retries: usize,
    pub dlq_size: usize,
    /// Reconnects performed by the background health loop
    pub reconnects: u64,
    pub last_background_check: Option<Timestamp>,
    /// Reasons the status is not healthy
    pub issues: Vec<String>,
    pub checked_at: Timestamp,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Result of [`MessagingManager::metrics`](super::MessagingManager::metrics)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerMetrics {
    pub state: ManagerState,
    pub uptime_seconds: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub publish_rejections: u64,
    pub messages_processed: u64,
    pub processing_failures: u64,
    pub processing_rejections: u64,
    pub queue_depths: HashMap<String, usize>,
    pub routing: HashMap<String, RoutingStats>,
    pub dlq: DlqStats,
    pub middleware: Vec<MiddlewareStats>,
    pub producers: Vec<ProducerStats>,
    pub consumers: Vec<ConsumerStats>,
}

/// Background loop bookkeeping
#[derive(Debug, Default)]
pub(crate) struct HealthRecord {
    pub(crate) reconnects: u64,
    pub(crate) failed_reconnects: u64,
    pub(crate) last_check: Option<Timestamp>,
    pub(crate) metrics_ticks: u64,
}
