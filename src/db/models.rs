//! Row types for the persisted tables.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::ProbeResult;

/// One row of the append-only ping history.
#[derive(Debug, Clone, Serialize)]
pub struct PingRecord {
    pub target_name: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: Option<f64>,
}

impl From<&ProbeResult> for PingRecord {
    fn from(result: &ProbeResult) -> Self {
        Self {
            target_name: result.target_name.clone(),
            host: result.host.clone(),
            timestamp: result.timestamp,
            success: result.success,
            response_time_ms: result.response_time_ms,
        }
    }
}

/// A disconnect event as read back from the `disconnect_events` table.
#[derive(Debug, Clone, Serialize)]
pub struct DisconnectRow {
    pub target_name: String,
    pub host: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub disconnect_count: u32,
    pub reason: String,
}

/// A statistics snapshot as read back from the `target_statistics` table.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub target_name: String,
    pub host: String,
    pub total_pings: u64,
    pub successful_pings: u64,
    pub failed_pings: u64,
    pub success_rate: f64,
    pub avg_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub last_status: Option<i64>,
    pub timestamp: DateTime<Utc>,
}
