//! Per-target running statistics and disconnect detection.
//!
//! One [`TargetAggregator`] exists per target and is owned by that target's
//! probe loop, so all updates are single-writer and targets never contend.
//! The health state machine is explicit so the "at most one open disconnect
//! event" invariant holds by construction: the open event lives in an
//! `Option` that only `Up -> Down` fills and only `Down -> Up` clears.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::ProbeResult;

/// Health of a target as seen by its aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No result observed yet.
    Unknown,
    Up,
    Down,
}

impl HealthState {
    /// Column encoding: NULL while unknown, 1 up, 0 down.
    pub fn as_column(&self) -> Option<i64> {
        match self {
            HealthState::Unknown => None,
            HealthState::Up => Some(1),
            HealthState::Down => Some(0),
        }
    }
}

/// A continuous interval of unreachability for one target.
///
/// Open while `end_time` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectEvent {
    pub target_name: String,
    pub host: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub consecutive_failure_count: u32,
    /// Failure classification of the probe that opened the event.
    pub reason: String,
}

/// Running statistics for one target.
#[derive(Debug, Clone)]
pub struct TargetStats {
    pub target_name: String,
    pub host: String,
    pub ping_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_rt: Option<f64>,
    pub max_rt: Option<f64>,
    /// Running mean over successful samples; no history is kept.
    pub avg_rt: Option<f64>,
    pub current_state: HealthState,
}

impl TargetStats {
    fn new(target_name: &str, host: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            host: host.to_string(),
            ping_count: 0,
            success_count: 0,
            failure_count: 0,
            min_rt: None,
            max_rt: None,
            avg_rt: None,
            current_state: HealthState::Unknown,
        }
    }

    fn record(&mut self, success: bool, rtt_ms: Option<f64>) {
        self.ping_count += 1;
        if success {
            self.success_count += 1;
            if let Some(rtt) = rtt_ms {
                self.min_rt = Some(self.min_rt.map_or(rtt, |m| m.min(rtt)));
                self.max_rt = Some(self.max_rt.map_or(rtt, |m| m.max(rtt)));
                let avg = self.avg_rt.unwrap_or(0.0);
                self.avg_rt = Some(avg + (rtt - avg) / self.success_count as f64);
            }
        } else {
            self.failure_count += 1;
        }
    }

    /// Clear the window counters; health state is not part of the window.
    fn reset_window(&mut self) {
        self.ping_count = 0;
        self.success_count = 0;
        self.failure_count = 0;
        self.min_rt = None;
        self.max_rt = None;
        self.avg_rt = None;
    }
}

/// A point-in-time summary of one reporting window, persisted as one
/// `target_statistics` row.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub target_name: String,
    pub host: String,
    pub total_pings: u64,
    pub successful_pings: u64,
    pub failed_pings: u64,
    /// Percentage of successful pings in the window.
    pub success_rate: f64,
    pub avg_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub last_status: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// State machine outcome of one observed result.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No state change of interest (`Unknown -> Up`, `Up -> Up`).
    None,
    /// `Up -> Down`: a new disconnect event was opened.
    Opened(DisconnectEvent),
    /// `Down -> Down`: the open event grew by one failure.
    Extended(DisconnectEvent),
    /// `Down -> Up`: the open event closed.
    Closed(DisconnectEvent),
}

/// What one call to [`TargetAggregator::observe`] produced.
#[derive(Debug)]
pub struct Observation {
    pub transition: Transition,
    /// Present every `report_cycles` results; the window resets after it.
    pub snapshot: Option<StatsSnapshot>,
}

/// Per-target statistics aggregator and disconnect detector.
pub struct TargetAggregator {
    stats: TargetStats,
    open_event: Option<DisconnectEvent>,
    report_cycles: u32,
    cycles_in_window: u32,
}

impl TargetAggregator {
    pub fn new(target_name: &str, host: &str, report_cycles: u32) -> Self {
        Self {
            stats: TargetStats::new(target_name, host),
            open_event: None,
            report_cycles: report_cycles.max(1),
            cycles_in_window: 0,
        }
    }

    pub fn stats(&self) -> &TargetStats {
        &self.stats
    }

    pub fn open_event(&self) -> Option<&DisconnectEvent> {
        self.open_event.as_ref()
    }

    /// Fold one result into the running view.
    ///
    /// Results must arrive in probe order; the caller owns that guarantee by
    /// construction (the probe loop awaits each cycle before observing it).
    pub fn observe(&mut self, result: &ProbeResult) -> Observation {
        self.stats.record(result.success, result.response_time_ms);
        self.cycles_in_window += 1;

        let transition = self.transition(result);

        let snapshot = if self.cycles_in_window >= self.report_cycles {
            let snap = self.snapshot(result.timestamp);
            self.stats.reset_window();
            self.cycles_in_window = 0;
            Some(snap)
        } else {
            None
        };

        Observation {
            transition,
            snapshot,
        }
    }

    fn transition(&mut self, result: &ProbeResult) -> Transition {
        use HealthState::*;

        let previous = self.stats.current_state;
        let next = if result.success { Up } else { Down };
        self.stats.current_state = next;

        match (previous, next) {
            // First result decides the state without recording an event.
            (Unknown, _) => Transition::None,
            (Up, Up) => Transition::None,
            (Up, Down) => {
                let event = DisconnectEvent {
                    target_name: result.target_name.clone(),
                    host: result.host.clone(),
                    start_time: result.timestamp,
                    end_time: None,
                    consecutive_failure_count: 1,
                    reason: result
                        .error_kind
                        .map(|k| k.as_str().to_string())
                        .unwrap_or_default(),
                };
                self.open_event = Some(event.clone());
                Transition::Opened(event)
            }
            (Down, Down) => match self.open_event.as_mut() {
                Some(event) => {
                    event.consecutive_failure_count += 1;
                    Transition::Extended(event.clone())
                }
                // Down since the very first result: no event was ever opened.
                None => Transition::None,
            },
            (Down, Up) => match self.open_event.take() {
                Some(mut event) => {
                    event.end_time = Some(result.timestamp);
                    Transition::Closed(event)
                }
                None => Transition::None,
            },
            // `next` is derived from `result.success` above and is only ever
            // `Up` or `Down`, never `Unknown`, so these cases cannot occur.
            (Up, Unknown) | (Down, Unknown) => unreachable!(),
        }
    }

    fn snapshot(&self, timestamp: DateTime<Utc>) -> StatsSnapshot {
        let stats = &self.stats;
        let success_rate = if stats.ping_count > 0 {
            stats.success_count as f64 / stats.ping_count as f64 * 100.0
        } else {
            0.0
        };

        StatsSnapshot {
            target_name: stats.target_name.clone(),
            host: stats.host.clone(),
            total_pings: stats.ping_count,
            successful_pings: stats.success_count,
            failed_pings: stats.failure_count,
            success_rate,
            avg_response_time: stats.avg_rt,
            min_response_time: stats.min_rt,
            max_response_time: stats.max_rt,
            last_status: stats.current_state.as_column(),
            timestamp,
        }
    }
}
