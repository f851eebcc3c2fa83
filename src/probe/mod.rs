//! ICMP echo probing.
//!
//! One probe cycle issues a single echo request and reports the round-trip
//! time or a classified failure. No retries happen inside a cycle.

mod ping;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Failure classification recorded on an unsuccessful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Unreachable,
    HostResolutionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::HostResolutionFailed => "host_resolution_failed",
        }
    }
}

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("host resolution failed: {0}")]
    Resolution(String),
}

impl ProbeError {
    /// Collapse the error into the kind stored on the result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::Unreachable(_) => ErrorKind::Unreachable,
            ProbeError::Resolution(_) => ErrorKind::HostResolutionFailed,
        }
    }
}

/// Outcome of one probe cycle for one target.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target_name: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Round-trip time in milliseconds, present on success only.
    pub response_time_ms: Option<f64>,
    pub error_kind: Option<ErrorKind>,
}

impl ProbeResult {
    pub fn success(target_name: &str, host: &str, timestamp: DateTime<Utc>, rtt_ms: f64) -> Self {
        Self {
            target_name: target_name.to_string(),
            host: host.to_string(),
            timestamp,
            success: true,
            response_time_ms: Some(rtt_ms),
            error_kind: None,
        }
    }

    pub fn failure(
        target_name: &str,
        host: &str,
        timestamp: DateTime<Utc>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            target_name: target_name.to_string(),
            host: host.to_string(),
            timestamp,
            success: false,
            response_time_ms: None,
            error_kind: Some(kind),
        }
    }
}

/// Run one echo probe against `host`.
///
/// Returns the round-trip time in milliseconds on success. A reply that
/// arrives at or past the timeout boundary counts as a timeout.
pub async fn run_probe(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let rtt_ms = ping::echo(host, timeout).await?;

    if rtt_ms >= timeout.as_secs_f64() * 1000.0 {
        return Err(ProbeError::Timeout(timeout));
    }

    Ok(rtt_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_maps_to_wire_names() {
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(ErrorKind::Unreachable.as_str(), "unreachable");
        assert_eq!(
            ErrorKind::HostResolutionFailed.as_str(),
            "host_resolution_failed"
        );
    }

    #[test]
    fn probe_error_collapses_to_kind() {
        assert_eq!(
            ProbeError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ProbeError::Resolution("no such host".into()).kind(),
            ErrorKind::HostResolutionFailed
        );
    }

    #[test]
    fn result_constructors() {
        let now = Utc::now();
        let ok = ProbeResult::success("gw", "192.168.1.1", now, 1.25);
        assert!(ok.success);
        assert_eq!(ok.response_time_ms, Some(1.25));
        assert!(ok.error_kind.is_none());

        let bad = ProbeResult::failure("gw", "192.168.1.1", now, ErrorKind::Unreachable);
        assert!(!bad.success);
        assert!(bad.response_time_ms.is_none());
        assert_eq!(bad.error_kind, Some(ErrorKind::Unreachable));
    }
}
