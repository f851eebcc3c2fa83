//! In-memory metrics with drain-on-scrape semantics.
//!
//! One slot per target, each behind its own mutex: writers for different
//! targets never contend, and a scrape takes-and-clears each slot as one
//! atomic step, so an update landing mid-scrape is either served now or
//! kept intact for the next scrape — never lost.
//!
//! The target set is fixed at startup, which keeps the map itself free of
//! any lock.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::registry::Registry;

/// Exposition name of the last-round-trip gauge.
pub const PING_TIME_METRIC: &str = "pingit_ping_time_ms";

/// Exposition name of the disconnect counter.
pub const DISCONNECT_METRIC: &str = "pingit_disconnect_events_total";

#[derive(Debug, Default, Clone, Copy)]
struct SlotValues {
    /// Last successful round-trip time since the previous scrape.
    ping_time_ms: Option<f64>,
    /// Disconnect events opened since the previous scrape.
    disconnects: u64,
}

struct TargetSlot {
    name: String,
    host: String,
    values: Mutex<SlotValues>,
}

/// Drained view of one target's slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub target_name: String,
    pub host: String,
    pub ping_time_ms: Option<f64>,
    pub disconnects: u64,
}

/// Pull-based metrics store for all targets.
pub struct MetricsCollector {
    slots: Vec<TargetSlot>,
    by_name: HashMap<String, usize>,
}

impl MetricsCollector {
    /// Build the collector with one slot per registered target.
    pub fn new(registry: &Registry) -> Self {
        let slots: Vec<TargetSlot> = registry
            .iter()
            .map(|t| TargetSlot {
                name: t.name.clone(),
                host: t.host.clone(),
                values: Mutex::new(SlotValues::default()),
            })
            .collect();

        let by_name = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        Self { slots, by_name }
    }

    /// Record a successful round-trip time. Last value wins within a scrape
    /// window.
    pub fn record_ping_time(&self, target_name: &str, rtt_ms: f64) {
        if let Some(slot) = self.slot(target_name) {
            slot.values.lock().unwrap().ping_time_ms = Some(rtt_ms);
        }
    }

    /// Count one newly opened disconnect event.
    pub fn record_disconnect(&self, target_name: &str) {
        if let Some(slot) = self.slot(target_name) {
            slot.values.lock().unwrap().disconnects += 1;
        }
    }

    fn slot(&self, target_name: &str) -> Option<&TargetSlot> {
        self.by_name.get(target_name).map(|&i| &self.slots[i])
    }

    /// Take the current values of every slot and reset them to zero.
    pub fn drain(&self) -> Vec<MetricSample> {
        self.slots
            .iter()
            .map(|slot| {
                let values = {
                    let mut guard = slot.values.lock().unwrap();
                    std::mem::take(&mut *guard)
                };
                MetricSample {
                    target_name: slot.name.clone(),
                    host: slot.host.clone(),
                    ping_time_ms: values.ping_time_ms,
                    disconnects: values.disconnects,
                }
            })
            .collect()
    }

    /// Drain and render the Prometheus text exposition.
    ///
    /// Gauge lines appear only for targets with a successful probe since the
    /// last scrape; counter lines only for targets with new disconnects.
    pub fn render(&self) -> String {
        let samples = self.drain();

        let mut out = String::new();
        out.push_str("# HELP pingit_ping_time_ms Ping response time in milliseconds\n");
        out.push_str("# TYPE pingit_ping_time_ms gauge\n");
        out.push_str(
            "# HELP pingit_disconnect_events_total Total disconnect events for target\n",
        );
        out.push_str("# TYPE pingit_disconnect_events_total counter\n");

        for sample in &samples {
            if let Some(ms) = sample.ping_time_ms {
                out.push_str(&format!(
                    "{}{{target_name=\"{}\",host=\"{}\"}} {}\n",
                    PING_TIME_METRIC, sample.target_name, sample.host, ms
                ));
            }
        }
        for sample in &samples {
            if sample.disconnects > 0 {
                out.push_str(&format!(
                    "{}{{target_name=\"{}\",host=\"{}\"}} {}\n",
                    DISCONNECT_METRIC, sample.target_name, sample.host, sample.disconnects
                ));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Target;
    use std::sync::Arc;
    use std::time::Duration;

    fn collector(names: &[(&str, &str)]) -> MetricsCollector {
        let targets = names
            .iter()
            .map(|(name, host)| Target {
                name: name.to_string(),
                host: host.to_string(),
                interval: Duration::from_secs(60),
                timeout: Duration::from_secs(5),
            })
            .collect();
        MetricsCollector::new(&Registry::new(targets))
    }

    #[test]
    fn last_value_wins_within_a_scrape_window() {
        let metrics = collector(&[("gw", "192.168.1.1")]);
        metrics.record_ping_time("gw", 3.0);
        metrics.record_ping_time("gw", 7.5);

        let samples = metrics.drain();
        assert_eq!(samples[0].ping_time_ms, Some(7.5));
    }

    #[test]
    fn drain_is_idempotent() {
        let metrics = collector(&[("gw", "192.168.1.1")]);
        metrics.record_ping_time("gw", 3.0);
        metrics.record_disconnect("gw");

        let first = metrics.drain();
        assert_eq!(first[0].ping_time_ms, Some(3.0));
        assert_eq!(first[0].disconnects, 1);

        // Nothing happened in between: the second drain is zero/empty.
        let second = metrics.drain();
        assert_eq!(second[0].ping_time_ms, None);
        assert_eq!(second[0].disconnects, 0);
    }

    #[test]
    fn disconnects_accumulate_between_scrapes() {
        let metrics = collector(&[("gw", "192.168.1.1")]);
        metrics.record_disconnect("gw");
        metrics.record_disconnect("gw");

        assert_eq!(metrics.drain()[0].disconnects, 2);
    }

    #[test]
    fn unknown_targets_are_ignored() {
        let metrics = collector(&[("gw", "192.168.1.1")]);
        metrics.record_ping_time("nope", 1.0);
        metrics.record_disconnect("nope");

        let samples = metrics.drain();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].ping_time_ms, None);
    }

    #[test]
    fn exposition_format() {
        let metrics = collector(&[("gw", "192.168.1.1"), ("dns", "8.8.8.8")]);
        metrics.record_ping_time("gw", 12.5);
        metrics.record_disconnect("dns");

        let body = metrics.render();
        assert!(body.contains("# TYPE pingit_ping_time_ms gauge"));
        assert!(body.contains("# TYPE pingit_disconnect_events_total counter"));
        assert!(body.contains("pingit_ping_time_ms{target_name=\"gw\",host=\"192.168.1.1\"} 12.5"));
        assert!(body
            .contains("pingit_disconnect_events_total{target_name=\"dns\",host=\"8.8.8.8\"} 1"));
        // dns had no successful probe, gw had no disconnect.
        assert!(!body.contains("pingit_ping_time_ms{target_name=\"dns\""));
        assert!(!body.contains("pingit_disconnect_events_total{target_name=\"gw\""));

        // A scrape with no intervening activity serves only the preamble.
        let empty = metrics.render();
        assert!(!empty.contains("target_name="));
    }

    #[test]
    fn concurrent_writers_do_not_lose_increments() {
        let metrics = Arc::new(collector(&[("a", "1.1.1.1"), ("b", "2.2.2.2")]));

        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    metrics.record_disconnect(name);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = metrics.drain().iter().map(|s| s.disconnects).sum();
        assert_eq!(total, 1000);
    }
}
