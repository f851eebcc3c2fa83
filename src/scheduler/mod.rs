//! Per-target probe scheduling.
//!
//! One task per target. Each loop runs its probe, folds the result into the
//! target's own aggregator, and hands rows to the persistence writer and
//! metrics collector without blocking — a slow consumer never stalls
//! probing, and nothing is shared between targets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::OverrunPolicy;
use crate::db::{PingRecord, WriteRequest, WriterHandle};
use crate::metrics::MetricsCollector;
use crate::probe::{run_probe, ProbeResult};
use crate::registry::{Registry, Target};
use crate::stats::{TargetAggregator, Transition};

/// Upper bound on the random start offset of each probe loop.
const START_JITTER_MS: u64 = 1000;

/// Spawns and owns the probe loops.
pub struct Scheduler {
    registry: Registry,
    report_cycles: u32,
    on_overrun: OverrunPolicy,
    writer: WriterHandle,
    metrics: Arc<MetricsCollector>,
}

impl Scheduler {
    pub fn new(
        registry: Registry,
        report_cycles: u32,
        on_overrun: OverrunPolicy,
        writer: WriterHandle,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            report_cycles,
            on_overrun,
            writer,
            metrics,
        }
    }

    /// Start one probe loop per target. The returned handles complete once
    /// the shutdown signal is observed.
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!("starting scheduler with {} targets", self.registry.len());

        self.registry
            .iter()
            .map(|target| {
                tracing::info!(
                    "scheduler: adding target {} ({}), interval {:?}",
                    target.name,
                    target.host,
                    target.interval
                );

                let aggregator =
                    TargetAggregator::new(&target.name, &target.host, self.report_cycles);

                tokio::spawn(run_probe_loop(
                    target.clone(),
                    aggregator,
                    self.writer.clone(),
                    self.metrics.clone(),
                    self.on_overrun,
                    shutdown.subscribe(),
                ))
            })
            .collect()
    }
}

/// Run the probe loop for a single target until shutdown.
async fn run_probe_loop(
    target: Target,
    mut aggregator: TargetAggregator,
    writer: WriterHandle,
    metrics: Arc<MetricsCollector>,
    on_overrun: OverrunPolicy,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // Random start offset so targets sharing an interval don't probe in
    // phase. Applied once, outside the cycle, to keep timings unbiased.
    let jitter = Duration::from_millis(rand::random::<u64>() % START_JITTER_MS);
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut interval = tokio::time::interval(target.interval);
    interval.set_missed_tick_behavior(match on_overrun {
        // A probe that outran the interval re-fires immediately after it
        // completes; later ticks re-align to the schedule.
        OverrunPolicy::Refire => MissedTickBehavior::Delay,
        OverrunPolicy::Skip => MissedTickBehavior::Skip,
    });

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
        }

        // The in-flight probe is bounded by the target's own timeout, so a
        // shutdown signal is observed at the top of the next cycle at the
        // latest.
        let timestamp = Utc::now();
        let result = match run_probe(&target.host, target.timeout).await {
            Ok(rtt_ms) => {
                tracing::debug!("[ok] {}: {:.2}ms", target.name, rtt_ms);
                ProbeResult::success(&target.name, &target.host, timestamp, rtt_ms)
            }
            Err(e) => {
                tracing::debug!("[fail] {}: {}", target.name, e);
                ProbeResult::failure(&target.name, &target.host, timestamp, e.kind())
            }
        };

        process_result(&result, &mut aggregator, &writer, &metrics);
    }

    tracing::info!("probe loop stopped for {}", target.name);
}

/// Fan one result out to persistence, statistics and metrics. Everything in
/// here is non-blocking.
fn process_result(
    result: &ProbeResult,
    aggregator: &mut TargetAggregator,
    writer: &WriterHandle,
    metrics: &MetricsCollector,
) {
    writer.enqueue(WriteRequest::Ping(PingRecord::from(result)));

    if let Some(rtt_ms) = result.response_time_ms {
        metrics.record_ping_time(&result.target_name, rtt_ms);
    }

    let observation = aggregator.observe(result);

    match observation.transition {
        Transition::None => {}
        Transition::Opened(event) => {
            tracing::warn!(
                "disconnect detected for {} ({}): {}",
                event.target_name,
                event.host,
                event.reason
            );
            metrics.record_disconnect(&event.target_name);
            writer.enqueue(WriteRequest::Disconnect(event));
        }
        Transition::Extended(event) => {
            writer.enqueue(WriteRequest::Disconnect(event));
        }
        Transition::Closed(event) => {
            tracing::info!(
                "{} ({}) recovered after {} failed probes",
                event.target_name,
                event.host,
                event.consecutive_failure_count
            );
            writer.enqueue(WriteRequest::Disconnect(event));
        }
    }

    if let Some(snapshot) = observation.snapshot {
        writer.enqueue(WriteRequest::Stats(snapshot));
    }
}
