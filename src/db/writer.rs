//! Persistence writer: consumes write requests from a bounded queue and
//! batches them into SQLite.
//!
//! Producers never block. When the queue is full the oldest pending request
//! is dropped and a backpressure warning recorded; a failed flush is retried
//! a bounded number of times with backoff, then dropped. Probing never sees
//! a storage failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

use super::models::PingRecord;
use super::store::Store;
use crate::stats::{DisconnectEvent, StatsSnapshot};

/// Maximum pending requests before the oldest is evicted.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Flush once this many requests are pending, without waiting for the tick.
const BATCH_SIZE_THRESHOLD: usize = 500;

/// Cadence of time-based flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts per failed flush.
const WRITE_ATTEMPTS: u32 = 3;

/// Backoff base between attempts; grows linearly.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// How long a shutdown drain may take before remaining items are discarded.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A unit of work for the writer.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Ping(PingRecord),
    Stats(StatsSnapshot),
    Disconnect(DisconnectEvent),
}

struct PendingQueue {
    entries: Mutex<VecDeque<WriteRequest>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Cheap handle for producers; cloned into every probe loop.
#[derive(Clone)]
pub struct WriterHandle {
    queue: Arc<PendingQueue>,
}

impl WriterHandle {
    /// Queue a write without blocking. Evicts the oldest pending request on
    /// overflow.
    pub fn enqueue(&self, request: WriteRequest) {
        let mut entries = self.queue.entries.lock().unwrap();
        if entries.len() >= self.queue.capacity {
            entries.pop_front();
            let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                "persistence queue full, dropped oldest pending write ({} total)",
                dropped
            );
        }
        entries.push_back(request);
        drop(entries);

        self.queue.notify.notify_one();
    }

    /// Writes evicted due to backpressure since startup.
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<WriteRequest> {
        self.queue.entries.lock().unwrap().iter().cloned().collect()
    }
}

/// Spawn the writer task. Returns the producer handle and the task handle.
pub fn spawn(
    store: Arc<Store>,
    capacity: usize,
    mut shutdown: broadcast::Receiver<()>,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let queue = Arc::new(PendingQueue {
        entries: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
        dropped: AtomicU64::new(0),
    });
    let handle = WriterHandle {
        queue: queue.clone(),
    };

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let remaining = queue.entries.lock().unwrap().len();
                    if remaining > 0 {
                        tracing::info!("persistence writer draining {} pending writes", remaining);
                    }
                    if tokio::time::timeout(SHUTDOWN_GRACE, flush(&store, &queue))
                        .await
                        .is_err()
                    {
                        let discarded = queue.entries.lock().unwrap().len();
                        tracing::warn!(
                            "persistence drain exceeded grace period, discarding {} writes",
                            discarded
                        );
                    }
                    break;
                }
                _ = queue.notify.notified() => {
                    if queue.entries.lock().unwrap().len() >= BATCH_SIZE_THRESHOLD {
                        flush(&store, &queue).await;
                    }
                }
                _ = interval.tick() => {
                    flush(&store, &queue).await;
                }
            }
        }

        tracing::info!("persistence writer stopped");
    });

    (handle, task)
}

/// Drain the queue and write everything out, grouped per table.
///
/// Queue order is preserved for disconnect upserts so open/extend/close
/// sequences for one target land in order.
async fn flush(store: &Store, queue: &PendingQueue) {
    let batch: Vec<WriteRequest> = {
        let mut entries = queue.entries.lock().unwrap();
        entries.drain(..).collect()
    };
    if batch.is_empty() {
        return;
    }

    let mut pings = Vec::new();
    let mut snapshots = Vec::new();
    let mut disconnects = Vec::new();

    for request in batch {
        match request {
            WriteRequest::Ping(r) => pings.push(r),
            WriteRequest::Stats(s) => snapshots.push(s),
            WriteRequest::Disconnect(e) => disconnects.push(e),
        }
    }

    if !pings.is_empty() {
        let count = pings.len();
        write_with_retry("ping history", count, || store.add_ping_records(&pings)).await;
    }
    if !snapshots.is_empty() {
        let count = snapshots.len();
        write_with_retry("statistics", count, || store.add_stats_snapshots(&snapshots)).await;
    }
    for event in &disconnects {
        write_with_retry("disconnect event", 1, || store.upsert_disconnect(event)).await;
    }
}

/// Run a write, retrying a bounded number of times with backoff. After the
/// final attempt the batch is dropped and the failure logged; it never
/// propagates to the probing path.
async fn write_with_retry<F>(what: &str, count: usize, mut write: F)
where
    F: FnMut() -> Result<(), super::store::DbError>,
{
    for attempt in 1..=WRITE_ATTEMPTS {
        match write() {
            Ok(()) => return,
            Err(e) if attempt < WRITE_ATTEMPTS => {
                tracing::warn!(
                    "failed to write {} batch (attempt {}/{}): {}",
                    what,
                    attempt,
                    WRITE_ATTEMPTS,
                    e
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                tracing::error!(
                    "dropping {} {} write(s) after {} attempts: {}",
                    count,
                    what,
                    WRITE_ATTEMPTS,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn ping(name: &str, secs: i64) -> WriteRequest {
        WriteRequest::Ping(PingRecord {
            target_name: name.into(),
            host: "10.0.0.1".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            success: true,
            response_time_ms: Some(1.0),
        })
    }

    fn test_handle(capacity: usize) -> WriterHandle {
        WriterHandle {
            queue: Arc::new(PendingQueue {
                entries: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    #[test]
    fn overflow_drops_oldest_and_never_blocks() {
        let handle = test_handle(3);

        for i in 0..5 {
            handle.enqueue(ping("gw", i));
        }

        let pending = handle.pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(handle.dropped_count(), 2);

        // The two oldest entries (0 and 1) were evicted.
        let first_ts = match &pending[0] {
            WriteRequest::Ping(r) => r.timestamp.timestamp() - 1_700_000_000,
            other => panic!("unexpected entry: {:?}", other),
        };
        assert_eq!(first_ts, 2);
    }

    #[tokio::test]
    async fn writer_flushes_to_store_and_drains_on_shutdown() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (handle, task) = spawn(store.clone(), 100, shutdown_rx);

        handle.enqueue(ping("gw", 0));
        handle.enqueue(ping("gw", 60));
        handle.enqueue(WriteRequest::Disconnect(DisconnectEvent {
            target_name: "gw".into(),
            host: "10.0.0.1".into(),
            start_time: Utc.timestamp_opt(1_700_000_120, 0).unwrap(),
            end_time: None,
            consecutive_failure_count: 1,
            reason: "timeout".into(),
        }));

        // Shutdown drains whatever is still pending.
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let records = store
            .get_ping_records(
                "gw",
                Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                Utc.timestamp_opt(1_700_001_000, 0).unwrap(),
                100,
            )
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(store.get_open_disconnect("gw").unwrap().is_some());
    }
}
