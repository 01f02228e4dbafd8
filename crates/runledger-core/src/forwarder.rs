//! Background delivery of confirmed runs to the remote collector.
//!
//! Never on the write path: the forwarder owns its own store connection and
//! polls for undelivered rows. Delivery is at-least-once; the collector
//! dedupes on `event_id`. A run is marked posted only on a 2xx, otherwise
//! its retry counter is bumped and the next cycle backs off exponentially.
//! Runs that hit the retry ceiling drop out of the scan but stay queryable.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{DeliveryError, Result, StoreError};
use crate::model::Run;
use crate::retry::{RetryPolicy, with_retry};
use crate::store::RunStore;
use crate::telemetry::Counters;

/// Outcome of one delivery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub scanned: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Polls the indexed store and POSTs undelivered runs to the collector.
pub struct SyncForwarder {
    store: Mutex<RunStore>,
    client: reqwest::Client,
    collector_url: String,
    config: SyncConfig,
    policy: RetryPolicy,
    /// Backoff for the local mark/bump writes, which can hit WAL-writer
    /// contention with the recorder.
    write_policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl SyncForwarder {
    /// Open a dedicated store connection for delivery bookkeeping.
    pub fn open(
        db_path: &Path,
        collector_url: impl Into<String>,
        config: SyncConfig,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let store = RunStore::open(db_path)?;
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;
        let policy = RetryPolicy::from_sync_config(&config);
        Ok(Self {
            store: Mutex::new(store),
            client,
            collector_url: collector_url.into(),
            config,
            policy,
            write_policy: RetryPolicy::db_write(),
            counters,
        })
    }

    /// One sweep: scan, deliver, record the outcome per run.
    ///
    /// Each run's mark/bump is applied before moving on, so cancellation
    /// between runs never leaves a delivery half-recorded.
    pub async fn sync_once(&self) -> Result<SyncStats> {
        let runs = self.with_store(|store| {
            store.unposted_runs(self.config.batch_size, self.config.max_attempts)
        })?;

        let mut stats = SyncStats {
            scanned: runs.len(),
            ..SyncStats::default()
        };
        for run in runs {
            match self.deliver(&run).await {
                Ok(()) => {
                    with_retry(&self.write_policy, || async {
                        self.with_store(|store| store.mark_posted(&run.event_id, Utc::now()))
                    })
                    .await?;
                    self.counters.incr_deliveries();
                    stats.delivered += 1;
                    debug!(event_id = %run.event_id, "run delivered to collector");
                }
                Err(e) => {
                    let attempts = with_retry(&self.write_policy, || async {
                        self.with_store(|store| store.bump_retry(&run.event_id))
                    })
                    .await?;
                    self.counters.incr_delivery_failures();
                    stats.failed += 1;
                    if attempts >= self.config.max_attempts {
                        warn!(
                            event_id = %run.event_id,
                            attempts,
                            error = %e,
                            "delivery retry ceiling reached; run remains local-only"
                        );
                    } else {
                        warn!(event_id = %run.event_id, attempts, error = %e, "delivery failed");
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Poll loop with exponential backoff between failing cycles. Exits on
    /// the shutdown signal after one final drain sweep.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failing_cycles: u32 = 0;
        loop {
            let delay = if failing_cycles == 0 {
                self.config.poll_interval()
            } else {
                self.policy
                    .delay_for_attempt(failing_cycles - 1)
                    .max(self.config.poll_interval())
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(delay) => {
                    match self.sync_once().await {
                        Ok(stats) if stats.failed > 0 => failing_cycles += 1,
                        Ok(_) => failing_cycles = 0,
                        Err(e) => {
                            failing_cycles += 1;
                            warn!(error = %e, "delivery sweep failed");
                        }
                    }
                }
            }
        }
        // Drain before exit so a signal during sleep does not strand
        // already-confirmed runs.
        match self.sync_once().await {
            Ok(stats) => info!(delivered = stats.delivered, "forwarder drained on shutdown"),
            Err(e) => warn!(error = %e, "final drain sweep failed"),
        }
    }

    async fn deliver(&self, run: &Run) -> std::result::Result<(), DeliveryError> {
        let url = format!("{}/runs", self.collector_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(run)
            .send()
            .await
            .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut RunStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| StoreError::Database("forwarder store mutex poisoned".into()))?;
        f(&mut store)
    }
}

impl std::fmt::Debug for SyncForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncForwarder")
            .field("collector_url", &self.collector_url)
            .finish_non_exhaustive()
    }
}
