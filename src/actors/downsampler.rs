//! History downsampler
//!
//! Hourly maintenance over the history table, coarser the further back
//! it goes: raw samples are kept for a week, 10-minute averages up to a
//! month, 30-minute averages up to a year, nothing beyond that. The
//! first pass runs at startup so a worker that was down for a while
//! catches up immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::storage::{StorageBackend, StorageResult};

pub const PASS_INTERVAL: Duration = Duration::from_secs(60 * 60);

const RETENTION_DAYS: i64 = 365;
const COARSE_FROM_DAYS: i64 = 31;
const FINE_FROM_DAYS: i64 = 7;

pub struct Downsampler {
    storage: Arc<dyn StorageBackend>,
    stop: mpsc::Receiver<()>,
    interval: Duration,

    /// Time of the previous completed pass. `None` until the startup
    /// pass has run, which covers each tier in full.
    last_pass: Option<DateTime<Utc>>,
}

impl Downsampler {
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting downsampler");

        // First tick fires immediately: startup catch-up.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.pass().await {
                        warn!("downsampling pass failed: {e}");
                    }
                }
                _ = self.stop.recv() => break,
            }
        }

        debug!("downsampler stopped");
    }

    async fn pass(&mut self) -> StorageResult<()> {
        let now = Utc::now();

        let deleted = self
            .storage
            .delete_history_before(now - ChronoDuration::days(RETENTION_DAYS))
            .await?;

        // After the startup pass, each tier only covers the samples that
        // crossed its boundary since the previous pass, plus a margin.
        let margin = ChronoDuration::hours(2);

        let coarse_from = match self.last_pass {
            Some(prev) => prev - ChronoDuration::days(COARSE_FROM_DAYS) - margin,
            None => now - ChronoDuration::days(RETENTION_DAYS),
        };
        let coarse = self
            .storage
            .compact_history(
                coarse_from,
                now - ChronoDuration::days(COARSE_FROM_DAYS),
                ChronoDuration::minutes(30),
            )
            .await?;

        let fine_from = match self.last_pass {
            Some(prev) => prev - ChronoDuration::days(FINE_FROM_DAYS) - margin,
            None => now - ChronoDuration::days(COARSE_FROM_DAYS),
        };
        let fine = self
            .storage
            .compact_history(
                fine_from,
                now - ChronoDuration::days(FINE_FROM_DAYS),
                ChronoDuration::minutes(10),
            )
            .await?;

        self.last_pass = Some(now);

        if deleted + coarse + fine > 0 {
            info!("history pass: {deleted} expired, {coarse} + {fine} compacted away");
        } else {
            debug!("history pass: nothing to do");
        }

        Ok(())
    }
}

/// Handle for the downsampler
#[derive(Clone)]
pub struct DownsamplerHandle {
    stop: mpsc::Sender<()>,
}

impl DownsamplerHandle {
    pub fn spawn(storage: Arc<dyn StorageBackend>) -> Self {
        Self::spawn_with_interval(storage, PASS_INTERVAL)
    }

    pub fn spawn_with_interval(storage: Arc<dyn StorageBackend>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);

        let downsampler = Downsampler {
            storage,
            stop: rx,
            interval,
            last_pass: None,
        };
        tokio::spawn(downsampler.run());

        Self { stop: tx }
    }

    pub async fn shutdown(&self) {
        let _ = self.stop.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::HistorySample;

    async fn seed(storage: &MemoryBackend, age_days: i64, count: usize, spacing_mins: i64) {
        let start = Utc::now() - ChronoDuration::days(age_days);
        for i in 0..count {
            storage
                .append_history(HistorySample {
                    metric_id: "m-1".into(),
                    timestamp: start + ChronoDuration::minutes(i as i64 * spacing_mins),
                    value: i as f64,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn startup_pass_expires_and_compacts() {
        let storage = Arc::new(MemoryBackend::new());

        // Ancient sample: expired outright.
        seed(&storage, 400, 1, 1).await;
        // Month-old minute data: folded into 10-minute buckets.
        seed(&storage, 10, 60, 1).await;
        // Recent data: untouched.
        seed(&storage, 0, 10, 1).await;

        let handle = DownsamplerHandle::spawn_with_interval(storage.clone(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let total = storage
            .history_count(Utc::now() - ChronoDuration::days(500), Utc::now() + ChronoDuration::days(1))
            .await
            .unwrap();
        // 60 minute-samples fold into at most 7 buckets; 10 recent stay.
        assert!(total <= 17, "expected compacted history, got {total} samples");

        let recent = storage
            .history_count(Utc::now() - ChronoDuration::hours(1), Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent, 10);

        let ancient = storage
            .history_count(
                Utc::now() - ChronoDuration::days(500),
                Utc::now() - ChronoDuration::days(RETENTION_DAYS),
            )
            .await
            .unwrap();
        assert_eq!(ancient, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn steady_state_pass_stays_near_the_tier_boundary() {
        let storage = Arc::new(MemoryBackend::new());

        let handle =
            DownsamplerHandle::spawn_with_interval(storage.clone(), Duration::from_millis(300));
        // Startup pass runs against an empty table.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Lands deep inside the coarse tier between two passes; a
        // steady-state pass must not reach back that far.
        seed(&storage, 100, 12, 5).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.shutdown().await;

        let deep = storage
            .history_count(
                Utc::now() - ChronoDuration::days(101),
                Utc::now() - ChronoDuration::days(99),
            )
            .await
            .unwrap();
        assert_eq!(deep, 12);
    }

    #[tokio::test]
    async fn second_pass_is_a_fixpoint() {
        let storage = Arc::new(MemoryBackend::new());
        seed(&storage, 10, 60, 1).await;

        let handle = DownsamplerHandle::spawn_with_interval(storage.clone(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let after_first = storage
            .history_count(Utc::now() - ChronoDuration::days(30), Utc::now())
            .await
            .unwrap();

        let handle = DownsamplerHandle::spawn_with_interval(storage.clone(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let after_second = storage
            .history_count(Utc::now() - ChronoDuration::days(30), Utc::now())
            .await
            .unwrap();
        assert_eq!(after_first, after_second);
    }
}
