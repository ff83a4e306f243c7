/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable at-least-once delivery. Fan-out rows live in the store
//! (`activity_targets`); this worker scans targets with pending rows and
//! walks each target's queue in activity order. Order is strict per target:
//! a head that is backed off or fails transiently blocks its tail until it
//! is delivered or marked failed. Distinct targets are independent and are
//! processed concurrently within a tick.

use crate::delivery::DeliverySender;
use crate::errors::DeliveryFailure;
use crate::federation_db::{now_ms, DeliveryJob, FederationDb, QueueDepth};
use anyhow::Result;
use futures_util::future::join_all;
use rand::{rngs::OsRng, RngCore};
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DeliveryQueue {
    db: FederationDb,
    notify: Arc<Notify>,
}

#[derive(Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub batch_size: u32,
    pub tick_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
            batch_size: 40,
            tick_ms: 500,
        }
    }
}

impl DeliveryQueue {
    pub fn new(db: FederationDb) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Fan `activity_id` out to `targets` and wake the worker. The rows are
    /// committed before this returns, so a crash after enqueue loses nothing.
    pub async fn enqueue(&self, activity_id: &str, targets: Vec<String>) -> Result<u64> {
        if targets.is_empty() {
            return Ok(0);
        }
        let added = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let activity_id = activity_id.to_string();
            move || db.add_delivery_targets(&activity_id, &targets)
        })
        .await??;
        self.notify.notify_one();
        Ok(added)
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        sender: DeliverySender,
        settings: QueueSettings,
    ) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, sender, settings).await {
                warn!("delivery worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        sender: DeliverySender,
        settings: QueueSettings,
    ) -> Result<()> {
        info!("delivery worker started, db: {}", self.db.path().display());
        let tick = Duration::from_millis(settings.tick_ms.max(10));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let targets = tokio::task::spawn_blocking({
                let db = self.db.clone();
                move || db.targets_with_pending()
            })
            .await??;

            let mut progressed = false;
            if !targets.is_empty() {
                let results = join_all(targets.into_iter().map(|target| {
                    let queue = self.clone();
                    let sender = sender.clone();
                    async move { queue.process_target(&sender, &settings, target).await }
                }))
                .await;
                for r in results {
                    match r {
                        Ok(p) => progressed |= p,
                        Err(e) => warn!("delivery target error: {e:#}"),
                    }
                }
            }

            if !progressed {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// Walk one target's queue head-first. Returns whether any row changed
    /// state, so the caller can idle when every head is backed off.
    async fn process_target(
        &self,
        sender: &DeliverySender,
        settings: &QueueSettings,
        target: String,
    ) -> Result<bool> {
        let jobs = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let target = target.clone();
            let limit = settings.batch_size;
            move || db.pending_for_target(&target, limit)
        })
        .await??;

        let mut progressed = false;
        for job in jobs {
            if job.next_attempt_at_ms > now_ms() {
                break;
            }
            match sender.deliver(&target, &job.payload_json).await {
                Ok(()) => {
                    self.with_db({
                        let (id, target) = (job.activity_id.clone(), target.clone());
                        move |db| db.mark_delivered(&id, &target)
                    })
                    .await?;
                    progressed = true;
                }
                Err(DeliveryFailure::Permanent(reason)) => {
                    warn!(
                        "delivery rejected activity_id={} target={target}: {reason}",
                        job.activity_id
                    );
                    self.with_db({
                        let (id, target) = (job.activity_id.clone(), target.clone());
                        move |db| db.mark_failed(&id, &target, &reason)
                    })
                    .await?;
                    progressed = true;
                }
                Err(DeliveryFailure::Transient(reason)) => {
                    let attempt_no = job.attempt.saturating_add(1);
                    if attempt_no >= settings.max_attempts {
                        warn!(
                            "delivery exhausted activity_id={} target={target}: {reason}",
                            job.activity_id
                        );
                        self.with_db({
                            let (id, target) = (job.activity_id.clone(), target.clone());
                            move |db| db.mark_failed(&id, &target, &reason)
                        })
                        .await?;
                        progressed = true;
                    } else {
                        let delay = next_backoff(
                            attempt_no,
                            settings.base_backoff_secs,
                            settings.max_backoff_secs,
                        );
                        debug!(
                            "delivery retry activity_id={} target={target} attempt={attempt_no} in {delay:?}",
                            job.activity_id
                        );
                        let next = now_ms().saturating_add(delay.as_millis() as i64);
                        self.with_db({
                            let (id, target) = (job.activity_id.clone(), target.clone());
                            move |db| db.reschedule_delivery(&id, &target, attempt_no, next, &reason)
                        })
                        .await?;
                    }
                    // The head stays pending (or just died); either way the
                    // tail must not overtake this tick.
                    break;
                }
            }
        }
        Ok(progressed)
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        self.with_db(|db| db.queue_depth()).await
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FederationDb) -> crate::errors::EngineResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }
}

pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation_db::ActivityOrigin;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = 5;
        let max = 3600;
        assert!(next_backoff(1, base, max) >= Duration::from_secs(5));
        assert!(next_backoff(1, base, max) < Duration::from_secs(7));
        assert!(next_backoff(4, base, max) >= Duration::from_secs(40));
        assert!(next_backoff(30, base, max) <= Duration::from_secs(3601));
    }

    #[tokio::test]
    async fn enqueue_records_pending_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = FederationDb::open(dir.path().join("q.db")).unwrap();
        db.append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{}")
            .unwrap();
        let queue = DeliveryQueue::new(db);
        let added = queue
            .enqueue("a1", vec!["http://b".to_string(), "http://c".to_string()])
            .await
            .unwrap();
        assert_eq!(added, 2);
        // Re-enqueue of the same pair is absorbed.
        let added = queue.enqueue("a1", vec!["http://b".to_string()]).await.unwrap();
        assert_eq!(added, 0);
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.pending, 2);
    }
}
