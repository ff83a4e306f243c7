/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Bounded re-check of deferred activities. An activity that referenced an
//! unknown entity (a comment racing ahead of its video) is parked by the
//! ingest pipeline; this worker re-applies it with backoff until the
//! reference resolves or attempts run out, at which point the job is marked
//! dead and the activity stays committed but unapplied.

use crate::delivery_queue::next_backoff;
use crate::errors::EngineError;
use crate::federation_db::{now_ms, FederationDb, RecheckJob};
use crate::ingest::Ingestor;
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};
use vodfed_protocol::Activity;

#[derive(Clone, Copy)]
pub struct RecheckSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Poll interval while the queue is empty.
    pub tick_ms: u64,
}

impl Default for RecheckSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_secs: 1,
            max_backoff_secs: 60,
            tick_ms: 250,
        }
    }
}

#[derive(Clone)]
pub struct RecheckWorker {
    notify: Arc<Notify>,
    settings: RecheckSettings,
}

impl Default for RecheckWorker {
    fn default() -> Self {
        Self::new(RecheckSettings::default())
    }
}

impl RecheckWorker {
    pub fn new(settings: RecheckSettings) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            settings: RecheckSettings {
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn start(&self, shutdown: watch::Receiver<bool>, db: FederationDb, ingestor: Ingestor) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_loop(shutdown, db, ingestor).await {
                warn!("recheck worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        db: FederationDb,
        ingestor: Ingestor,
    ) -> Result<()> {
        let tick = Duration::from_millis(self.settings.tick_ms.max(10));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = tokio::task::spawn_blocking({
                let db = db.clone();
                move || db.due_recheck_jobs(20)
            })
            .await??;

            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.process_one(&db, &ingestor, job).await {
                    warn!("recheck job error: {e:#}");
                }
            }
        }
        Ok(())
    }

    async fn process_one(&self, db: &FederationDb, ingestor: &Ingestor, job: RecheckJob) -> Result<()> {
        let activity: Activity = match serde_json::from_slice(&job.payload_json) {
            Ok(a) => a,
            Err(e) => {
                // Committed payloads are produced by us; a parse failure
                // here means the row is corrupt, not retryable.
                self.mark_dead(db, &job.activity_id, &format!("corrupt payload: {e}"))
                    .await?;
                return Ok(());
            }
        };

        match ingestor.apply_remote(&activity).await {
            Ok(()) => {
                info!("recheck resolved activity_id={}", job.activity_id);
                tokio::task::spawn_blocking({
                    let db = db.clone();
                    let id = job.activity_id.clone();
                    move || db.mark_recheck_done(&id)
                })
                .await??;
            }
            Err(EngineError::UnknownReference(what)) => {
                let attempt_no = job.attempt.saturating_add(1);
                if attempt_no >= self.settings.max_attempts {
                    warn!(
                        "recheck exhausted activity_id={} ({what}), dropping",
                        job.activity_id
                    );
                    self.mark_dead(db, &job.activity_id, &what).await?;
                } else {
                    let delay = next_backoff(
                        attempt_no,
                        self.settings.base_backoff_secs,
                        self.settings.max_backoff_secs,
                    );
                    let next = now_ms().saturating_add(delay.as_millis() as i64);
                    tokio::task::spawn_blocking({
                        let db = db.clone();
                        let id = job.activity_id.clone();
                        move || db.reschedule_recheck(&id, attempt_no, next, &what)
                    })
                    .await??;
                }
            }
            Err(e) => {
                self.mark_dead(db, &job.activity_id, &format!("{e}")).await?;
            }
        }
        Ok(())
    }

    async fn mark_dead(&self, db: &FederationDb, activity_id: &str, reason: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db = db.clone();
            let id = activity_id.to_string();
            let reason = reason.to_string();
            move || db.mark_recheck_dead(&id, &reason)
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_queue::DeliveryQueue;
    use crate::ingest::{IngestOutcome, IngestSettings, Ingestor};
    use vodfed_protocol::{ActivityPayload, CommentObject, VideoObject};

    fn comment_body(actor: &str) -> Vec<u8> {
        serde_json::to_vec(&Activity {
            id: format!("{actor}/activities/c1"),
            actor: actor.to_string(),
            payload: ActivityPayload::CommentCreated {
                comment: CommentObject {
                    uuid: "c1".into(),
                    origin: actor.to_string(),
                    video_uuid: "v1".into(),
                    video_origin: actor.to_string(),
                    text: "early".into(),
                    published_ms: 1,
                },
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn deferred_comment_lands_once_video_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let db = FederationDb::open(dir.path().join("r.db")).unwrap();
        let queue = DeliveryQueue::new(db.clone());
        let ingestor = Ingestor::new(
            db.clone(),
            queue,
            "http://me".into(),
            IngestSettings {
                recheck_delay_ms: 0,
                ..Default::default()
            },
        );

        let outcome = ingestor.ingest_remote(&comment_body("http://other")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred);

        let worker = RecheckWorker::new(RecheckSettings {
            max_attempts: 5,
            tick_ms: 50,
            ..Default::default()
        });
        let (_tx, shutdown) = watch::channel(false);
        worker.start(shutdown, db.clone(), ingestor.clone());

        // First pass fails again (video still unknown) and backs off.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(db.queue_depth().unwrap().recheck_pending, 1);
        assert_eq!(db.stats_snapshot("http://me").unwrap().total_video_comments, 0);

        // Deliver the missing video, then wait out the backoff.
        let video = Activity {
            id: "http://other/activities/v1".into(),
            actor: "http://other".into(),
            payload: ActivityPayload::VideoCreated {
                video: VideoObject {
                    uuid: "v1".into(),
                    origin: "http://other".into(),
                    name: "clip".into(),
                    size_bytes: 3,
                    published_ms: 0,
                },
            },
        };
        ingestor
            .ingest_remote(&serde_json::to_vec(&video).unwrap())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if db.queue_depth().unwrap().recheck_pending == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "recheck never drained");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(db.stats_snapshot("http://me").unwrap().total_video_comments, 1);
    }
}
