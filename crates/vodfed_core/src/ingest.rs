/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Activity ingestion and local publication.
//!
//! Inbound activities are committed to the store first (which absorbs
//! at-least-once redelivery), then applied to materialized state. Apply is
//! idempotent per activity id, so the pipeline survives a crash between
//! commit and apply being replayed by the sender.
//!
//! Locally originated operations run the same apply path with `is_local`
//! set, then fan out to accepted followers through the delivery queue.

use crate::delivery_queue::DeliveryQueue;
use crate::errors::{EngineError, EngineResult};
use crate::federation_db::{
    new_activity_id, now_ms, random_hex, ActivityOrigin, AppendOutcome, FederationDb,
};
use crate::follow::FollowState;
use tracing::{debug, info, warn};
use vodfed_protocol::{Activity, ActivityPayload, CommentObject, VideoObject, ViewObject};

#[derive(Clone, Copy)]
pub struct IngestSettings {
    /// Repeated views of one video by one viewer inside this window count
    /// once.
    pub view_debounce_ms: i64,
    /// Delay before the first re-check of an activity that referenced an
    /// unknown entity.
    pub recheck_delay_ms: i64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            view_debounce_ms: 5_000,
            recheck_delay_ms: 500,
        }
    }
}

/// What happened to an inbound activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Committed and applied.
    Applied,
    /// Already committed with the same payload; nothing re-applied.
    AlreadyKnown,
    /// Committed, but it references an entity not known yet. Parked on the
    /// re-check queue; the sender still gets a success.
    Deferred,
}

#[derive(Clone)]
pub struct Ingestor {
    db: FederationDb,
    queue: DeliveryQueue,
    origin: String,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        db: FederationDb,
        queue: DeliveryQueue,
        origin: String,
        settings: IngestSettings,
    ) -> Self {
        Self {
            db,
            queue,
            origin,
            settings,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    // ---- inbound --------------------------------------------------------

    /// Ingest one activity POSTed to the inbox.
    pub async fn ingest_remote(&self, body: &[u8]) -> EngineResult<IngestOutcome> {
        let activity: Activity = serde_json::from_slice(body)
            .map_err(|e| EngineError::InvalidActivity(format!("malformed activity: {e}")))?;
        if activity.id.trim().is_empty() || activity.actor.trim().is_empty() {
            return Err(EngineError::InvalidActivity(
                "activity id and actor must be non-empty".into(),
            ));
        }

        let canonical = serde_json::to_vec(&activity)
            .map_err(|e| EngineError::InvalidActivity(format!("re-encode: {e}")))?;
        let outcome = self
            .with_db({
                let a = activity.clone();
                let canonical = canonical.clone();
                move |db| {
                    db.append_activity(
                        &a.id,
                        &a.actor,
                        a.payload.kind(),
                        ActivityOrigin::Remote,
                        &canonical,
                    )
                }
            })
            .await?;
        if outcome == AppendOutcome::AlreadyKnown {
            debug!("inbox redelivery absorbed id={}", activity.id);
            return Ok(IngestOutcome::AlreadyKnown);
        }

        match self.apply_remote(&activity).await {
            Ok(()) => Ok(IngestOutcome::Applied),
            Err(EngineError::UnknownReference(what)) => {
                info!("deferring activity id={} ({what})", activity.id);
                let due = now_ms().saturating_add(self.settings.recheck_delay_ms);
                self.with_db({
                    let id = activity.id.clone();
                    move |db| db.enqueue_recheck(&id, &canonical, due, &what)
                })
                .await?;
                Ok(IngestOutcome::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a committed remote activity to materialized state. Called on
    /// first ingest and again by the re-check worker; every arm tolerates
    /// being re-run.
    pub async fn apply_remote(&self, activity: &Activity) -> EngineResult<()> {
        match &activity.payload {
            ActivityPayload::VideoCreated { video } => {
                let is_local = video.origin == self.origin;
                self.with_db({
                    let v = video.clone();
                    move |db| {
                        db.insert_video(
                            &v.uuid,
                            &v.origin,
                            is_local,
                            &v.name,
                            v.size_bytes,
                            v.published_ms,
                        )
                    }
                })
                .await?;
                Ok(())
            }
            ActivityPayload::CommentCreated { comment } => {
                let is_local = comment.origin == self.origin;
                self.with_db({
                    let c = comment.clone();
                    move |db| {
                        db.insert_comment(
                            &c.uuid,
                            &c.origin,
                            is_local,
                            &c.video_uuid,
                            &c.video_origin,
                            &c.text,
                            c.published_ms,
                        )
                    }
                })
                .await?;
                Ok(())
            }
            ActivityPayload::VideoViewed { view } => {
                // Updates the cached per-video counter. Remote views never
                // feed local stats, which only count local viewers.
                let debounce = self.settings.view_debounce_ms;
                self.with_db({
                    let v = view.clone();
                    move |db| db.record_view(&v.video_uuid, &v.video_origin, &v.viewer, debounce)
                })
                .await?;
                Ok(())
            }
            ActivityPayload::FollowRequested {
                follower,
                following,
            } => {
                if following != &self.origin {
                    warn!(
                        "ignoring follow request addressed to {following} (we are {})",
                        self.origin
                    );
                    return Ok(());
                }
                self.accept_follower(follower).await
            }
            ActivityPayload::FollowAccepted {
                follower,
                following,
            } => self.settle_follow_echo(follower, following, FollowState::Accepted).await,
            ActivityPayload::FollowRejected {
                follower,
                following,
            } => self.settle_follow_echo(follower, following, FollowState::Rejected).await,
        }
    }

    /// Auto-accept policy: record the edge, confirm to the follower and
    /// backfill our local content so a late follower converges to the same
    /// library as one that was present from the start.
    async fn accept_follower(&self, follower: &str) -> EngineResult<()> {
        let me = self.origin.clone();
        let state = self
            .with_db({
                let follower = follower.to_string();
                let me = me.clone();
                move |db| db.request_follow(&follower, &me)
            })
            .await?;
        match state {
            FollowState::Pending => {}
            FollowState::Accepted => {
                // The original confirmation may have been lost or marked
                // failed on our side; a re-request gets a fresh one. The
                // receiver treats a same-state echo as a no-op.
                debug!("follower {follower} already accepted, resending confirmation");
                self.publish(
                    ActivityPayload::FollowAccepted {
                        follower: follower.to_string(),
                        following: me,
                    },
                    vec![follower.to_string()],
                )
                .await?;
                return Ok(());
            }
            FollowState::Rejected => {
                warn!("follow request from previously rejected {follower}, ignoring");
                return Ok(());
            }
        }
        self.with_db({
            let follower = follower.to_string();
            let me = me.clone();
            move |db| {
                db.transition_follow(&follower, &me, FollowState::Pending, FollowState::Accepted)
            }
        })
        .await?;
        info!("accepted follower {follower}");

        // Per-target FIFO dispatches in commit order, so the follower
        // receives our existing library in original publication order and
        // the confirmation after it.
        let backlog = self.with_db(|db| db.local_content_activity_ids()).await?;
        for id in backlog {
            self.queue.enqueue(&id, vec![follower.to_string()]).await.map_err(io_err)?;
        }
        self.publish(
            ActivityPayload::FollowAccepted {
                follower: follower.to_string(),
                following: me,
            },
            vec![follower.to_string()],
        )
        .await?;
        Ok(())
    }

    /// Apply a follow outcome echoed back by the other side of an edge.
    async fn settle_follow_echo(
        &self,
        follower: &str,
        following: &str,
        to: FollowState,
    ) -> EngineResult<()> {
        let current = self
            .with_db({
                let (f, g) = (follower.to_string(), following.to_string());
                move |db| db.follow_state(&f, &g)
            })
            .await?;
        match current {
            Some(state) if state == to => Ok(()),
            Some(from) => {
                self.with_db({
                    let (f, g) = (follower.to_string(), following.to_string());
                    move |db| db.transition_follow(&f, &g, from, to)
                })
                .await?;
                info!("follow edge {follower} -> {following} now {}", to.as_str());
                Ok(())
            }
            None => Err(EngineError::UnknownReference(format!(
                "follow edge {follower} -> {following}"
            ))),
        }
    }

    // ---- local operations -----------------------------------------------

    pub async fn create_user(&self, username: &str) -> EngineResult<bool> {
        self.with_db({
            let u = username.to_string();
            move |db| db.insert_user(&u)
        })
        .await
    }

    /// Publish a local video and fan it out to accepted followers.
    pub async fn publish_video(&self, name: &str, size_bytes: i64) -> EngineResult<VideoObject> {
        let video = VideoObject {
            uuid: random_hex(),
            origin: self.origin.clone(),
            name: name.to_string(),
            size_bytes,
            published_ms: now_ms(),
        };
        self.with_db({
            let v = video.clone();
            move |db| db.insert_video(&v.uuid, &v.origin, true, &v.name, v.size_bytes, v.published_ms)
        })
        .await?;
        let followers = self.follower_targets().await?;
        self.publish(
            ActivityPayload::VideoCreated {
                video: video.clone(),
            },
            followers,
        )
        .await?;
        Ok(video)
    }

    /// Publish a local comment on a (local or cached remote) video.
    pub async fn publish_comment(
        &self,
        video_uuid: &str,
        video_origin: &str,
        text: &str,
    ) -> EngineResult<CommentObject> {
        let comment = CommentObject {
            uuid: random_hex(),
            origin: self.origin.clone(),
            video_uuid: video_uuid.to_string(),
            video_origin: video_origin.to_string(),
            text: text.to_string(),
            published_ms: now_ms(),
        };
        self.with_db({
            let c = comment.clone();
            move |db| {
                db.insert_comment(
                    &c.uuid,
                    &c.origin,
                    true,
                    &c.video_uuid,
                    &c.video_origin,
                    &c.text,
                    c.published_ms,
                )
            }
        })
        .await?;
        let mut targets = self.follower_targets().await?;
        // A comment on someone else's video also goes to its origin.
        if video_origin != self.origin && !targets.iter().any(|t| t == video_origin) {
            targets.push(video_origin.to_string());
        }
        self.publish(
            ActivityPayload::CommentCreated {
                comment: comment.clone(),
            },
            targets,
        )
        .await?;
        Ok(comment)
    }

    /// Record a local view. Coalesced repeats are acknowledged but neither
    /// counted nor federated. Returns whether the view counted.
    pub async fn record_local_view(
        &self,
        video_uuid: &str,
        video_origin: &str,
        viewer: &str,
    ) -> EngineResult<bool> {
        let debounce = self.settings.view_debounce_ms;
        let counted = self
            .with_db({
                let (u, o, v) = (
                    video_uuid.to_string(),
                    video_origin.to_string(),
                    viewer.to_string(),
                );
                move |db| db.record_view(&u, &o, &v, debounce)
            })
            .await?;
        if !counted {
            return Ok(false);
        }
        let mut targets = self.follower_targets().await?;
        if video_origin != self.origin && !targets.iter().any(|t| t == video_origin) {
            targets.push(video_origin.to_string());
        }
        self.publish(
            ActivityPayload::VideoViewed {
                view: ViewObject {
                    video_uuid: video_uuid.to_string(),
                    video_origin: video_origin.to_string(),
                    viewer: viewer.to_string(),
                },
            },
            targets,
        )
        .await?;
        Ok(true)
    }

    /// Ask to follow `following`. The edge stays pending until the other
    /// side confirms.
    pub async fn request_remote_follow(&self, following: &str) -> EngineResult<FollowState> {
        let state = self
            .with_db({
                let (me, them) = (self.origin.clone(), following.to_string());
                move |db| db.request_follow(&me, &them)
            })
            .await?;
        if state != FollowState::Pending {
            return Ok(state);
        }
        self.publish(
            ActivityPayload::FollowRequested {
                follower: self.origin.clone(),
                following: following.to_string(),
            },
            vec![following.to_string()],
        )
        .await?;
        Ok(FollowState::Pending)
    }

    /// Operator approval of an inbound follow. Same path as the automatic
    /// accept, so it also works as a pre-approval for a follower whose
    /// request has not arrived yet.
    pub async fn approve_follower(&self, follower: &str) -> EngineResult<()> {
        self.accept_follower(follower).await
    }

    /// Operator rejection of an inbound follow.
    pub async fn reject_follower(&self, follower: &str) -> EngineResult<()> {
        let me = self.origin.clone();
        let current = self
            .with_db({
                let (f, me) = (follower.to_string(), me.clone());
                move |db| db.follow_state(&f, &me)
            })
            .await?
            .ok_or_else(|| {
                EngineError::UnknownReference(format!("follow edge {follower} -> {me}"))
            })?;
        if current != FollowState::Rejected {
            self.with_db({
                let (f, me) = (follower.to_string(), me.clone());
                move |db| db.transition_follow(&f, &me, current, FollowState::Rejected)
            })
            .await?;
        }
        self.publish(
            ActivityPayload::FollowRejected {
                follower: follower.to_string(),
                following: me,
            },
            vec![follower.to_string()],
        )
        .await?;
        Ok(())
    }

    /// Stop following `following`. The edge is retired, never deleted.
    pub async fn unfollow(&self, following: &str) -> EngineResult<()> {
        let current = self
            .with_db({
                let (me, them) = (self.origin.clone(), following.to_string());
                move |db| db.follow_state(&me, &them)
            })
            .await?
            .ok_or_else(|| {
                EngineError::UnknownReference(format!("follow edge {} -> {following}", self.origin))
            })?;
        if current != FollowState::Rejected {
            self.with_db({
                let (me, them) = (self.origin.clone(), following.to_string());
                move |db| db.transition_follow(&me, &them, current, FollowState::Rejected)
            })
            .await?;
        }
        self.publish(
            ActivityPayload::FollowRejected {
                follower: self.origin.clone(),
                following: following.to_string(),
            },
            vec![following.to_string()],
        )
        .await?;
        Ok(())
    }

    // ---- shared ---------------------------------------------------------

    /// Commit a locally originated activity and enqueue it for `targets`.
    async fn publish(&self, payload: ActivityPayload, targets: Vec<String>) -> EngineResult<String> {
        let activity = Activity {
            id: new_activity_id(&self.origin),
            actor: self.origin.clone(),
            payload,
        };
        let body = serde_json::to_vec(&activity)
            .map_err(|e| EngineError::InvalidActivity(format!("encode activity: {e}")))?;
        self.with_db({
            let a = activity.clone();
            move |db| {
                db.append_activity(&a.id, &a.actor, a.payload.kind(), ActivityOrigin::Local, &body)
            }
        })
        .await?;
        self.queue
            .enqueue(&activity.id, targets)
            .await
            .map_err(io_err)?;
        Ok(activity.id)
    }

    async fn follower_targets(&self) -> EngineResult<Vec<String>> {
        let me = self.origin.clone();
        self.with_db(move |db| db.fanout_targets(&me)).await
    }

    async fn with_db<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FederationDb) -> EngineResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| EngineError::Internal(format!("worker join: {e}")))?
    }
}

fn io_err(e: anyhow::Error) -> EngineError {
    EngineError::Internal(format!("enqueue: {e:#}"))
}
