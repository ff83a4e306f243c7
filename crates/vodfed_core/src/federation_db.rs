/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable state of one instance: the append-only activity store with
//! per-target delivery status, the follow graph, materialized videos and
//! comments (local and cached remote), coalesced view counters, local user
//! accounts and the re-check queue for activities that arrived before the
//! entity they reference.
//!
//! All methods are blocking; async callers wrap them in
//! `tokio::task::spawn_blocking`. SQLite (WAL) serializes writers, which
//! gives the single-writer-per-key discipline the delivery status and follow
//! edge updates rely on.

use crate::errors::{EngineError, EngineResult};
use crate::follow::FollowState;
use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use vodfed_protocol::StatsSnapshot;

#[derive(Clone)]
pub struct FederationDb {
    path: PathBuf,
}

/// Origin of an activity relative to this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOrigin {
    Local,
    Remote,
}

impl ActivityOrigin {
    fn as_i64(self) -> i64 {
        match self {
            ActivityOrigin::Local => 0,
            ActivityOrigin::Remote => 1,
        }
    }
}

/// Result of appending to the activity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// First commit of this id.
    Inserted,
    /// Same id, byte-identical canonical payload: no-op success, supports
    /// at-least-once delivery.
    AlreadyKnown,
}

/// One pending delivery for a target, in per-target FIFO order.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub activity_id: String,
    pub attempt: u32,
    pub next_attempt_at_ms: i64,
    pub payload_json: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RecheckJob {
    pub activity_id: String,
    pub attempt: u32,
    pub payload_json: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepth {
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
    pub recheck_pending: u64,
}

// Delivery/recheck status values (same convention in both tables).
const STATUS_PENDING: i64 = 0;
const STATUS_DONE: i64 = 1;
const STATUS_FAILED: i64 = 2;

impl FederationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS activities (
              id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor TEXT NOT NULL,
              type TEXT NOT NULL,
              origin INTEGER NOT NULL,
              payload_sha256 TEXT NOT NULL,
              payload_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activities_created ON activities(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_activities_origin ON activities(origin, created_at_ms);

            CREATE TABLE IF NOT EXISTS activity_targets (
              activity_id TEXT NOT NULL,
              target TEXT NOT NULL,
              status INTEGER NOT NULL,
              attempt INTEGER NOT NULL,
              next_attempt_at_ms INTEGER NOT NULL,
              last_error TEXT NULL,
              PRIMARY KEY(activity_id, target)
            );
            CREATE INDEX IF NOT EXISTS idx_targets_due ON activity_targets(status, target, next_attempt_at_ms);

            CREATE TABLE IF NOT EXISTS follow_edges (
              follower TEXT NOT NULL,
              following TEXT NOT NULL,
              state INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(follower, following)
            );
            CREATE INDEX IF NOT EXISTS idx_follow_following ON follow_edges(following, state);
            CREATE INDEX IF NOT EXISTS idx_follow_follower ON follow_edges(follower, state);

            CREATE TABLE IF NOT EXISTS videos (
              uuid TEXT NOT NULL,
              origin TEXT NOT NULL,
              is_local INTEGER NOT NULL,
              name TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              views INTEGER NOT NULL DEFAULT 0,
              published_ms INTEGER NOT NULL,
              PRIMARY KEY(uuid, origin)
            );

            CREATE TABLE IF NOT EXISTS comments (
              uuid TEXT NOT NULL,
              origin TEXT NOT NULL,
              is_local INTEGER NOT NULL,
              video_uuid TEXT NOT NULL,
              video_origin TEXT NOT NULL,
              text TEXT NOT NULL,
              published_ms INTEGER NOT NULL,
              PRIMARY KEY(uuid, origin)
            );

            CREATE TABLE IF NOT EXISTS video_viewers (
              video_uuid TEXT NOT NULL,
              video_origin TEXT NOT NULL,
              viewer TEXT NOT NULL,
              last_view_ms INTEGER NOT NULL,
              PRIMARY KEY(video_uuid, video_origin, viewer)
            );

            CREATE TABLE IF NOT EXISTS users (
              username TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recheck_jobs (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              next_attempt_at_ms INTEGER NOT NULL,
              attempt INTEGER NOT NULL,
              status INTEGER NOT NULL,
              payload_json BLOB NOT NULL,
              last_error TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recheck_due ON recheck_jobs(status, next_attempt_at_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.path)?;
        // Writers on separate connections wait for the WAL lock instead of
        // failing with SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn health_check(&self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- activity store -------------------------------------------------

    /// Commit an activity. Payloads are immutable once committed: the same
    /// id with a conflicting payload is `DuplicateActivity`; identical
    /// payload is a no-op success.
    pub fn append_activity(
        &self,
        id: &str,
        actor: &str,
        kind: &str,
        origin: ActivityOrigin,
        payload_json: &[u8],
    ) -> EngineResult<AppendOutcome> {
        let hash = sha256_hex(payload_json);
        let conn = self.conn()?;
        // A single conditional INSERT decides the race: of two concurrent
        // commits of one id, exactly one inserts; the other re-reads the
        // committed hash and takes the no-op or conflict path.
        let inserted = conn.execute(
            "INSERT INTO activities (id, created_at_ms, actor, type, origin, payload_sha256, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![id, now_ms(), actor, kind, origin.as_i64(), hash, payload_json],
        )?;
        if inserted > 0 {
            return Ok(AppendOutcome::Inserted);
        }
        let prev: String = conn.query_row(
            "SELECT payload_sha256 FROM activities WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        if prev == hash {
            Ok(AppendOutcome::AlreadyKnown)
        } else {
            Err(EngineError::DuplicateActivity { id: id.to_string() })
        }
    }

    /// Fan an activity out to `targets`: one pending delivery row per target.
    /// Re-adding an existing `(activity, target)` pair is a no-op, so a
    /// re-follow does not duplicate backfill deliveries.
    pub fn add_delivery_targets(&self, activity_id: &str, targets: &[String]) -> EngineResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        let mut added = 0u64;
        for t in targets {
            let n = tx.execute(
                "INSERT OR IGNORE INTO activity_targets
                   (activity_id, target, status, attempt, next_attempt_at_ms, last_error)
                 VALUES (?1, ?2, 0, 0, ?3, NULL)",
                params![activity_id, t, now],
            )?;
            added += n as u64;
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn mark_delivered(&self, activity_id: &str, target: &str) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activity_targets SET status = ?3, last_error = NULL
             WHERE activity_id = ?1 AND target = ?2",
            params![activity_id, target, STATUS_DONE],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, activity_id: &str, target: &str, reason: &str) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activity_targets SET status = ?3, last_error = ?4
             WHERE activity_id = ?1 AND target = ?2",
            params![activity_id, target, STATUS_FAILED, reason],
        )?;
        Ok(())
    }

    pub fn reschedule_delivery(
        &self,
        activity_id: &str,
        target: &str,
        attempt: u32,
        next_attempt_at_ms: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activity_targets SET attempt = ?3, next_attempt_at_ms = ?4, last_error = ?5
             WHERE activity_id = ?1 AND target = ?2",
            params![activity_id, target, attempt, next_attempt_at_ms, reason],
        )?;
        Ok(())
    }

    /// Targets with at least one pending delivery, regardless of due time.
    /// The worker checks due-ness per job so a backed-off head blocks its
    /// tail (FIFO per target) without hiding the target from the scan.
    pub fn targets_with_pending(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT target FROM activity_targets WHERE status = 0")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Pending deliveries for one target in commit order (the `activities`
    /// rowid; wall-clock timestamps tie within a millisecond and activity
    /// ids are random, so neither can order causally related appends). The
    /// sequence is a pure DB scan: restartable after a crash, no in-memory
    /// state to trust.
    pub fn pending_for_target(&self, target: &str, limit: u32) -> EngineResult<Vec<DeliveryJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.activity_id, t.attempt, t.next_attempt_at_ms, a.payload_json
             FROM activity_targets t JOIN activities a ON a.id = t.activity_id
             WHERE t.target = ?1 AND t.status = 0
             ORDER BY a.rowid ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![target, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DeliveryJob {
                activity_id: row.get(0)?,
                attempt: row.get(1)?,
                next_attempt_at_ms: row.get(2)?,
                payload_json: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Locally originated content activities in commit order, used to
    /// backfill a newly accepted follower.
    pub fn local_content_activity_ids(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM activities
             WHERE origin = 0 AND type IN ('VideoCreated', 'CommentCreated')
             ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn queue_depth(&self) -> EngineResult<QueueDepth> {
        let conn = self.conn()?;
        let count = |status: i64| -> EngineResult<u64> {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM activity_targets WHERE status = ?1",
                params![status],
                |r| r.get(0),
            )?)
        };
        let recheck_pending: u64 = conn.query_row(
            "SELECT COUNT(*) FROM recheck_jobs WHERE status = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(QueueDepth {
            pending: count(STATUS_PENDING)?,
            delivered: count(STATUS_DONE)?,
            failed: count(STATUS_FAILED)?,
            recheck_pending,
        })
    }

    // ---- follow graph ---------------------------------------------------

    /// Create a pending edge, idempotently: an existing edge is returned
    /// as-is, never duplicated.
    pub fn request_follow(&self, follower: &str, following: &str) -> EngineResult<FollowState> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT state FROM follow_edges WHERE follower = ?1 AND following = ?2",
                params![follower, following],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(v) = existing {
            tx.commit()?;
            return FollowState::from_i64(v).ok_or_else(|| {
                EngineError::InvalidActivity(format!("corrupt follow state {v}"))
            });
        }
        let now = now_ms();
        tx.execute(
            "INSERT INTO follow_edges (follower, following, state, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![follower, following, FollowState::Pending.as_i64(), now],
        )?;
        tx.commit()?;
        Ok(FollowState::Pending)
    }

    pub fn follow_state(&self, follower: &str, following: &str) -> EngineResult<Option<FollowState>> {
        let conn = self.conn()?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT state FROM follow_edges WHERE follower = ?1 AND following = ?2",
                params![follower, following],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.and_then(FollowState::from_i64))
    }

    /// Transition an edge, enforcing the state machine atomically: the
    /// UPDATE is keyed on the expected current state, so a concurrent
    /// transition makes the second writer observe `InvalidStateTransition`.
    pub fn transition_follow(
        &self,
        follower: &str,
        following: &str,
        from: FollowState,
        to: FollowState,
    ) -> EngineResult<()> {
        from.check_transition(to)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE follow_edges SET state = ?4, updated_at_ms = ?5
             WHERE follower = ?1 AND following = ?2 AND state = ?3",
            params![follower, following, from.as_i64(), to.as_i64(), now_ms()],
        )?;
        if changed == 0 {
            let current = self
                .follow_state(follower, following)?
                .map(|s| s.as_str())
                .unwrap_or("missing");
            return Err(EngineError::InvalidStateTransition {
                from: current,
                to: to.as_str(),
            });
        }
        Ok(())
    }

    /// The authoritative delivery audience for activities originated by
    /// `instance`: followers with accepted edges.
    pub fn fanout_targets(&self, instance: &str) -> EngineResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT follower FROM follow_edges WHERE following = ?1 AND state = ?2",
        )?;
        let mut rows = stmt.query(params![instance, FollowState::Accepted.as_i64()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn follower_count(&self, instance: &str) -> EngineResult<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM follow_edges WHERE following = ?1 AND state = ?2",
            params![instance, FollowState::Accepted.as_i64()],
            |r| r.get(0),
        )?)
    }

    pub fn following_count(&self, instance: &str) -> EngineResult<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM follow_edges WHERE follower = ?1 AND state = ?2",
            params![instance, FollowState::Accepted.as_i64()],
            |r| r.get(0),
        )?)
    }

    // ---- materialized entities ------------------------------------------

    /// Insert a video unless `(uuid, origin)` already exists. Returns true
    /// when a row was inserted.
    pub fn insert_video(
        &self,
        uuid: &str,
        origin: &str,
        is_local: bool,
        name: &str,
        size_bytes: i64,
        published_ms: i64,
    ) -> EngineResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO videos (uuid, origin, is_local, name, size_bytes, views, published_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![uuid, origin, is_local as i64, name, size_bytes, published_ms],
        )?;
        Ok(n > 0)
    }

    pub fn video_exists(&self, uuid: &str, origin: &str) -> EngineResult<bool> {
        let conn = self.conn()?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM videos WHERE uuid = ?1 AND origin = ?2",
                params![uuid, origin],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.is_some())
    }

    pub fn insert_comment(
        &self,
        uuid: &str,
        origin: &str,
        is_local: bool,
        video_uuid: &str,
        video_origin: &str,
        text: &str,
        published_ms: i64,
    ) -> EngineResult<bool> {
        if !self.video_exists(video_uuid, video_origin)? {
            return Err(EngineError::UnknownReference(format!(
                "video {video_uuid}@{video_origin}"
            )));
        }
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO comments (uuid, origin, is_local, video_uuid, video_origin, text, published_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![uuid, origin, is_local as i64, video_uuid, video_origin, text, published_ms],
        )?;
        Ok(n > 0)
    }

    /// Record a view, coalescing repeats: the same `(video, viewer)` pair
    /// inside the debounce window counts once. Returns true when the view
    /// counter was incremented.
    pub fn record_view(
        &self,
        video_uuid: &str,
        video_origin: &str,
        viewer: &str,
        debounce_ms: i64,
    ) -> EngineResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM videos WHERE uuid = ?1 AND origin = ?2",
                params![video_uuid, video_origin],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(EngineError::UnknownReference(format!(
                "video {video_uuid}@{video_origin}"
            )));
        }
        let now = now_ms();
        let last: Option<i64> = tx
            .query_row(
                "SELECT last_view_ms FROM video_viewers
                 WHERE video_uuid = ?1 AND video_origin = ?2 AND viewer = ?3",
                params![video_uuid, video_origin, viewer],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(last) = last {
            if now.saturating_sub(last) < debounce_ms {
                tx.commit()?;
                return Ok(false);
            }
        }
        tx.execute(
            "INSERT INTO video_viewers (video_uuid, video_origin, viewer, last_view_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(video_uuid, video_origin, viewer) DO UPDATE SET last_view_ms = ?4",
            params![video_uuid, video_origin, viewer, now],
        )?;
        tx.execute(
            "UPDATE videos SET views = views + 1 WHERE uuid = ?1 AND origin = ?2",
            params![video_uuid, video_origin],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ---- users (external collaborator interface) ------------------------

    pub fn insert_user(&self, username: &str) -> EngineResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO users (username, created_at_ms) VALUES (?1, ?2)",
            params![username, now_ms()],
        )?;
        Ok(n > 0)
    }

    // ---- recheck queue --------------------------------------------------

    pub fn enqueue_recheck(
        &self,
        activity_id: &str,
        payload_json: &[u8],
        next_attempt_at_ms: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO recheck_jobs
               (activity_id, created_at_ms, next_attempt_at_ms, attempt, status, payload_json, last_error)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
            params![activity_id, now_ms(), next_attempt_at_ms, payload_json, reason],
        )?;
        Ok(())
    }

    pub fn due_recheck_jobs(&self, limit: u32) -> EngineResult<Vec<RecheckJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT activity_id, attempt, payload_json FROM recheck_jobs
             WHERE status = 0 AND next_attempt_at_ms <= ?1
             ORDER BY next_attempt_at_ms ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![now_ms(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(RecheckJob {
                activity_id: row.get(0)?,
                attempt: row.get(1)?,
                payload_json: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn mark_recheck_done(&self, activity_id: &str) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE recheck_jobs SET status = 1, last_error = NULL WHERE activity_id = ?1",
            params![activity_id],
        )?;
        Ok(())
    }

    pub fn mark_recheck_dead(&self, activity_id: &str, reason: &str) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE recheck_jobs SET status = 2, last_error = ?2 WHERE activity_id = ?1",
            params![activity_id, reason],
        )?;
        Ok(())
    }

    pub fn reschedule_recheck(
        &self,
        activity_id: &str,
        attempt: u32,
        next_attempt_at_ms: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE recheck_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4
             WHERE activity_id = ?1",
            params![activity_id, attempt, next_attempt_at_ms, reason],
        )?;
        Ok(())
    }

    // ---- stats ----------------------------------------------------------

    /// All counters from one read transaction, so concurrent mutations can
    /// never produce a torn snapshot.
    pub fn stats_snapshot(&self, own_origin: &str) -> EngineResult<StatsSnapshot> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let one = |sql: &str| -> EngineResult<u64> {
            Ok(tx.query_row(sql, [], |r| r.get::<_, i64>(0))? as u64)
        };
        let snap = StatsSnapshot {
            total_local_videos: one("SELECT COUNT(*) FROM videos WHERE is_local = 1")?,
            total_videos: one("SELECT COUNT(*) FROM videos")?,
            total_local_video_comments: one("SELECT COUNT(*) FROM comments WHERE is_local = 1")?,
            total_video_comments: one("SELECT COUNT(*) FROM comments")?,
            total_local_video_views: one(
                "SELECT COALESCE(SUM(views), 0) FROM videos WHERE is_local = 1",
            )?,
            total_local_video_files_size: one(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM videos WHERE is_local = 1",
            )?,
            total_users: one("SELECT COUNT(*) FROM users")?,
            total_instance_followers: tx.query_row(
                "SELECT COUNT(*) FROM follow_edges WHERE following = ?1 AND state = ?2",
                params![own_origin, FollowState::Accepted.as_i64()],
                |r| r.get::<_, i64>(0),
            )? as u64,
            total_instance_following: tx.query_row(
                "SELECT COUNT(*) FROM follow_edges WHERE follower = ?1 AND state = ?2",
                params![own_origin, FollowState::Accepted.as_i64()],
                |r| r.get::<_, i64>(0),
            )? as u64,
        };
        tx.commit()?;
        Ok(snap)
    }
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// New activity id under the originating instance, 16 random bytes as hex.
pub fn new_activity_id(origin: &str) -> String {
    format!("{}/activities/{}", origin.trim_end_matches('/'), random_hex())
}

pub fn random_hex() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    let mut h = sha2::Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, FederationDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = FederationDb::open(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn append_is_idempotent_for_identical_payloads() {
        let (_dir, db) = test_db();
        let outcome = db
            .append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{\"x\":1}")
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Inserted);
        let outcome = db
            .append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{\"x\":1}")
            .unwrap();
        assert_eq!(outcome, AppendOutcome::AlreadyKnown);
    }

    #[test]
    fn append_rejects_conflicting_payload_for_same_id() {
        let (_dir, db) = test_db();
        db.append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{\"x\":1}")
            .unwrap();
        let err = db
            .append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{\"x\":2}")
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateActivity { .. }));
    }

    #[test]
    fn pending_for_target_is_fifo_by_commit_order() {
        let (_dir, db) = test_db();
        for id in ["a1", "a2", "a3"] {
            db.append_activity(id, "http://a", "VideoCreated", ActivityOrigin::Local, b"{}")
                .unwrap();
            db.add_delivery_targets(id, &["http://b".to_string()]).unwrap();
        }
        db.mark_delivered("a2", "http://b").unwrap();
        let jobs = db.pending_for_target("http://b", 10).unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a3"]);
    }

    #[test]
    fn same_millisecond_appends_dispatch_in_commit_order() {
        let (_dir, db) = test_db();
        // Ids deliberately sort against commit order. Cause (the video) must
        // still be dispatched before effect (its comment) even when both
        // land in the same millisecond.
        let mut expected = Vec::new();
        for i in 0..40 {
            for id in [format!("zz-video-{i:02}"), format!("aa-comment-{i:02}")] {
                db.append_activity(&id, "http://a", "VideoCreated", ActivityOrigin::Local, b"{}")
                    .unwrap();
                db.add_delivery_targets(&id, &["http://b".to_string()]).unwrap();
                expected.push(id);
            }
        }
        let jobs = db.pending_for_target("http://b", 200).unwrap();
        let got: Vec<_> = jobs.into_iter().map(|j| j.activity_id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn concurrent_appends_of_one_id_agree_on_a_single_insert() {
        let (_dir, db) = test_db();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    db.append_activity(
                        "a1",
                        "http://a",
                        "VideoCreated",
                        ActivityOrigin::Remote,
                        b"{\"x\":1}",
                    )
                })
            })
            .collect();
        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        let inserted = outcomes
            .iter()
            .filter(|o| **o == AppendOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1, "exactly one writer commits the row");
        assert!(
            outcomes
                .iter()
                .filter(|o| **o != AppendOutcome::Inserted)
                .all(|o| *o == AppendOutcome::AlreadyKnown),
            "losers take the no-op path, never an error"
        );
    }

    #[test]
    fn delivery_status_is_per_target() {
        let (_dir, db) = test_db();
        db.append_activity("a1", "http://a", "VideoCreated", ActivityOrigin::Local, b"{}")
            .unwrap();
        db.add_delivery_targets("a1", &["http://b".to_string(), "http://c".to_string()])
            .unwrap();
        db.mark_delivered("a1", "http://b").unwrap();
        db.mark_failed("a1", "http://c", "410 gone").unwrap();
        let depth = db.queue_depth().unwrap();
        assert_eq!(depth.pending, 0);
        assert_eq!(depth.delivered, 1);
        assert_eq!(depth.failed, 1);
    }

    #[test]
    fn request_follow_is_idempotent() {
        let (_dir, db) = test_db();
        assert_eq!(db.request_follow("http://a", "http://b").unwrap(), FollowState::Pending);
        db.transition_follow("http://a", "http://b", FollowState::Pending, FollowState::Accepted)
            .unwrap();
        // A second request returns the existing state, no duplicate edge.
        assert_eq!(db.request_follow("http://a", "http://b").unwrap(), FollowState::Accepted);
        assert_eq!(db.follower_count("http://b").unwrap(), 1);
    }

    #[test]
    fn transition_enforces_state_machine() {
        let (_dir, db) = test_db();
        db.request_follow("http://a", "http://b").unwrap();
        db.transition_follow("http://a", "http://b", FollowState::Pending, FollowState::Rejected)
            .unwrap();
        let err = db
            .transition_follow("http://a", "http://b", FollowState::Pending, FollowState::Accepted)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn fanout_targets_counts_only_accepted_followers() {
        let (_dir, db) = test_db();
        db.request_follow("http://a", "http://me").unwrap();
        db.request_follow("http://b", "http://me").unwrap();
        db.transition_follow("http://a", "http://me", FollowState::Pending, FollowState::Accepted)
            .unwrap();
        assert_eq!(db.fanout_targets("http://me").unwrap(), vec!["http://a".to_string()]);
        assert_eq!(db.follower_count("http://me").unwrap(), 1);
    }

    #[test]
    fn comment_on_unknown_video_is_unknown_reference() {
        let (_dir, db) = test_db();
        let err = db
            .insert_comment("c1", "http://a", false, "v1", "http://a", "hi", 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownReference(_)));
    }

    #[test]
    fn views_coalesce_within_debounce_window() {
        let (_dir, db) = test_db();
        db.insert_video("v1", "http://a", true, "clip", 100, 0).unwrap();
        assert!(db.record_view("v1", "http://a", "1.2.3.4", 10_000).unwrap());
        assert!(!db.record_view("v1", "http://a", "1.2.3.4", 10_000).unwrap());
        // Different viewer counts separately.
        assert!(db.record_view("v1", "http://a", "5.6.7.8", 10_000).unwrap());
        let snap = db.stats_snapshot("http://a").unwrap();
        assert_eq!(snap.total_local_video_views, 2);
    }

    #[test]
    fn zero_debounce_counts_every_view() {
        let (_dir, db) = test_db();
        db.insert_video("v1", "http://a", true, "clip", 100, 0).unwrap();
        assert!(db.record_view("v1", "http://a", "x", 0).unwrap());
        assert!(db.record_view("v1", "http://a", "x", 0).unwrap());
    }

    #[test]
    fn stats_separate_local_from_total() {
        let (_dir, db) = test_db();
        db.insert_video("v1", "http://me", true, "mine", 218_910, 0).unwrap();
        db.insert_video("v2", "http://other", false, "theirs", 0, 0).unwrap();
        // Duplicate remote insert is deduplicated by (uuid, origin).
        db.insert_video("v2", "http://other", false, "theirs", 0, 0).unwrap();
        db.insert_comment("c1", "http://other", false, "v2", "http://other", "hi", 0)
            .unwrap();
        db.insert_user("root").unwrap();
        let snap = db.stats_snapshot("http://me").unwrap();
        assert_eq!(snap.total_local_videos, 1);
        assert_eq!(snap.total_videos, 2);
        assert_eq!(snap.total_local_video_comments, 0);
        assert_eq!(snap.total_video_comments, 1);
        assert_eq!(snap.total_local_video_files_size, 218_910);
        assert_eq!(snap.total_users, 1);
    }
}
