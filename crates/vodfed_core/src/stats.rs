/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Instance counters. All nine values come from one read transaction so a
//! snapshot taken during fan-out is internally consistent.

use crate::errors::EngineResult;
use crate::federation_db::FederationDb;
use vodfed_protocol::StatsSnapshot;

#[derive(Clone)]
pub struct StatsAggregator {
    db: FederationDb,
    origin: String,
}

impl StatsAggregator {
    pub fn new(db: FederationDb, origin: String) -> Self {
        Self { db, origin }
    }

    pub async fn snapshot(&self) -> EngineResult<StatsSnapshot> {
        let db = self.db.clone();
        let origin = self.origin.clone();
        tokio::task::spawn_blocking(move || db.stats_snapshot(&origin))
            .await
            .map_err(|e| crate::errors::EngineError::Internal(format!("worker join: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = FederationDb::open(dir.path().join("s.db")).unwrap();
        db.insert_user("root").unwrap();
        db.insert_video("v1", "http://me", true, "mine", 100, 0).unwrap();
        let stats = StatsAggregator::new(db, "http://me".into());
        let snap = stats.snapshot().await.unwrap();
        assert_eq!(snap.total_users, 1);
        assert_eq!(snap.total_local_videos, 1);
        assert_eq!(snap.total_local_video_files_size, 100);
    }
}
