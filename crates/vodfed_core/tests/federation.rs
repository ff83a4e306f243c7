/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! End-to-end federation over real HTTP: several instances on loopback
//! ports exchanging follows, videos, comments and views, then checked for
//! convergence once every queue has drained.

use std::time::Duration;
use vodfed_core::runtime::{start_instance, InstanceConfig, InstanceHandle};
use vodfed_protocol::StatsSnapshot;

struct TestInstance {
    handle: InstanceHandle,
    _dir: tempfile::TempDir,
}

async fn spawn() -> TestInstance {
    spawn_with(|_| {}).await
}

async fn spawn_with(tweak: impl FnOnce(&mut InstanceConfig)) -> TestInstance {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = InstanceConfig::new(dir.path());
    // Aggressive retry timing so failure paths settle within the test.
    cfg.delivery_base_backoff_secs = Some(0);
    cfg.delivery_max_attempts = Some(50);
    cfg.recheck_base_backoff_secs = Some(0);
    cfg.view_debounce_ms = Some(300);
    tweak(&mut cfg);
    let handle = start_instance(cfg).await.unwrap();
    TestInstance { handle, _dir: dir }
}

async fn wait_all_idle(instances: &[&TestInstance]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let mut all_idle = true;
        for i in instances {
            if !i.handle.is_idle().await.unwrap() {
                all_idle = false;
                break;
            }
        }
        if all_idle {
            // An in-flight delivery can enqueue follow-up work on the
            // receiver right after a pass; require two quiet reads.
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut still = true;
            for i in instances {
                if !i.handle.is_idle().await.unwrap() {
                    still = false;
                    break;
                }
            }
            if still {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "network did not settle"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn post_json(url: &str, body: serde_json::Value) -> reqwest::Response {
    client().post(url).json(&body).send().await.unwrap()
}

async fn follow(from: &TestInstance, to: &TestInstance) {
    let resp = post_json(
        &format!("{}/api/follows", from.handle.origin()),
        serde_json::json!({ "target": to.handle.origin() }),
    )
    .await;
    assert_eq!(resp.status(), 202);
}

async fn stats(i: &TestInstance) -> StatsSnapshot {
    client()
        .get(format!("{}/stats", i.handle.origin()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn stats_converge_across_three_instances() {
    let s0 = spawn().await;
    let s1 = spawn().await;
    let s2 = spawn().await;
    let all = [&s0, &s1, &s2];

    // Mutual follow between the first two.
    follow(&s0, &s1).await;
    follow(&s1, &s0).await;
    wait_all_idle(&all).await;

    // A second local account on the first instance.
    let resp = post_json(
        &format!("{}/api/users", s0.handle.origin()),
        serde_json::json!({ "username": "user_1" }),
    )
    .await;
    assert_eq!(resp.status(), 201);

    // One video, one comment, one counted view, all on the first instance.
    let video: serde_json::Value = post_json(
        &format!("{}/api/videos", s0.handle.origin()),
        serde_json::json!({ "name": "my super video", "sizeBytes": 218910 }),
    )
    .await
    .json()
    .await
    .unwrap();
    let uuid = video["uuid"].as_str().unwrap().to_string();

    let resp = post_json(
        &format!("{}/api/comments", s0.handle.origin()),
        serde_json::json!({
            "videoUuid": uuid,
            "videoOrigin": s0.handle.origin(),
            "text": "my super comment",
        }),
    )
    .await;
    assert_eq!(resp.status(), 201);

    let view: serde_json::Value = post_json(
        &format!("{}/api/views", s0.handle.origin()),
        serde_json::json!({
            "videoUuid": uuid,
            "videoOrigin": s0.handle.origin(),
            "viewer": "203.0.113.9",
        }),
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(view["counted"], true);
    wait_all_idle(&all).await;

    // The third instance follows late and must be backfilled.
    follow(&s2, &s0).await;
    wait_all_idle(&all).await;

    // The drain endpoint agrees that nothing is outstanding.
    let resp = client()
        .get(format!("{}/jobs/wait?timeout_ms=5000", s0.handle.origin()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let snap0 = stats(&s0).await;
    assert_eq!(snap0.total_local_videos, 1);
    assert_eq!(snap0.total_videos, 1);
    assert_eq!(snap0.total_local_video_comments, 1);
    assert_eq!(snap0.total_video_comments, 1);
    assert_eq!(snap0.total_local_video_views, 1);
    assert_eq!(snap0.total_local_video_files_size, 218910);
    assert_eq!(snap0.total_users, 2);
    assert_eq!(snap0.total_instance_followers, 2);
    assert_eq!(snap0.total_instance_following, 1);

    let snap1 = stats(&s1).await;
    assert_eq!(snap1.total_local_videos, 0);
    assert_eq!(snap1.total_videos, 1);
    assert_eq!(snap1.total_local_video_comments, 0);
    assert_eq!(snap1.total_video_comments, 1);
    assert_eq!(snap1.total_local_video_views, 0);
    assert_eq!(snap1.total_local_video_files_size, 0);
    assert_eq!(snap1.total_users, 1);
    assert_eq!(snap1.total_instance_followers, 1);
    assert_eq!(snap1.total_instance_following, 1);

    let snap2 = stats(&s2).await;
    assert_eq!(snap2.total_videos, 1, "late follower missed backfill");
    assert_eq!(snap2.total_video_comments, 1, "late follower missed backfill");
    assert_eq!(snap2.total_local_videos, 0);
    assert_eq!(snap2.total_local_video_views, 0);
    assert_eq!(snap2.total_users, 1);
    assert_eq!(snap2.total_instance_followers, 0);
    assert_eq!(snap2.total_instance_following, 1);

    for i in [s0, s1, s2] {
        i.handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn redelivered_inbox_activity_counts_once() {
    let s0 = spawn().await;
    let body = serde_json::json!({
        "id": "http://elsewhere.example/activities/abc",
        "actor": "http://elsewhere.example",
        "type": "VideoCreated",
        "video": {
            "uuid": "v-1",
            "origin": "http://elsewhere.example",
            "name": "clip",
            "size_bytes": 9,
            "published_ms": 1,
        },
    });
    let url = format!("{}/inbox", s0.handle.origin());
    assert_eq!(post_json(&url, body.clone()).await.status(), 202);
    assert_eq!(post_json(&url, body).await.status(), 202);

    let snap = stats(&s0).await;
    assert_eq!(snap.total_videos, 1);
    s0.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn conflicting_payload_for_known_id_is_a_conflict() {
    let s0 = spawn().await;
    let url = format!("{}/inbox", s0.handle.origin());
    let mk = |name: &str| {
        serde_json::json!({
            "id": "http://elsewhere.example/activities/same",
            "actor": "http://elsewhere.example",
            "type": "VideoCreated",
            "video": {
                "uuid": "v-1",
                "origin": "http://elsewhere.example",
                "name": name,
                "size_bytes": 9,
                "published_ms": 1,
            },
        })
    };
    assert_eq!(post_json(&url, mk("first")).await.status(), 202);
    assert_eq!(post_json(&url, mk("second")).await.status(), 409);
    s0.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn delivery_survives_target_downtime() {
    let s0 = spawn().await;
    let s1 = spawn().await;
    follow(&s1, &s0).await;
    wait_all_idle(&[&s0, &s1]).await;

    // Take the follower down, publish while it is unreachable, bring it
    // back on the same port and data dir.
    let addr = s1.handle.local_addr();
    let origin = s1.handle.origin().to_string();
    let dir = s1._dir;
    s1.handle.shutdown().await.unwrap();

    let resp = post_json(
        &format!("{}/api/videos", s0.handle.origin()),
        serde_json::json!({ "name": "while you were away", "sizeBytes": 5 }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut cfg = InstanceConfig::new(dir.path());
    cfg.bind = addr.to_string();
    cfg.delivery_base_backoff_secs = Some(0);
    cfg.recheck_base_backoff_secs = Some(0);
    let revived = start_instance(cfg).await.unwrap();
    assert_eq!(revived.origin(), origin);
    let s1 = TestInstance {
        handle: revived,
        _dir: dir,
    };
    wait_all_idle(&[&s0, &s1]).await;

    let snap = stats(&s1).await;
    assert_eq!(snap.total_videos, 1);
    s0.handle.shutdown().await.unwrap();
    s1.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unfollow_stops_future_fanout_but_keeps_history() {
    let s0 = spawn().await;
    let s1 = spawn().await;
    follow(&s1, &s0).await;
    wait_all_idle(&[&s0, &s1]).await;

    let resp = post_json(
        &format!("{}/api/videos", s0.handle.origin()),
        serde_json::json!({ "name": "before", "sizeBytes": 1 }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    wait_all_idle(&[&s0, &s1]).await;
    assert_eq!(stats(&s1).await.total_videos, 1);

    let resp = client()
        .delete(format!("{}/api/follows", s1.handle.origin()))
        .json(&serde_json::json!({ "target": s0.handle.origin() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    wait_all_idle(&[&s0, &s1]).await;
    assert_eq!(stats(&s0).await.total_instance_followers, 0);

    let resp = post_json(
        &format!("{}/api/videos", s0.handle.origin()),
        serde_json::json!({ "name": "after", "sizeBytes": 1 }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    wait_all_idle(&[&s0, &s1]).await;

    // The retired follower keeps what it already has and gets nothing new.
    assert_eq!(stats(&s1).await.total_videos, 1);
    assert_eq!(stats(&s1).await.total_instance_following, 0);
    s0.handle.shutdown().await.unwrap();
    s1.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn repeat_views_inside_the_window_count_once() {
    let s0 = spawn_with(|cfg| cfg.view_debounce_ms = Some(60_000)).await;
    let video: serde_json::Value = post_json(
        &format!("{}/api/videos", s0.handle.origin()),
        serde_json::json!({ "name": "clip", "sizeBytes": 2 }),
    )
    .await
    .json()
    .await
    .unwrap();
    let uuid = video["uuid"].as_str().unwrap();

    let url = format!("{}/api/views", s0.handle.origin());
    let body = serde_json::json!({
        "videoUuid": uuid,
        "videoOrigin": s0.handle.origin(),
        "viewer": "198.51.100.7",
    });
    let first: serde_json::Value = post_json(&url, body.clone()).await.json().await.unwrap();
    let second: serde_json::Value = post_json(&url, body).await.json().await.unwrap();
    assert_eq!(first["counted"], true);
    assert_eq!(second["counted"], false);
    assert_eq!(stats(&s0).await.total_local_video_views, 1);
    s0.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn operator_api_honors_the_admin_token() {
    let s0 = spawn_with(|cfg| cfg.admin_token = Some("topsecret".into())).await;
    let url = format!("{}/api/follows", s0.handle.origin());
    let body = serde_json::json!({ "target": "http://somewhere.example" });

    let resp = post_json(&url, body.clone()).await;
    assert_eq!(resp.status(), 403);

    let resp = client()
        .post(&url)
        .bearer_auth("topsecret")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // Comment creation mutates local content and is gated the same way.
    let video: serde_json::Value = client()
        .post(format!("{}/api/videos", s0.handle.origin()))
        .bearer_auth("topsecret")
        .json(&serde_json::json!({ "name": "clip", "sizeBytes": 3 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let comment_body = serde_json::json!({
        "videoUuid": video["uuid"],
        "videoOrigin": s0.handle.origin(),
        "text": "hi",
    });
    let comment_url = format!("{}/api/comments", s0.handle.origin());
    let resp = post_json(&comment_url, comment_body.clone()).await;
    assert_eq!(resp.status(), 403);
    let resp = client()
        .post(&comment_url)
        .bearer_auth("topsecret")
        .json(&comment_body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    s0.handle.shutdown().await.unwrap();
}
