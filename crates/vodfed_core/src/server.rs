/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! HTTP surface of one instance: the federation inbox, the public stats
//! endpoint, the operator API for local publication and follow management,
//! and job introspection used by tooling that waits for the network to
//! settle.

use crate::errors::EngineError;
use crate::federation_db::FederationDb;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::ref_recheck::RecheckWorker;
use crate::stats::StatsAggregator;
use crate::trust::{bearer_token, InboxVerifier, RightsProvider};
use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use vodfed_protocol::UserRight;

#[derive(Clone)]
pub struct AppState {
    pub origin: String,
    pub db: FederationDb,
    pub ingestor: Ingestor,
    pub stats: StatsAggregator,
    pub recheck: RecheckWorker,
    pub verifier: Arc<dyn InboxVerifier>,
    pub rights: Arc<dyn RightsProvider>,
}

pub async fn handle_request(state: &AppState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => simple(StatusCode::OK, "ok"),
        ("GET", "/readyz") => readyz_get(state),
        ("POST", "/inbox") => inbox_post(state, req).await,
        ("GET", "/inbox") => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        ("GET", "/stats") => stats_get(state).await,
        ("GET", "/jobs/stats") => jobs_stats_get(state).await,
        ("GET", "/jobs/wait") => jobs_wait_get(state, req).await,
        ("POST", "/api/users") => users_post(state, req).await,
        ("POST", "/api/videos") => videos_post(state, req).await,
        ("POST", p) if p.starts_with("/api/videos/") && p.ends_with("/views") => {
            video_views_post(state, req, &path).await
        }
        ("POST", "/api/comments") => comments_post(state, req).await,
        ("POST", "/api/views") => views_post(state, req).await,
        ("POST", "/api/follows") => follows_post(state, req).await,
        ("POST", "/api/follows/accept") => follows_accept_post(state, req).await,
        ("POST", "/api/follows/reject") => follows_reject_post(state, req).await,
        ("DELETE", "/api/follows") => follows_delete(state, req).await,
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

fn readyz_get(state: &AppState) -> Response<Body> {
    if state.db.health_check().is_ok() {
        simple(StatusCode::OK, "ready")
    } else {
        simple(StatusCode::SERVICE_UNAVAILABLE, "db not ready")
    }
}

async fn inbox_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, 2 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    if let Err(e) = state.verifier.verify(&parts.headers, &body_bytes) {
        return simple(StatusCode::UNAUTHORIZED, &format!("rejected: {e}"));
    }

    match state.ingestor.ingest_remote(&body_bytes).await {
        Ok(IngestOutcome::Applied) | Ok(IngestOutcome::AlreadyKnown) => {
            simple(StatusCode::ACCEPTED, "accepted")
        }
        Ok(IngestOutcome::Deferred) => {
            // Parked for re-check, but accepted from the sender's view.
            state.recheck.notify();
            simple(StatusCode::ACCEPTED, "accepted")
        }
        Err(e) => engine_error_response(&e),
    }
}

async fn stats_get(state: &AppState) -> Response<Body> {
    match state.stats.snapshot().await {
        Ok(snap) => json(StatusCode::OK, &snap),
        Err(e) => {
            warn!("stats snapshot failed: {e}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "stats unavailable")
        }
    }
}

async fn jobs_stats_get(state: &AppState) -> Response<Body> {
    let db = state.db.clone();
    match tokio::task::spawn_blocking(move || db.queue_depth()).await {
        Ok(Ok(depth)) => json(
            StatusCode::OK,
            &serde_json::json!({
                "pending": depth.pending,
                "delivered": depth.delivered,
                "failed": depth.failed,
                "recheckPending": depth.recheck_pending,
            }),
        ),
        _ => simple(StatusCode::INTERNAL_SERVER_ERROR, "queue stats unavailable"),
    }
}

/// Block until delivery and re-check queues are drained (`?timeout_ms=`,
/// default 30s). The drain signal for operators and test harnesses.
async fn jobs_wait_get(state: &AppState, req: Request<Body>) -> Response<Body> {
    let timeout_ms = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .find_map(|p| p.strip_prefix("timeout_ms="))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30_000)
        .clamp(100, 120_000);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);

    loop {
        let db = state.db.clone();
        let depth = match tokio::task::spawn_blocking(move || db.queue_depth()).await {
            Ok(Ok(d)) => d,
            _ => return simple(StatusCode::INTERNAL_SERVER_ERROR, "queue stats unavailable"),
        };
        if depth.pending == 0 && depth.recheck_pending == 0 {
            // One idle read can race a follow-up enqueue; confirm it holds.
            tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            let db = state.db.clone();
            if let Ok(Ok(d)) = tokio::task::spawn_blocking(move || db.queue_depth()).await {
                if d.pending == 0 && d.recheck_pending == 0 {
                    return simple(StatusCode::OK, "settled");
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return simple(StatusCode::GATEWAY_TIMEOUT, "queues still busy");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[derive(Deserialize)]
struct UserReq {
    username: String,
}

async fn users_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::ManageUsers) {
        return resp;
    }
    let Some(input) = parse_json::<UserReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    if input.username.trim().is_empty() {
        return simple(StatusCode::BAD_REQUEST, "username must be non-empty");
    }
    match state.ingestor.create_user(input.username.trim()).await {
        Ok(created) => json(
            StatusCode::CREATED,
            &serde_json::json!({ "username": input.username.trim(), "created": created }),
        ),
        Err(e) => engine_error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoReq {
    name: String,
    size_bytes: i64,
}

async fn videos_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::UpdateAnyVideo) {
        return resp;
    }
    let Some(input) = parse_json::<VideoReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    if input.name.trim().is_empty() || input.size_bytes < 0 {
        return simple(StatusCode::BAD_REQUEST, "name and non-negative size required");
    }
    match state
        .ingestor
        .publish_video(input.name.trim(), input.size_bytes)
        .await
    {
        Ok(video) => json(StatusCode::CREATED, &video),
        Err(e) => engine_error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentReq {
    video_uuid: String,
    video_origin: String,
    text: String,
}

async fn comments_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::UpdateAnyVideo) {
        return resp;
    }
    let Some(input) = parse_json::<CommentReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    match state
        .ingestor
        .publish_comment(&input.video_uuid, &input.video_origin, &input.text)
        .await
    {
        Ok(comment) => json(StatusCode::CREATED, &comment),
        Err(e) => engine_error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewReq {
    video_uuid: String,
    video_origin: String,
    #[serde(default)]
    viewer: Option<String>,
}

async fn views_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let Some(input) = parse_json::<ViewReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    let viewer = input
        .viewer
        .or_else(|| client_ip_from_headers(&parts.headers))
        .unwrap_or_else(|| "anonymous".to_string());
    match state
        .ingestor
        .record_local_view(&input.video_uuid, &input.video_origin, &viewer)
        .await
    {
        Ok(counted) => json(StatusCode::OK, &serde_json::json!({ "counted": counted })),
        Err(e) => engine_error_response(&e),
    }
}

/// Path form of the view endpoint for a local video: the viewer key is
/// taken from the body, the forwarding headers or falls back to anonymous.
async fn video_views_post(state: &AppState, req: Request<Body>, path: &str) -> Response<Body> {
    let uuid = path
        .trim_start_matches("/api/videos/")
        .trim_end_matches("/views")
        .trim_matches('/')
        .to_string();
    if uuid.is_empty() || uuid.contains('/') {
        return simple(StatusCode::BAD_REQUEST, "invalid video path");
    }
    let (parts, body) = req.into_parts();
    #[derive(Deserialize, Default)]
    struct PathViewReq {
        #[serde(default)]
        viewer: Option<String>,
    }
    // Empty body allowed.
    let input: PathViewReq = match axum::body::to_bytes(body, 64 * 1024).await {
        Ok(b) if b.is_empty() => PathViewReq::default(),
        Ok(b) => match serde_json::from_slice(&b) {
            Ok(v) => v,
            Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
        },
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    let viewer = input
        .viewer
        .or_else(|| client_ip_from_headers(&parts.headers))
        .unwrap_or_else(|| "anonymous".to_string());
    let origin = state.origin.clone();
    match state.ingestor.record_local_view(&uuid, &origin, &viewer).await {
        Ok(counted) => json(StatusCode::OK, &serde_json::json!({ "counted": counted })),
        Err(e) => engine_error_response(&e),
    }
}

#[derive(Deserialize)]
struct FollowReq {
    target: String,
}

async fn follows_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::ManageServerFollow) {
        return resp;
    }
    let Some(input) = parse_json::<FollowReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    let target = input.target.trim_end_matches('/').to_string();
    if target.is_empty() || target == state.origin {
        return simple(StatusCode::BAD_REQUEST, "invalid follow target");
    }
    match state.ingestor.request_remote_follow(&target).await {
        Ok(s) => json(
            StatusCode::ACCEPTED,
            &serde_json::json!({ "target": target, "state": s.as_str() }),
        ),
        Err(e) => engine_error_response(&e),
    }
}

#[derive(Deserialize)]
struct FollowerReq {
    follower: String,
}

async fn follows_accept_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::ManageServerFollow) {
        return resp;
    }
    let Some(input) = parse_json::<FollowerReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    let follower = input.follower.trim_end_matches('/').to_string();
    if follower.is_empty() {
        return simple(StatusCode::BAD_REQUEST, "invalid follower");
    }
    match state.ingestor.approve_follower(&follower).await {
        Ok(()) => json(StatusCode::OK, &serde_json::json!({ "follower": follower, "state": "accepted" })),
        Err(e) => engine_error_response(&e),
    }
}

async fn follows_reject_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::ManageServerFollow) {
        return resp;
    }
    let Some(input) = parse_json::<FollowerReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    let follower = input.follower.trim_end_matches('/').to_string();
    match state.ingestor.reject_follower(&follower).await {
        Ok(()) => json(StatusCode::OK, &serde_json::json!({ "follower": follower, "state": "rejected" })),
        Err(e) => engine_error_response(&e),
    }
}

async fn follows_delete(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if let Err(resp) = require_right(state, &parts.headers, UserRight::ManageServerFollow) {
        return resp;
    }
    let Some(input) = parse_json::<FollowReq>(body).await else {
        return simple(StatusCode::BAD_REQUEST, "invalid body");
    };
    let target = input.target.trim_end_matches('/').to_string();
    match state.ingestor.unfollow(&target).await {
        Ok(()) => json(StatusCode::OK, &serde_json::json!({ "target": target, "state": "rejected" })),
        Err(e) => engine_error_response(&e),
    }
}

fn require_right(
    state: &AppState,
    headers: &HeaderMap,
    right: UserRight,
) -> Result<(), Response<Body>> {
    if state.rights.has_right(bearer_token(headers), right) {
        Ok(())
    } else {
        Err(simple(StatusCode::FORBIDDEN, "missing right"))
    }
}

fn engine_error_response(e: &EngineError) -> Response<Body> {
    match e {
        EngineError::InvalidActivity(msg) => simple(StatusCode::BAD_REQUEST, msg),
        EngineError::DuplicateActivity { .. } => simple(StatusCode::CONFLICT, &e.to_string()),
        EngineError::InvalidStateTransition { .. } => simple(StatusCode::CONFLICT, &e.to_string()),
        EngineError::UnknownReference(_) => simple(StatusCode::NOT_FOUND, &e.to_string()),
        EngineError::Db(inner) => {
            warn!("request failed on storage: {inner}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
        }
        EngineError::Internal(msg) => {
            warn!("request failed: {msg}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(body: Body) -> Option<T> {
    let bytes = axum::body::to_bytes(body, 256 * 1024).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        "Content-Type",
        "application/json; charset=utf-8".parse().expect("static header"),
    );
    resp
}
