/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Instance lifecycle: configuration, startup wiring of store, workers and
//! HTTP server, graceful shutdown and the settle signal used by operators
//! and tests to wait until every queue has drained.

use crate::delivery::DeliverySender;
use crate::delivery_queue::{DeliveryQueue, QueueSettings};
use crate::federation_db::FederationDb;
use crate::ingest::{IngestSettings, Ingestor};
use crate::ref_recheck::{RecheckSettings, RecheckWorker};
use crate::server::{handle_request, AppState};
use crate::stats::StatsAggregator;
use crate::trust::{AllowAllVerifier, InboxVerifier, RightsProvider, TokenRights};
use anyhow::{Context, Result};
use axum::{routing::any, Router};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Listen address. Port 0 picks a free port; the chosen one is reported
    /// on the handle.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Origin URL other instances reach us at. Derived from the bound
    /// address when empty, which only works on a shared network.
    #[serde(default)]
    pub public_origin: Option<String>,
    /// Directory holding the instance database.
    pub data_dir: PathBuf,
    /// Operator account created at first startup.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Bearer token required for operator API calls. Unset means open.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub delivery_max_attempts: Option<u32>,
    #[serde(default)]
    pub delivery_base_backoff_secs: Option<u64>,
    #[serde(default)]
    pub delivery_max_backoff_secs: Option<u64>,
    /// Outbound HTTP timeout (seconds).
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// Window in which repeat views of a video by one viewer count once
    /// (milliseconds).
    #[serde(default)]
    pub view_debounce_ms: Option<i64>,
    #[serde(default)]
    pub recheck_max_attempts: Option<u32>,
    #[serde(default)]
    pub recheck_base_backoff_secs: Option<u64>,
    #[serde(default)]
    pub recheck_max_backoff_secs: Option<u64>,
    /// Re-check worker poll interval while its queue is empty (milliseconds).
    #[serde(default)]
    pub recheck_tick_ms: Option<u64>,
}

fn default_bind() -> String {
    "127.0.0.1:0".to_string()
}

fn default_admin_username() -> String {
    "root".to_string()
}

impl InstanceConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: default_bind(),
            public_origin: None,
            data_dir: data_dir.into(),
            admin_username: default_admin_username(),
            admin_token: None,
            delivery_max_attempts: None,
            delivery_base_backoff_secs: None,
            delivery_max_backoff_secs: None,
            http_timeout_secs: None,
            view_debounce_ms: None,
            recheck_max_attempts: None,
            recheck_base_backoff_secs: None,
            recheck_max_backoff_secs: None,
            recheck_tick_ms: None,
        }
    }
}

pub struct InstanceHandle {
    origin: String,
    local_addr: SocketAddr,
    db: FederationDb,
    shutdown_tx: watch::Sender<bool>,
    server: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl InstanceHandle {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn db(&self) -> &FederationDb {
        &self.db
    }

    /// True when no delivery or re-check work remains.
    pub async fn is_idle(&self) -> Result<bool> {
        let db = self.db.clone();
        let depth = tokio::task::spawn_blocking(move || db.queue_depth()).await??;
        Ok(depth.pending == 0 && depth.recheck_pending == 0)
    }

    /// Wait until this instance has drained its queues, with a stability
    /// double-check: an idle read, a short pause, then idle again. One idle
    /// sample can race an enqueue that follows a just-finished delivery.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_idle().await? {
                tokio::time::sleep(Duration::from_millis(120)).await;
                if self.is_idle().await? {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("queues did not drain within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.server.await?.context("server task")?;
        Ok(())
    }
}

/// Start one instance: open the store, seed the operator account, start the
/// delivery and re-check workers and serve the HTTP surface.
pub async fn start_instance(cfg: InstanceConfig) -> Result<InstanceHandle> {
    start_instance_with_trust(
        cfg,
        Arc::new(AllowAllVerifier),
        None,
    )
    .await
}

pub async fn start_instance_with_trust(
    cfg: InstanceConfig,
    verifier: Arc<dyn InboxVerifier>,
    rights: Option<Arc<dyn RightsProvider>>,
) -> Result<InstanceHandle> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir: {}", cfg.data_dir.display()))?;
    let db = FederationDb::open(cfg.data_dir.join("federation.db"))?;

    // Bind before deriving the origin so port 0 resolves first. Reuseaddr
    // lets a restarted instance take its previous port back immediately.
    let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .context("socket")?;
    socket.set_reuseaddr(true).context("reuseaddr")?;
    socket.bind(addr).context("bind")?;
    let listener = socket.listen(1024).context("listen")?;
    let local_addr = listener.local_addr().context("local addr")?;
    let origin = cfg
        .public_origin
        .clone()
        .filter(|o| !o.trim().is_empty())
        .map(|o| o.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{local_addr}"));

    {
        let db = db.clone();
        let admin = cfg.admin_username.clone();
        tokio::task::spawn_blocking(move || db.insert_user(&admin)).await??;
    }

    let mut queue_settings = QueueSettings::default();
    if let Some(v) = cfg.delivery_max_attempts {
        queue_settings.max_attempts = v.clamp(1, 100);
    }
    if let Some(v) = cfg.delivery_base_backoff_secs {
        queue_settings.base_backoff_secs = v;
    }
    if let Some(v) = cfg.delivery_max_backoff_secs {
        queue_settings.max_backoff_secs = v.max(queue_settings.base_backoff_secs);
    }
    let mut ingest_settings = IngestSettings::default();
    if let Some(v) = cfg.view_debounce_ms {
        ingest_settings.view_debounce_ms = v.max(0);
    }

    let mut recheck_settings = RecheckSettings::default();
    if let Some(v) = cfg.recheck_max_attempts {
        recheck_settings.max_attempts = v.max(1);
    }
    if let Some(v) = cfg.recheck_base_backoff_secs {
        recheck_settings.base_backoff_secs = v;
    }
    if let Some(v) = cfg.recheck_max_backoff_secs {
        recheck_settings.max_backoff_secs = v.max(recheck_settings.base_backoff_secs);
    }
    if let Some(v) = cfg.recheck_tick_ms {
        recheck_settings.tick_ms = v.clamp(10, 60_000);
    }

    let queue = DeliveryQueue::new(db.clone());
    let ingestor = Ingestor::new(db.clone(), queue.clone(), origin.clone(), ingest_settings);
    let recheck = RecheckWorker::new(recheck_settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sender = DeliverySender::new(Duration::from_secs(
        cfg.http_timeout_secs.unwrap_or(10).clamp(1, 300),
    ));
    queue.start_worker(shutdown_rx.clone(), sender, queue_settings);
    recheck.start(shutdown_rx.clone(), db.clone(), ingestor.clone());

    let state = AppState {
        origin: origin.clone(),
        db: db.clone(),
        ingestor,
        stats: StatsAggregator::new(db.clone(), origin.clone()),
        recheck,
        verifier,
        rights: rights.unwrap_or_else(|| Arc::new(TokenRights::new(cfg.admin_token.clone()))),
    };
    let router = Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    info!("instance {origin} listening on http://{local_addr}");
    let mut server_shutdown_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown_rx.changed().await;
        };
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
    });

    Ok(InstanceHandle {
        origin,
        local_addr,
        db,
        shutdown_tx,
        server,
    })
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();
}
