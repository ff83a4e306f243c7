/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use tracing::info;
use vodfed_core::runtime::{init_tracing, start_instance, InstanceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = load_config()?;
    let handle = start_instance(cfg).await?;
    info!("instance ready at {}", handle.origin());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}

fn load_config() -> Result<InstanceConfig> {
    // `--config <file>` or VODFED_CONFIG, else a local default.
    let mut args = std::env::args().skip(1);
    let mut path = std::env::var("VODFED_CONFIG").ok();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            path = args.next();
        }
    }
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(&p).with_context(|| format!("read config: {p}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parse config: {p}"))
        }
        None => Ok(InstanceConfig::new("./vodfed-data")),
    }
}
