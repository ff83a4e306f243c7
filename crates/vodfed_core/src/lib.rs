/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod delivery;
pub mod delivery_queue;
pub mod errors;
pub mod federation_db;
pub mod follow;
pub mod ingest;
pub mod ref_recheck;
pub mod runtime;
pub mod server;
pub mod stats;
pub mod trust;
