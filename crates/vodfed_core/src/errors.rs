/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Contract errors surfaced synchronously to callers. Delivery failures are
/// handled inside the queue (retry or mark failed) and never propagate here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Same activity id committed with a different payload. Integrity error:
    /// rejected, never retried.
    #[error("duplicate activity {id}: payload conflicts with committed record")]
    DuplicateActivity { id: String },

    /// Follow edge state machine misuse (e.g. accepting a rejected edge).
    #[error("invalid follow transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Malformed or semantically unusable inbound payload. Dropped, logged,
    /// never retried: the sender will not resend a different payload for the
    /// same id.
    #[error("invalid activity: {0}")]
    InvalidActivity(String),

    /// Referenced entity is not (yet) known locally. Eligible for a bounded
    /// re-check before being dropped.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Engine-internal failure (worker join, enqueue). Not a caller error.
    #[error("internal: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of one outbound delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryFailure {
    /// Network error or 5xx/429: retried with backoff up to a ceiling.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 4xx-class rejection: the target considers the activity permanently
    /// invalid. Marked failed for that target, no retry.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}
