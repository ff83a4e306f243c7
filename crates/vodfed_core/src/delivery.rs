/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound HTTP transport: one POST to a target instance's inbox per
//! delivery attempt. Retry policy lives in the queue, not here; this module
//! only classifies the outcome of a single attempt.

use crate::errors::DeliveryFailure;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

#[derive(Clone)]
pub struct DeliverySender {
    client: reqwest::Client,
}

impl DeliverySender {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// POST the activity to `target`'s inbox. `target` is an instance origin
    /// URL; the inbox path is fixed by the wire contract.
    pub async fn deliver(&self, target: &str, body: &[u8]) -> Result<(), DeliveryFailure> {
        let url = inbox_url(target);
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| DeliveryFailure::Transient(format!("send to {url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let reason = format!("{url}: {status} {text}");
        // 429 is throttling, worth retrying; any other 4xx means the target
        // rejected the activity itself and a retry would resend the same
        // bytes to the same verdict.
        if status.is_client_error() && status.as_u16() != 429 {
            Err(DeliveryFailure::Permanent(reason))
        } else {
            Err(DeliveryFailure::Transient(reason))
        }
    }
}

pub fn inbox_url(target: &str) -> String {
    format!("{}/inbox", target.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_url_normalizes_trailing_slash() {
        assert_eq!(inbox_url("http://a.example/"), "http://a.example/inbox");
        assert_eq!(inbox_url("http://a.example"), "http://a.example/inbox");
    }
}
