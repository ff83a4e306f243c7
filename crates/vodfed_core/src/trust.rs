/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Trust seams owned by external collaborators. Inbox authenticity
//! (signature schemes, allowlists) and operator authorization are plugged in
//! here; the engine itself only consumes the verdicts.

use axum::http::HeaderMap;
use vodfed_protocol::UserRight;

/// Decides whether an inbound inbox POST is acceptable before parsing.
pub trait InboxVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), String>;
}

/// Default verifier: every sender is trusted. Suitable for closed networks
/// and tests; deployments sit behind their own authentication layer.
pub struct AllowAllVerifier;

impl InboxVerifier for AllowAllVerifier {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// Capability check for operator API calls.
pub trait RightsProvider: Send + Sync {
    fn has_right(&self, bearer_token: Option<&str>, right: UserRight) -> bool;
}

/// Single shared-token policy: with no token configured the API is open;
/// with one configured, the bearer of it holds every right.
pub struct TokenRights {
    admin_token: Option<String>,
}

impl TokenRights {
    pub fn new(admin_token: Option<String>) -> Self {
        let admin_token = admin_token.filter(|t| !t.trim().is_empty());
        Self { admin_token }
    }
}

impl RightsProvider for TokenRights {
    fn has_right(&self, bearer_token: Option<&str>, _right: UserRight) -> bool {
        match &self.admin_token {
            None => true,
            Some(expected) => bearer_token == Some(expected.as_str()),
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_instance_grants_everything() {
        let rights = TokenRights::new(None);
        assert!(rights.has_right(None, UserRight::ManageServerFollow));
    }

    #[test]
    fn token_gated_instance_requires_the_token() {
        let rights = TokenRights::new(Some("s3cret".into()));
        assert!(!rights.has_right(None, UserRight::ManageServerFollow));
        assert!(!rights.has_right(Some("wrong"), UserRight::ManageServerFollow));
        assert!(rights.has_right(Some("s3cret"), UserRight::ManageUsers));
    }

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert("Authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
