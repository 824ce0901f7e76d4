//! Client authorization against external HTTP auth peers.
//!
//! The broker never checks secrets itself: it forwards them to each
//! configured `auth_http_addresses` peer and caches the returned
//! allow-list until its TTL runs out. Topic/channel entries in the
//! allow-list are anchored regexes.

use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub identity: String,
    #[serde(default)]
    pub identity_url: String,
    /// seconds
    pub ttl: i64,
    #[serde(default)]
    pub authorizations: Vec<Authorization>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub topic: String,
    pub channels: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthState {
    pub response: AuthResponse,
    expires: Instant,
}

impl AuthState {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    pub fn is_allowed(&self, topic: &str, channel: &str, permission: &str) -> bool {
        self.response.authorizations.iter().any(|auth| {
            auth.permissions.iter().any(|p| p == permission)
                && anchored_match(&auth.topic, topic)
                && (channel.is_empty()
                    || auth.channels.iter().any(|c| anchored_match(c, channel)))
        })
    }
}

fn anchored_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^{pattern}$")) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            warn!(pattern, error = %e, "bad authorization pattern");
            false
        }
    }
}

/// Present `secret` to each configured peer in order; the first one
/// that answers wins.
pub async fn query_auth_peers(
    addresses: &[String],
    request_timeout: Duration,
    remote_ip: &str,
    secret: &str,
) -> Result<AuthState, ProtocolError> {
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| ProtocolError::fatal("E_AUTH_FAILED", e.to_string()))?;

    for addr in addresses {
        let url = format!("http://{addr}/auth");
        let result = client
            .get(&url)
            .query(&[("remote_ip", remote_ip), ("tls", "false"), ("secret", secret)])
            .send()
            .await;

        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(peer = %addr, status = %resp.status(), "auth peer rejected request");
                continue;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "auth peer unreachable");
                continue;
            }
        };

        match resp.json::<AuthResponse>().await {
            Ok(response) => {
                let ttl = Duration::from_secs(response.ttl.max(1) as u64);
                return Ok(AuthState {
                    response,
                    expires: Instant::now() + ttl,
                });
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "bad auth peer response");
            }
        }
    }

    Err(ProtocolError::fatal(
        "E_AUTH_FAILED",
        "no auth peer accepted the secret",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(auths: Vec<Authorization>) -> AuthState {
        AuthState {
            response: AuthResponse {
                identity: "test".into(),
                identity_url: String::new(),
                ttl: 60,
                authorizations: auths,
            },
            expires: Instant::now() + Duration::from_secs(60),
        }
    }

    #[test]
    fn allow_list_matches_anchored_patterns() {
        let s = state(vec![Authorization {
            topic: "orders.*".into(),
            channels: vec![".*".into()],
            permissions: vec!["subscribe".into(), "publish".into()],
        }]);
        assert!(s.is_allowed("orders.eu", "billing", "subscribe"));
        assert!(s.is_allowed("orders.eu", "", "publish"));
        // anchor: "orders.*" must not match a prefix of another name
        assert!(!s.is_allowed("all-orders.eu", "billing", "subscribe"));
        assert!(!s.is_allowed("clicks", "billing", "subscribe"));
    }

    #[test]
    fn permission_is_checked() {
        let s = state(vec![Authorization {
            topic: "t".into(),
            channels: vec![".*".into()],
            permissions: vec!["publish".into()],
        }]);
        assert!(s.is_allowed("t", "", "publish"));
        assert!(!s.is_allowed("t", "c", "subscribe"));
    }
}
