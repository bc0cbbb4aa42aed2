#![forbid(unsafe_code)]

//! Process and request hygiene shared by the VideyLite binaries: the root
//! check, client address resolution and the privacy-preserving viewer
//! fingerprint used by the view ledger.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Result, bail};
use axum::http::HeaderMap;
use nix::unistd::Uid;

/// Longest user-agent string persisted with a view event.
pub const MAX_USER_AGENT_CHARS: usize = 255;

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Fails fast when a binary is started as root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Raw inputs of a viewer fingerprint. Only ever used for view dedup, never
/// for access control.
#[derive(Debug, Clone, Default)]
pub struct ViewerInputs {
    pub client_ip: String,
    pub user_agent: String,
}

impl ViewerInputs {
    /// Collects the client address and user agent of a request. Proxy headers
    /// are only honoured when `trust_proxy` is set, otherwise any client could
    /// spoof its way around the dedup window.
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Self {
        let client_ip = trust_proxy
            .then(|| forwarded_client_ip(headers))
            .flatten()
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_default();
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(truncate_user_agent)
            .unwrap_or_default();
        Self {
            client_ip,
            user_agent,
        }
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| value.parse::<IpAddr>().is_ok())
            .map(str::to_string)
    };
    header_ip(CF_CONNECTING_IP).or_else(|| header_ip(X_FORWARDED_FOR))
}

/// Cuts a user agent down to [`MAX_USER_AGENT_CHARS`] characters without
/// splitting a UTF-8 sequence.
pub fn truncate_user_agent(value: &str) -> String {
    value.chars().take(MAX_USER_AGENT_CHARS).collect()
}

/// One-way viewer fingerprint for `(client_ip, video_id)`, hex encoded.
///
/// The salt keeps stored fingerprints from being reversed by hashing the IPv4
/// space. Distinct viewers may collide; that only ever suppresses a view.
pub fn viewer_fingerprint(salt: &str, client_ip: &str, video_id: i64) -> String {
    let mut hasher = blake3::Hasher::new_derive_key("videylite 2024 viewer fingerprint");
    hasher.update(salt.as_bytes());
    hasher.update(&[0]);
    hasher.update(client_ip.as_bytes());
    hasher.update(b"||");
    hasher.update(video_id.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.7:51000".parse().unwrap())
    }

    #[test]
    fn proxy_headers_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        let inputs = ViewerInputs::from_request(&headers, peer(), false);
        assert_eq!(inputs.client_ip, "10.0.0.7");
    }

    #[test]
    fn trusted_proxy_prefers_cloudflare_then_first_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let inputs = ViewerInputs::from_request(&headers, peer(), true);
        assert_eq!(inputs.client_ip, "203.0.113.9");

        headers.insert(CF_CONNECTING_IP, HeaderValue::from_static("198.51.100.4"));
        let inputs = ViewerInputs::from_request(&headers, peer(), true);
        assert_eq!(inputs.client_ip, "198.51.100.4");
    }

    #[test]
    fn garbage_forwarded_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("not-an-ip"));
        let inputs = ViewerInputs::from_request(&headers, peer(), true);
        assert_eq!(inputs.client_ip, "10.0.0.7");
    }

    #[test]
    fn user_agent_is_truncated() {
        let mut headers = HeaderMap::new();
        let long = "é".repeat(400);
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_str(&"a".repeat(400)).unwrap(),
        );
        let inputs = ViewerInputs::from_request(&headers, None, false);
        assert_eq!(inputs.user_agent.len(), MAX_USER_AGENT_CHARS);
        assert_eq!(inputs.client_ip, "");
        assert_eq!(
            truncate_user_agent(&long).chars().count(),
            MAX_USER_AGENT_CHARS
        );
    }

    #[test]
    fn fingerprint_depends_on_ip_video_and_salt() {
        let base = viewer_fingerprint("salt", "203.0.113.9", 1);
        assert_eq!(base.len(), 64);
        assert_eq!(base, viewer_fingerprint("salt", "203.0.113.9", 1));
        assert_ne!(base, viewer_fingerprint("salt", "203.0.113.9", 2));
        assert_ne!(base, viewer_fingerprint("salt", "203.0.113.10", 1));
        assert_ne!(base, viewer_fingerprint("pepper", "203.0.113.9", 1));
        assert!(!base.contains("203.0.113.9"));
    }
}
