//! SSRF-safe inlining of `input_image` URLs
//!
//! When enabled, remote image URLs in the request payload are fetched and
//! replaced with `data:` URLs before the payload leaves for the upstream.
//! The fetch never follows redirects, refuses private/loopback/link-local/
//! multicast destinations, and pins DNS so the connection can only reach the
//! addresses that passed the check (Host header and TLS SNI stay on the
//! original hostname). Any failure leaves the payload part untouched.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use serde_json::Value;
use url::Url;

use crate::config::Config;

const FETCH_TIMEOUT: Duration = Duration::from_secs(8);
const BLOCKED_LITERAL_HOSTS: &[&str] = &["localhost", "localhost.localdomain"];

/// Rewrite eligible `input_image` parts in place.
pub async fn inline_input_images(payload: &mut Value, config: &Config) {
    let Some(input) = payload.get_mut("input").and_then(Value::as_array_mut) else {
        return;
    };
    for item in input.iter_mut() {
        let Some(content) = item.get_mut("content") else {
            continue;
        };
        match content {
            Value::Array(parts) => {
                for part in parts.iter_mut() {
                    inline_part(part, config).await;
                }
            }
            part => inline_part(part, config).await,
        }
    }
}

async fn inline_part(part: &mut Value, config: &Config) {
    if part.get("type").and_then(Value::as_str) != Some("input_image") {
        return;
    }
    let Some(image_url) = part.get("image_url").and_then(Value::as_str) else {
        return;
    };
    if !image_url.starts_with("http://") && !image_url.starts_with("https://") {
        return;
    }
    if let Some(data_url) = fetch_image_data_url(image_url, config).await {
        part["image_url"] = Value::String(data_url);
    }
}

#[derive(Debug)]
struct SafeFetchTarget {
    url: Url,
    host: String,
    addrs: Vec<SocketAddr>,
}

/// Validate and resolve an image URL; `None` means "do not fetch".
async fn resolve_safe_target(raw_url: &str, config: &Config) -> Option<SafeFetchTarget> {
    let url = Url::parse(raw_url).ok()?;
    if url.scheme() != "https" {
        return None;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return None;
    }
    let host = url.host_str()?.trim().to_lowercase();
    let host = host.trim_end_matches('.').to_string();
    if host.is_empty() || BLOCKED_LITERAL_HOSTS.contains(&host.as_str()) {
        return None;
    }
    if !config.image_inline_allowed_hosts.is_empty()
        && !config.image_inline_allowed_hosts.contains(&host)
    {
        return None;
    }
    let port = url.port_or_known_default()?;

    let addrs: Vec<SocketAddr> = if let Ok(literal) = host.parse::<IpAddr>() {
        if is_disallowed_ip(literal) {
            return None;
        }
        vec![SocketAddr::new(literal, port)]
    } else {
        let resolved = tokio::time::timeout(
            FETCH_TIMEOUT,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await
        .ok()?
        .ok()?
        .collect::<Vec<_>>();
        if resolved.is_empty() {
            return None;
        }
        // One tainted address poisons the whole set.
        if resolved.iter().any(|addr| is_disallowed_ip(addr.ip())) {
            return None;
        }
        resolved
    };

    Some(SafeFetchTarget { url, host, addrs })
}

/// Addresses the proxy must never dial on behalf of a client payload.
fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
                // Carrier-grade NAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // Mapped IPv4 inherits the IPv4 verdict
                || v6.to_ipv4_mapped().map(|v4| is_disallowed_ip(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

async fn fetch_image_data_url(raw_url: &str, config: &Config) -> Option<String> {
    let target = resolve_safe_target(raw_url, config).await?;

    // DNS is pinned to the vetted addresses; a rebinding resolver cannot
    // steer the connection anywhere else.
    let client = reqwest::Client::builder()
        .resolve_to_addrs(&target.host, &target.addrs)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.upstream_connect_timeout.min(FETCH_TIMEOUT))
        .timeout(FETCH_TIMEOUT)
        .build()
        .ok()?;

    let response = client.get(target.url.clone()).send().await.ok()?;
    if response.status() != reqwest::StatusCode::OK {
        return None;
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or("").trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let mut data: Vec<u8> = Vec::new();
    let body = response.bytes_stream();
    tokio::pin!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.ok()?;
        data.extend_from_slice(&chunk);
        if data.len() > config.image_inline_max_bytes {
            return None;
        }
    }
    if data.is_empty() {
        return None;
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
    Some(format!("data:{mime_type};base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Config {
        std::env::remove_var("CODEX_LB_ACCOUNTS_DATABASE_URL");
        let mut config = Config::from_env().unwrap();
        config.image_inline_fetch_enabled = true;
        config
    }

    #[test]
    fn test_disallowed_ips() {
        for raw in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.1.1",
            "224.0.0.1",
            "0.0.0.0",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fc00::1",
            "::ffff:127.0.0.1",
        ] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(is_disallowed_ip(ip), "{raw} should be blocked");
        }
        for raw in ["93.184.216.34", "2606:2800:220:1::1"] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(!is_disallowed_ip(ip), "{raw} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_plain_http_userinfo_and_loopback_literal() {
        let config = test_config();
        assert!(resolve_safe_target("http://example.com/a.png", &config).await.is_none());
        assert!(resolve_safe_target("https://user:pw@example.com/a.png", &config).await.is_none());
        assert!(resolve_safe_target("https://127.0.0.1/a.png", &config).await.is_none());
        assert!(resolve_safe_target("https://localhost/a.png", &config).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_honors_allowlist() {
        let mut config = test_config();
        config.image_inline_allowed_hosts = vec!["cdn.example.com".to_string()];
        assert!(resolve_safe_target("https://93.184.216.34/a.png", &config).await.is_none());
    }

    #[tokio::test]
    async fn test_inline_leaves_payload_unchanged_when_blocked() {
        let config = test_config();
        let mut payload = json!({
            "input": [{
                "type": "message",
                "content": [{"type": "input_image", "image_url": "https://127.0.0.1/a.png"}],
            }],
        });
        let original = payload.clone();
        inline_input_images(&mut payload, &config).await;
        assert_eq!(payload, original);
    }
}
