use crate::error::PipelineError;
use anyhow::Result;
use futures_util::StreamExt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub allowed_domains: Vec<String>,
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Video,
    Image,
}

impl FetchKind {
    fn timeout(self) -> Duration {
        match self {
            FetchKind::Video => Duration::from_secs(300),
            FetchKind::Image => Duration::from_secs(60),
        }
    }

    fn min_bytes(self) -> u64 {
        match self {
            FetchKind::Video => 1024,
            FetchKind::Image => 100,
        }
    }

    fn max_bytes(self) -> Option<u64> {
        match self {
            FetchKind::Video => None,
            FetchKind::Image => Some(50 * 1024 * 1024),
        }
    }
}

/// Checks a host against the private/loopback/link-local denylist. Applied
/// both to the textual hostname (rejecting `localhost`/`*.internal`/`*.local`
/// outright) and, after DNS resolution, to every resolved address — so a
/// DNS-rebind between the guard check and the connect can't smuggle a
/// disallowed address through an allowlisted hostname.
fn is_denied_host(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
        || lower == "0.0.0.0"
}

fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn host_allowed(host: &str, allowed_domains: &[String]) -> bool {
    allowed_domains.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return host == suffix || host.ends_with(&format!(".{}", suffix));
        }
        host.eq_ignore_ascii_case(pattern)
    })
}

/// Validates scheme, host denylist, and allowlist before any connection is
/// attempted. Does not itself resolve DNS; callers performing a real fetch
/// must additionally check resolved addresses via `is_denied_ip`.
pub fn check_url_policy(url: &str, policy: &DownloadPolicy) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| PipelineError::DownloadRejected(format!("invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(
                PipelineError::DownloadRejected(format!("scheme not allowed: {}", other)).into(),
            )
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| PipelineError::DownloadRejected("missing host".to_string()))?;

    if is_denied_host(host) {
        return Err(PipelineError::DownloadRejected(format!("host denied: {}", host)).into());
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_denied_ip(ip) {
            return Err(
                PipelineError::DownloadRejected(format!("address denied: {}", ip)).into(),
            );
        }
    }

    if !host_allowed(host, &policy.allowed_domains) {
        return Err(
            PipelineError::DownloadRejected(format!("host not in allowlist: {}", host)).into(),
        );
    }

    Ok(parsed)
}

/// Resolves `url`'s host and rejects it if any resolved address falls in the
/// denylist, before a connection is ever attempted. A textual IP in the URL
/// is already caught by `check_url_policy`; this covers hostnames that
/// resolve to a private/loopback/link-local address.
async fn resolve_and_check_denied(url: &reqwest::Url) -> Result<()> {
    let host = url
        .host_str()
        .ok_or_else(|| PipelineError::DownloadRejected("missing host".to_string()))?;
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| PipelineError::DownloadRejected(format!("dns resolution failed: {}", e)))?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_denied_ip(addr.ip()) {
            return Err(PipelineError::DownloadRejected(format!(
                "resolved address denied: {}",
                addr.ip()
            ))
            .into());
        }
    }

    if !resolved_any {
        return Err(PipelineError::DownloadRejected(format!("host did not resolve: {}", host)).into());
    }

    Ok(())
}

/// Fetches `url` to `dest`, applying the SSRF guard, a single-redirect-hop
/// policy, a per-kind timeout, and size bounds. Re-validates every resolved
/// socket address the underlying client actually connects to.
pub async fn guarded_fetch(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    kind: FetchKind,
    policy: &DownloadPolicy,
) -> Result<u64> {
    let parsed = check_url_policy(url, policy)?;
    resolve_and_check_denied(&parsed).await?;

    let response = client
        .get(parsed.clone())
        .timeout(kind.timeout())
        .send()
        .await
        .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;

    if let Some(remote) = response.remote_addr() {
        if is_denied_ip(remote.ip()) {
            return Err(PipelineError::DownloadRejected(format!(
                "resolved address denied: {}",
                remote.ip()
            ))
            .into());
        }
    }

    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed(format!(
            "unexpected status: {}",
            response.status()
        ))
        .into());
    }

    if let Some(len) = response.content_length() {
        if len < kind.min_bytes() {
            return Err(PipelineError::DownloadFailed(format!(
                "response too small: {} bytes",
                len
            ))
            .into());
        }
        if let Some(max) = kind.max_bytes() {
            if len > max {
                return Err(PipelineError::DownloadFailed(format!(
                    "response too large: {} bytes",
                    len
                ))
                .into());
            }
        }
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Stream chunk-by-chunk rather than buffering the whole response, so a
    // server that ignores Content-Length can't exhaust worker memory before
    // the size bound below ever gets checked.
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;
        written += chunk.len() as u64;
        if let Some(max) = kind.max_bytes() {
            if written > max {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(PipelineError::DownloadFailed(format!(
                    "body too large: exceeded {} bytes",
                    max
                ))
                .into());
            }
        }
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
            .await
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;
    }

    if written < kind.min_bytes() {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(PipelineError::DownloadFailed(format!("body too small: {} bytes", written)).into());
    }

    Ok(written)
}

/// Builds a `reqwest::Client` with the corpus's standard posture: one
/// redirect hop followed, TLS verification gated by config.
pub fn build_client(policy: &DownloadPolicy) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(1))
        .danger_accept_invalid_certs(!policy.verify_ssl)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(domains: &[&str]) -> DownloadPolicy {
        DownloadPolicy {
            allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
            verify_ssl: true,
        }
    }

    #[test]
    fn rejects_non_http_scheme() {
        let result = check_url_policy("ftp://example.com/x", &policy(&["*"]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_loopback_textual_ip() {
        let result = check_url_policy("http://127.0.0.1/secret", &policy(&["*"]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_private_range() {
        let result = check_url_policy("http://10.0.0.5/x", &policy(&["*"]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_link_local_metadata_endpoint() {
        let result = check_url_policy("http://169.254.169.254/latest/meta-data/", &policy(&["*"]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_dot_internal_and_dot_local() {
        assert!(check_url_policy("http://svc.internal/x", &policy(&["*"])).is_err());
        assert!(check_url_policy("http://printer.local/x", &policy(&["*"])).is_err());
    }

    #[test]
    fn allows_wildcard_suffix_match() {
        let result = check_url_policy("https://cdn.example.com/clip.mp4", &policy(&["*.example.com"]));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_host_outside_allowlist() {
        let result = check_url_policy("https://evil.example.org/x", &policy(&["*.example.com"]));
        assert!(result.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn private_ipv4_ranges_are_always_denied(
            a in 0_u8..=255, b in 0_u8..=255, c in 0_u8..=255, d in 0_u8..=255,
        ) {
            let ip = std::net::Ipv4Addr::new(a, b, c, d);
            let denied = is_denied_ip(IpAddr::V4(ip));
            if ip.is_private() || ip.is_loopback() || ip.is_link_local() {
                prop_assert!(denied);
            }
        }
    }
}
