use std::net::{IpAddr, Ipv6Addr};

use tokio::net::lookup_host;
use url::{Host, Url};

use crate::error::{GuardError, StreamError};

/// Construction-time check: the webhook URL must parse, use an http(s)
/// scheme, and carry a host.
pub(crate) fn parse_webhook_url(raw: &str) -> Result<Url, StreamError> {
    let url = Url::parse(raw).map_err(|_| StreamError::InvalidUrl)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StreamError::InvalidUrl);
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(StreamError::InvalidUrl);
    }
    Ok(url)
}

/// Pre-dispatch URL safety check.
///
/// Runs before **every** delivery attempt, not just at construction: DNS
/// answers change, and a rebinding host must not steer deliveries into an
/// internal network after validation.
#[derive(Debug, Clone)]
pub struct UrlGuard {
    allow_private_ips: bool,
}

impl UrlGuard {
    pub fn new(allow_private_ips: bool) -> Self {
        Self { allow_private_ips }
    }

    /// Resolve the URL's host and reject any restricted address unless
    /// private IPs are explicitly permitted.
    pub async fn check(&self, url: &Url) -> Result<(), GuardError> {
        let addrs = match url.host() {
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(domain)) => {
                let port = url.port_or_known_default().unwrap_or(80);
                let resolved = lookup_host((domain, port))
                    .await
                    .map_err(|_| GuardError::Unresolvable(domain.to_string()))?;
                resolved.map(|addr| addr.ip()).collect()
            }
            None => return Err(GuardError::Unresolvable(String::new())),
        };

        if addrs.is_empty() {
            let host = url.host_str().unwrap_or_default().to_string();
            return Err(GuardError::Unresolvable(host));
        }

        if self.allow_private_ips {
            return Ok(());
        }
        for ip in addrs {
            if is_restricted(ip) {
                return Err(GuardError::BlockedAddress(ip));
            }
        }
        Ok(())
    }
}

/// Addresses the guard refuses by default: loopback, link-local, RFC1918
/// private, IPv6 unique-local, and the unspecified address.
fn is_restricted(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_restricted(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local(&v6)
                || is_unicast_link_local(&v6)
        }
    }
}

// fc00::/7
fn is_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_webhook_url(":badurl").unwrap_err(), StreamError::InvalidUrl);
        assert_eq!(parse_webhook_url("").unwrap_err(), StreamError::InvalidUrl);
        assert_eq!(parse_webhook_url("http://").unwrap_err(), StreamError::InvalidUrl);
    }

    #[test]
    fn parse_rejects_non_http_schemes() {
        assert_eq!(
            parse_webhook_url("ftp://example.com/x").unwrap_err(),
            StreamError::InvalidUrl
        );
        assert_eq!(
            parse_webhook_url("unix:/tmp/hook.sock").unwrap_err(),
            StreamError::InvalidUrl
        );
    }

    #[test]
    fn parse_accepts_http_and_https() {
        assert!(parse_webhook_url("http://example.com/hook").is_ok());
        assert!(parse_webhook_url("https://example.com:8443/hook").is_ok());
    }

    #[test]
    fn restricted_ranges() {
        for raw in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.0.1",
            "0.0.0.0",
            "::1",
            "fc00::1",
            "fd12::1",
            "fe80::1",
            "::ffff:192.168.0.1",
        ] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(is_restricted(ip), "{raw} should be restricted");
        }
        for raw in ["8.8.8.8", "1.1.1.1", "2606:4700::1111"] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(!is_restricted(ip), "{raw} should be allowed");
        }
    }

    #[tokio::test]
    async fn check_blocks_loopback_literal() {
        let guard = UrlGuard::new(false);
        let url = parse_webhook_url("http://127.0.0.1:9099/hook").unwrap();
        assert!(matches!(
            guard.check(&url).await,
            Err(GuardError::BlockedAddress(_))
        ));
    }

    #[tokio::test]
    async fn check_allows_loopback_when_permitted() {
        let guard = UrlGuard::new(true);
        let url = parse_webhook_url("http://127.0.0.1:9099/hook").unwrap();
        assert!(guard.check(&url).await.is_ok());
    }

    #[tokio::test]
    async fn check_allows_public_literal() {
        let guard = UrlGuard::new(false);
        let url = parse_webhook_url("http://8.8.8.8/hook").unwrap();
        assert!(guard.check(&url).await.is_ok());
    }

    #[tokio::test]
    async fn check_fails_unresolvable_host() {
        let guard = UrlGuard::new(true);
        let url = parse_webhook_url("http://fail.invalid/hook").unwrap();
        assert!(matches!(
            guard.check(&url).await,
            Err(GuardError::Unresolvable(_))
        ));
    }
}
