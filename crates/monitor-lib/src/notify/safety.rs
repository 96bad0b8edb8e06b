//! Webhook destination vetting
//!
//! Rejects URLs that would make the agent talk to itself or to internal
//! infrastructure: non-HTTP schemes, loopback/private/link-local/metadata
//! addresses, and well-known internal hostnames. Hostnames are resolved
//! here and the resolved address is returned so the caller can pin its
//! connection to it, closing the DNS-rebinding window between check and
//! connect.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlSafetyError {
    #[error("invalid URL: {0}")]
    Invalid(String),
    #[error("scheme '{0}' is not allowed, only http and https")]
    Scheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("hostname '{0}' is not allowed")]
    ForbiddenHost(String),
    #[error("address {0} is in a private or reserved range")]
    PrivateAddress(IpAddr),
    #[error("hostname '{0}' did not resolve")]
    Unresolvable(String),
}

/// A vetted webhook destination: the original URL plus the resolved
/// address every connection must be pinned to
#[derive(Debug, Clone)]
pub struct SafeTarget {
    pub url: Url,
    pub host: String,
    pub addr: SocketAddr,
}

/// Whether an address belongs to a range the agent must never contact
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // carrier-grade NAT, 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
                // IETF protocol assignments, 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // v4-mapped addresses inherit the v4 verdict
                || v6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

fn forbidden_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost"
        || host == "metadata.google.internal"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

/// Parse and vet a webhook URL, resolving its hostname
///
/// Every resolved address must be public; a single private address fails
/// the whole target. Returns the first resolved address for pinning.
pub async fn resolve_safe(raw: &str) -> Result<SafeTarget, UrlSafetyError> {
    let url = Url::parse(raw).map_err(|err| UrlSafetyError::Invalid(err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlSafetyError::Scheme(other.to_string())),
    }

    let host = url
        .host_str()
        .ok_or(UrlSafetyError::MissingHost)?
        .to_string();
    if forbidden_hostname(&host) {
        return Err(UrlSafetyError::ForbiddenHost(host));
    }

    let port = url
        .port_or_known_default()
        .ok_or_else(|| UrlSafetyError::Invalid("no port".to_string()))?;

    // IP literals are judged directly, no lookup involved
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(UrlSafetyError::PrivateAddress(ip));
        }
        return Ok(SafeTarget {
            url,
            host,
            addr: SocketAddr::new(ip, port),
        });
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| UrlSafetyError::Unresolvable(host.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(UrlSafetyError::Unresolvable(host));
    }
    for addr in &addrs {
        if is_private_ip(&addr.ip()) {
            return Err(UrlSafetyError::PrivateAddress(addr.ip()));
        }
    }

    Ok(SafeTarget {
        url,
        host,
        addr: addrs[0],
    })
}

/// Convenience check used by channel validation, discards the pin
pub async fn check_url(raw: &str) -> Result<(), UrlSafetyError> {
    resolve_safe(raw).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_rejects_loopback_literal() {
        let err = resolve_safe("http://127.0.0.1:9000/hook").await.unwrap_err();
        assert!(matches!(err, UrlSafetyError::PrivateAddress(_)));
    }

    #[tokio::test]
    async fn test_rejects_metadata_endpoint() {
        let err = resolve_safe("http://169.254.169.254/latest/meta-data")
            .await
            .unwrap_err();
        assert!(matches!(err, UrlSafetyError::PrivateAddress(_)));
    }

    #[tokio::test]
    async fn test_rejects_internal_hostnames_without_lookup() {
        for raw in [
            "http://localhost:3000/hook",
            "https://secrets.internal/hook",
            "http://printer.local/hook",
            "http://metadata.google.internal/computeMetadata/v1/",
        ] {
            let err = resolve_safe(raw).await.unwrap_err();
            assert!(
                matches!(err, UrlSafetyError::ForbiddenHost(_)),
                "{raw} should be rejected by hostname"
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_private_ranges() {
        for raw in [
            "http://10.0.0.5/hook",
            "http://172.16.1.1/hook",
            "http://192.168.1.10/hook",
            "http://100.64.0.1/hook",
            "http://0.0.0.0/hook",
            "http://[::1]/hook",
            "http://[fd00::1]/hook",
            "http://[fe80::1]/hook",
        ] {
            let err = resolve_safe(raw).await.unwrap_err();
            assert!(
                matches!(err, UrlSafetyError::PrivateAddress(_)),
                "{raw} should be rejected by address"
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        assert!(matches!(
            resolve_safe("ftp://example.com/hook").await.unwrap_err(),
            UrlSafetyError::Scheme(_)
        ));
        assert!(matches!(
            resolve_safe("file:///etc/passwd").await.unwrap_err(),
            UrlSafetyError::Scheme(_)
        ));
    }

    #[tokio::test]
    async fn test_accepts_public_literal_and_pins_it() {
        let target = resolve_safe("https://8.8.8.8/hook").await.unwrap();
        assert_eq!(target.addr.ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(target.addr.port(), 443);
        assert_eq!(target.host, "8.8.8.8");
    }

    #[test]
    fn test_private_ip_table() {
        let private = [
            "127.0.0.1",
            "10.1.2.3",
            "172.31.255.255",
            "192.168.0.1",
            "169.254.169.254",
            "100.127.0.1",
            "192.0.0.1",
            "::1",
            "fc00::1",
            "fe80::2",
            "::ffff:10.0.0.1",
        ];
        for raw in private {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(is_private_ip(&ip), "{raw} should be private");
        }

        let public = ["8.8.8.8", "1.1.1.1", "93.184.216.34", "2606:4700::1111"];
        for raw in public {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(!is_private_ip(&ip), "{raw} should be public");
        }
    }
}
