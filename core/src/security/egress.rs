//! Egress policy for outbound fetches
//!
//! Applied before any network I/O: scheme/TLS checks, host allow/deny
//! lists, and DNS resolution with private/link-local/loopback blocking.
//! Redirect and payload limits are enforced by the fetch tool itself.

use std::net::{IpAddr, ToSocketAddrs};

/// Outbound fetch policy. Empty allowlist means any host passes, subject
/// to the other checks.
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    pub enforce_tls: bool,
    pub block_private_ip: bool,
    pub allow_redirects: u32,
    pub max_payload_bytes: u64,
    pub allowlist_hosts: Vec<String>,
    pub denylist_hosts: Vec<String>,
}

impl Default for EgressPolicy {
    fn default() -> Self {
        Self {
            enforce_tls: true,
            block_private_ip: true,
            allow_redirects: 3,
            max_payload_bytes: 5 * 1024 * 1024,
            allowlist_hosts: Vec::new(),
            denylist_hosts: Vec::new(),
        }
    }
}

/// Why a URL was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressViolation {
    DisallowedScheme,
    TlsRequired,
    MissingHost,
    HostDenied,
    HostNotAllowed,
    PrivateIpBlocked,
    DnsFailure(String),
}

impl EgressViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DisallowedScheme => "disallowed_scheme",
            Self::TlsRequired => "tls_required",
            Self::MissingHost => "missing_host",
            Self::HostDenied => "host_denied",
            Self::HostNotAllowed => "host_not_allowed",
            Self::PrivateIpBlocked => "private_ip_blocked",
            Self::DnsFailure(_) => "dns_failure",
        }
    }
}

fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // unique-local fc00::/7 and link-local fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn host_of(url: &str) -> Option<(String, String, Option<u16>)> {
    // scheme://host[:port]/...
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() => {
            (h, p.parse::<u16>().ok())
        }
        _ => (authority, None),
    };
    if host.is_empty() {
        return None;
    }
    Some((scheme.to_lowercase(), host.trim_matches(['[', ']']).to_lowercase(), port))
}

/// Validate a URL against the policy. DNS resolution runs only when
/// private-IP blocking is on.
pub fn check_url_allowed(
    url: &str,
    policy: &EgressPolicy,
) -> std::result::Result<(), EgressViolation> {
    let Some((scheme, host, port)) = host_of(url) else {
        return Err(EgressViolation::MissingHost);
    };
    if scheme != "http" && scheme != "https" {
        return Err(EgressViolation::DisallowedScheme);
    }
    if policy.enforce_tls && scheme != "https" {
        return Err(EgressViolation::TlsRequired);
    }
    let denied = policy
        .denylist_hosts
        .iter()
        .any(|h| h.eq_ignore_ascii_case(&host));
    if denied {
        return Err(EgressViolation::HostDenied);
    }
    if !policy.allowlist_hosts.is_empty()
        && !policy
            .allowlist_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&host))
    {
        return Err(EgressViolation::HostNotAllowed);
    }
    if policy.block_private_ip {
        // Literal IPs short-circuit; names resolve through the system.
        if let Ok(addr) = host.parse::<IpAddr>() {
            if is_private_ip(addr) {
                return Err(EgressViolation::PrivateIpBlocked);
            }
        } else {
            let lookup_port = port.unwrap_or(if scheme == "https" { 443 } else { 80 });
            let addrs = (host.as_str(), lookup_port)
                .to_socket_addrs()
                .map_err(|e| EgressViolation::DnsFailure(e.to_string()))?;
            for addr in addrs {
                if is_private_ip(addr.ip()) {
                    return Err(EgressViolation::PrivateIpBlocked);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_policy() -> EgressPolicy {
        EgressPolicy {
            enforce_tls: false,
            block_private_ip: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_tls_required_by_default() {
        let err = check_url_allowed("http://example.com/x", &EgressPolicy::default()).unwrap_err();
        assert_eq!(err, EgressViolation::TlsRequired);
    }

    #[test]
    fn test_scheme_rejected() {
        let err = check_url_allowed("ftp://example.com/x", &open_policy()).unwrap_err();
        assert_eq!(err, EgressViolation::DisallowedScheme);
    }

    #[test]
    fn test_loopback_literal_blocked() {
        let policy = EgressPolicy {
            enforce_tls: false,
            ..Default::default()
        };
        let err = check_url_allowed("http://127.0.0.1:8080/admin", &policy).unwrap_err();
        assert_eq!(err, EgressViolation::PrivateIpBlocked);
    }

    #[test]
    fn test_rfc1918_literal_blocked() {
        let policy = EgressPolicy {
            enforce_tls: false,
            ..Default::default()
        };
        for url in [
            "http://10.0.0.8/x",
            "http://172.16.4.2/x",
            "http://192.168.1.1/x",
        ] {
            assert_eq!(
                check_url_allowed(url, &policy).unwrap_err(),
                EgressViolation::PrivateIpBlocked,
                "expected block for {url}"
            );
        }
    }

    #[test]
    fn test_denylist_wins() {
        let policy = EgressPolicy {
            denylist_hosts: vec!["bad.example.com".to_string()],
            ..open_policy()
        };
        let err = check_url_allowed("https://bad.example.com/", &policy).unwrap_err();
        assert_eq!(err, EgressViolation::HostDenied);
    }

    #[test]
    fn test_allowlist_excludes_others() {
        let policy = EgressPolicy {
            allowlist_hosts: vec!["docs.example.com".to_string()],
            ..open_policy()
        };
        assert!(check_url_allowed("https://docs.example.com/a", &policy).is_ok());
        let err = check_url_allowed("https://other.example.com/a", &policy).unwrap_err();
        assert_eq!(err, EgressViolation::HostNotAllowed);
    }

    #[test]
    fn test_host_parsing_handles_ports_and_userinfo() {
        assert!(check_url_allowed("https://user@docs.example.com:8443/a", &open_policy()).is_ok());
        assert_eq!(
            check_url_allowed("https:///nohost", &open_policy()).unwrap_err(),
            EgressViolation::MissingHost
        );
    }
}
