//! Address parsing and local-IP assignment helpers.
//!
//! Forward addresses are written as `host:port` or full URIs. Anything
//! without a scheme is treated as `tcp://` so the three address forms of a
//! forward always parse to the same shape.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+\-.]*://").expect("scheme regex is valid")
});

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("failed to parse addr {addr}: {source}")]
    Parse {
        addr: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no port specified for addr: {0}")]
    MissingPort(String),
    #[error("addr {0} has no host")]
    MissingHost(String),
}

/// Parse an address into a URL, defaulting the scheme to `tcp://`.
pub fn parse(raw: &str) -> Result<Url, AddrError> {
    let with_scheme = if SCHEME_RE.is_match(raw) {
        raw.to_string()
    } else {
        format!("tcp://{raw}")
    };

    Url::parse(&with_scheme).map_err(|source| AddrError::Parse {
        addr: raw.to_string(),
        source,
    })
}

/// Well-known default port for a scheme, if there is one.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Effective port of a parsed address, covering schemes whose default port
/// the URL parser elides (e.g. `http://host:80`).
pub fn port_of(url: &Url) -> Option<u16> {
    url.port().or_else(|| default_port(url.scheme()))
}

/// The next usable IPv4 address after `ip`.
///
/// Increments with carry and skips any result whose last octet is 0 or 255,
/// so network identifiers and broadcast addresses are never handed out.
pub fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    let mut candidate = u32::from(ip);
    loop {
        candidate = candidate.wrapping_add(1);
        let last_octet = (candidate & 0xff) as u8;
        if last_octet != 0 && last_octet != 255 {
            return Ipv4Addr::from(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_scheme_to_tcp() {
        let url = parse("postgres.svc:5432").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host_str(), Some("postgres.svc"));
        assert_eq!(url.port(), Some(5432));
    }

    #[test]
    fn test_parse_keeps_explicit_scheme() {
        let url = parse("http://auth.local/login").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("auth.local"));
        assert_eq!(url.port(), None);
        assert_eq!(port_of(&url), Some(80));
    }

    #[test]
    fn test_parse_port_only_source_addr() {
        let url = parse(":50000").unwrap();
        assert_eq!(url.port(), Some(50000));
    }

    #[test]
    fn test_parse_round_trips_host_port() {
        let url = parse("replica:5432").unwrap();
        let rendered = format!("{}:{}", url.host_str().unwrap(), url.port().unwrap());
        assert_eq!(rendered, "replica:5432");
    }

    #[test]
    fn test_default_port_table() {
        assert_eq!(default_port("http"), Some(80));
        assert_eq!(default_port("https"), Some(443));
        assert_eq!(default_port("tcp"), None);
    }

    #[test]
    fn test_next_ip_increments() {
        let ip = Ipv4Addr::new(10, 0, 0, 10);
        assert_eq!(next_ip(ip), Ipv4Addr::new(10, 0, 0, 11));
    }

    #[test]
    fn test_next_ip_skips_broadcast_and_network() {
        assert_eq!(
            next_ip(Ipv4Addr::new(10, 0, 0, 254)),
            Ipv4Addr::new(10, 0, 1, 1)
        );
        assert_eq!(
            next_ip(Ipv4Addr::new(10, 0, 255, 254)),
            Ipv4Addr::new(10, 1, 0, 1)
        );
    }

    #[test]
    fn test_next_ip_never_ends_in_zero_or_255() {
        let mut ip = Ipv4Addr::new(10, 0, 0, 250);
        for _ in 0..600 {
            ip = next_ip(ip);
            let last = ip.octets()[3];
            assert_ne!(last, 0);
            assert_ne!(last, 255);
        }
    }

    #[test]
    fn test_next_ip_strictly_monotonic() {
        let ip = Ipv4Addr::new(10, 0, 0, 10);
        let first = next_ip(ip);
        let second = next_ip(first);
        assert!(u32::from(second) >= u32::from(first) + 1);
    }
}
