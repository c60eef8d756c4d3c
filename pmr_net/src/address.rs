//! Socket address parsing and resolution.

use crate::error::{Error, Result};
use std::net::{SocketAddr, ToSocketAddrs};

/// A parsed `host:port` style address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SocketAddress {
    /// Host or IP literal. `None` means "any interface".
    pub ip: Option<String>,
    /// Port number. `-1` means the wildcard port (`:*`).
    pub port: i32,
    /// Whether an `https` scheme was present.
    pub secure: bool,
}

/// Whether an address literal is IPv6 (more than one colon, ignoring any
/// bracketed port suffix).
#[must_use]
pub fn is_ipv6(ip: &str) -> bool {
    ip.matches(':').count() > 1
}

/// Parses addresses of the forms
/// `ip:port`, `ip`, `port`, `[ipv6]:port`, `ipv6`, with an optional
/// `scheme://` prefix and `*` wildcards for host and port.
///
/// # Errors
///
/// Returns [`Error::BadArgs`] when a port is present but not numeric.
pub fn parse_socket_address(address: &str, default_port: i32) -> Result<SocketAddress> {
    let default_port = if default_port < 0 { 80 } else { default_port };
    let secure = address.starts_with("https");

    // Cut at the first space and strip any scheme
    let mut rest = address.split(' ').next().unwrap_or("");
    if let Some(position) = rest.find("://") {
        rest = &rest[position + 3..];
    }

    let parse_port = |text: &str| -> Result<i32> {
        if text == "*" {
            return Ok(-1);
        }
        text.parse::<i32>()
            .map_err(|_| Error::BadArgs(format!("invalid port in address: {address}")))
    };

    if is_ipv6(rest) {
        // If a port is present it follows a closing bracket
        if let Some(bracket) = rest.find(']') {
            let after = &rest[bracket + 1..];
            let ip = rest[1..bracket].to_string();
            let ip = if ip.is_empty() { None } else { Some(ip) };
            let port = match after.strip_prefix(':') {
                Some(port_text) => parse_port(port_text)?,
                None => default_port,
            };
            Ok(SocketAddress { ip, port, secure })
        } else {
            // Bare IPv6 literal, no port
            Ok(SocketAddress {
                ip: Some(rest.to_string()),
                port: default_port,
                secure,
            })
        }
    } else if let Some((host, port_text)) = rest.split_once(':') {
        let port = parse_port(port_text)?;
        let ip = if host.is_empty() || host == "*" {
            None
        } else {
            Some(host.to_string())
        };
        Ok(SocketAddress { ip, port, secure })
    } else if rest.contains('.') || rest.chars().next().is_some_and(|c| !c.is_ascii_digit()) {
        // Host name or dotted quad, no port
        let ip = if rest.is_empty() || rest == "*" {
            None
        } else {
            Some(rest.to_string())
        };
        Ok(SocketAddress {
            ip,
            port: default_port,
            secure,
        })
    } else if rest.is_empty() {
        Ok(SocketAddress {
            ip: None,
            port: default_port,
            secure,
        })
    } else {
        // Bare digits are a port
        Ok(SocketAddress {
            ip: None,
            port: parse_port(rest)?,
            secure,
        })
    }
}

/// Resolves a host/port to a socket address, preferring IPv4 results.
///
/// # Errors
///
/// [`Error::CantFind`] when resolution yields nothing.
pub(crate) fn resolve(ip: Option<&str>, port: u16) -> Result<SocketAddr> {
    let host = ip.unwrap_or("0.0.0.0");
    let mut first_v6 = None;
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|error| Error::CantFind(format!("cannot resolve {host}:{port}: {error}")))?;
    for address in addresses {
        if address.is_ipv4() {
            return Ok(address);
        }
        first_v6.get_or_insert(address);
    }
    first_v6.ok_or_else(|| Error::CantFind(format!("no addresses for {host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_ipv6_with_port() {
        let parsed = parse_socket_address("[::1]:8080", 80).expect("parse");
        assert_eq!(parsed.ip.as_deref(), Some("::1"));
        assert_eq!(parsed.port, 8080);
        assert!(!parsed.secure);
    }

    #[test]
    fn bare_host_uses_default_port() {
        let parsed = parse_socket_address("example.com", 80).expect("parse");
        assert_eq!(parsed.ip.as_deref(), Some("example.com"));
        assert_eq!(parsed.port, 80);
    }

    #[test]
    fn scheme_and_wildcard_port() {
        let parsed = parse_socket_address("https://x:*", 80).expect("parse");
        assert_eq!(parsed.ip.as_deref(), Some("x"));
        assert_eq!(parsed.port, -1);
        assert!(parsed.secure);
    }

    #[test]
    fn bare_port() {
        let parsed = parse_socket_address("4100", 80).expect("parse");
        assert_eq!(parsed.ip, None);
        assert_eq!(parsed.port, 4100);
    }

    #[test]
    fn wildcard_host() {
        let parsed = parse_socket_address("*:7000", 80).expect("parse");
        assert_eq!(parsed.ip, None);
        assert_eq!(parsed.port, 7000);
    }

    #[test]
    fn ipv4_with_port() {
        let parsed = parse_socket_address("127.0.0.1:4100", 80).expect("parse");
        assert_eq!(parsed.ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(parsed.port, 4100);
    }

    #[test]
    fn bare_ipv6() {
        let parsed = parse_socket_address("fe80::1", 443).expect("parse");
        assert_eq!(parsed.ip.as_deref(), Some("fe80::1"));
        assert_eq!(parsed.port, 443);
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(parse_socket_address("host:not-a-port", 80).is_err());
    }
}
