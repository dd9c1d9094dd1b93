//! HTTP utility functions

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, VIA};
use hyper::http::uri::Authority;
use tracing::debug;

/// Headers that only describe a single transport hop
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is a hop-by-hop header
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name.trim()))
}

/// Remove hop-by-hop headers, including any header named by a `Connection` token.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(&name);
    }

    let mut skipped = 0;
    for name in HOP_BY_HOP_HEADERS {
        if headers.remove(name).is_some() {
            skipped += 1;
        }
    }
    if skipped > 0 {
        debug!("Stripped {} hop-by-hop header(s)", skipped);
    }
}

/// Append this proxy to the `Via` chain.
pub fn append_via(headers: &mut HeaderMap, minor_version: u8, pseudonym: &str) {
    let entry = format!("1.{} {}", minor_version, pseudonym);
    if let Ok(value) = HeaderValue::from_str(&entry) {
        headers.append(VIA, value);
    }
}

/// Parse host and port from a CONNECT request-target.
///
/// The port is mandatory and must be a non-zero TCP port. IPv6 literals keep
/// their brackets stripped in the returned host.
pub fn parse_connect_target(target: &str) -> Result<(String, u16), String> {
    let authority: Authority = target
        .parse()
        .map_err(|_| format!("Invalid CONNECT target format: {}", target))?;

    if authority.as_str().contains('@') {
        return Err(format!("CONNECT target must not carry userinfo: {}", target));
    }

    let port = match authority.port() {
        Some(port) => port
            .as_str()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| format!("Invalid CONNECT port in {}", target))?,
        None => return Err(format!("CONNECT target lacks a port: {}", target)),
    };

    let host = unbracket(authority.host());
    if host.is_empty() {
        return Err(format!("CONNECT target lacks a host: {}", target));
    }

    Ok((host.to_string(), port))
}

/// Strip the brackets around an IPv6 literal host.
pub fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        for name in ["Connection", "keep-alive", "TE", "Trailers", "Transfer-Encoding", "Upgrade"] {
            assert!(is_hop_by_hop_header(name), "{} should be hop-by-hop", name);
        }
        assert!(is_hop_by_hop_header("Proxy-Authorization"));
        assert!(!is_hop_by_hop_header("content-length"));
        assert!(!is_hop_by_hop_header("host"));
    }

    #[test]
    fn test_strip_removes_connection_nominated_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Session-Hint"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic dTpw"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_append_via_keeps_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(VIA, HeaderValue::from_static("1.1 edge"));
        append_via(&mut headers, 1, "httproxy");

        let chain: Vec<_> = headers.get_all(VIA).iter().collect();
        assert_eq!(chain, vec!["1.1 edge", "1.1 httproxy"]);
    }

    #[test]
    fn test_parse_connect_target() {
        assert_eq!(
            parse_connect_target("origin.test:443"),
            Ok(("origin.test".to_string(), 443))
        );
        assert_eq!(parse_connect_target("[::1]:8443"), Ok(("::1".to_string(), 8443)));
        assert!(parse_connect_target("origin.test").is_err());
        assert!(parse_connect_target("origin.test:0").is_err());
        assert!(parse_connect_target("origin.test:70000").is_err());
        assert!(parse_connect_target("origin.test:https").is_err());
        assert!(parse_connect_target("user@origin.test:443").is_err());
    }
}
