use bytes::Bytes;
use kafka_protocol::protocol::StrBytes;

use crate::error::ProxyError;

/// Parse a `host:port` pair, as found in bootstrap-server strings.
pub fn parse_host_port(addr: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::MalformedFrame(format!("no port in address {addr}")))?;
    let port = port
        .parse()
        .map_err(|_| ProxyError::MalformedFrame(format!("invalid port in address {addr}")))?;
    Ok((host.to_string(), port))
}

/// Build a `StrBytes` from an owned string.
pub fn str_bytes(s: &str) -> StrBytes {
    // Valid utf8 by construction; the api is lacking a direct conversion.
    unsafe { StrBytes::from_utf8_unchecked(Bytes::copy_from_slice(s.as_bytes())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let (host, port) = parse_host_port("broker-3.example.com:9092").unwrap();
        assert_eq!(host, "broker-3.example.com");
        assert_eq!(port, 9092);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_host_port("localhost").is_err());
        assert!(parse_host_port("localhost:kafka").is_err());
    }
}
