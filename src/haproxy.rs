//! HAProxy PROXY protocol preamble, recognized as the optional first message
//! on an inbound connection.
//!
//! Both the v1 text form and the v2 binary form are accepted. The parsed
//! source address is exposed to filters as `client_host`/`client_port`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BytesMut};

use crate::error::ProxyError;

const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";
/// A v1 line is at most 107 bytes including the trailing CRLF.
const V1_MAX_LEN: usize = 107;

/// Addresses carried by a PROXY preamble. `UNKNOWN`/`LOCAL` preambles carry
/// none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPreamble {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

#[derive(Debug)]
pub enum PreambleOutcome {
    /// The connection does not start with a PROXY preamble.
    NotProxy,
    /// Could still be a preamble; more bytes are needed.
    Incomplete,
    /// A preamble was consumed from the buffer.
    Parsed(ProxyPreamble),
}

/// Inspect the first bytes of a connection. Consumes the preamble from `src`
/// when one is present; leaves the buffer untouched otherwise.
pub fn decode_preamble(src: &mut BytesMut) -> Result<PreambleOutcome, ProxyError> {
    if src.is_empty() {
        return Ok(PreambleOutcome::Incomplete);
    }
    if starts_like(src, V2_SIGNATURE) {
        if src.len() < V2_SIGNATURE.len() {
            return Ok(PreambleOutcome::Incomplete);
        }
        return decode_v2(src);
    }
    if starts_like(src, V1_PREFIX) {
        if src.len() < V1_PREFIX.len() {
            return Ok(PreambleOutcome::Incomplete);
        }
        return decode_v1(src);
    }
    Ok(PreambleOutcome::NotProxy)
}

/// True when the buffer could still grow into `marker`.
fn starts_like(src: &BytesMut, marker: &[u8]) -> bool {
    let shared = src.len().min(marker.len());
    src[..shared] == marker[..shared]
}

fn decode_v1(src: &mut BytesMut) -> Result<PreambleOutcome, ProxyError> {
    let window = src.len().min(V1_MAX_LEN);
    let Some(newline) = src[..window].windows(2).position(|pair| pair == b"\r\n") else {
        if src.len() < V1_MAX_LEN {
            return Ok(PreambleOutcome::Incomplete);
        }
        return Err(ProxyError::MalformedFrame(
            "proxy protocol v1 line exceeds 107 bytes".to_string(),
        ));
    };
    let line = src.split_to(newline + 2);
    let line = std::str::from_utf8(&line[..newline])
        .map_err(|_| ProxyError::MalformedFrame("proxy protocol v1 line is not ascii".to_string()))?;

    let mut fields = line.split(' ');
    let _proxy = fields.next();
    match fields.next() {
        Some("UNKNOWN") => Ok(PreambleOutcome::Parsed(ProxyPreamble {
            source: None,
            destination: None,
        })),
        Some("TCP4") | Some("TCP6") => {
            let (src_ip, dst_ip, src_port, dst_port) = match (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) {
                (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
                _ => {
                    return Err(ProxyError::MalformedFrame(
                        "proxy protocol v1 line is missing address fields".to_string(),
                    ))
                }
            };
            let parse = |ip: &str, port: &str| -> Result<SocketAddr, ProxyError> {
                let ip: IpAddr = ip.parse().map_err(|_| {
                    ProxyError::MalformedFrame(format!("bad proxy protocol address {ip}"))
                })?;
                let port: u16 = port.parse().map_err(|_| {
                    ProxyError::MalformedFrame(format!("bad proxy protocol port {port}"))
                })?;
                Ok(SocketAddr::new(ip, port))
            };
            Ok(PreambleOutcome::Parsed(ProxyPreamble {
                source: Some(parse(src_ip, src_port)?),
                destination: Some(parse(dst_ip, dst_port)?),
            }))
        }
        other => Err(ProxyError::MalformedFrame(format!(
            "unknown proxy protocol family {other:?}"
        ))),
    }
}

fn decode_v2(src: &mut BytesMut) -> Result<PreambleOutcome, ProxyError> {
    if src.len() < 16 {
        return Ok(PreambleOutcome::Incomplete);
    }
    let ver_cmd = src[12];
    let family = src[13];
    let addr_len = u16::from_be_bytes([src[14], src[15]]) as usize;
    if src.len() < 16 + addr_len {
        return Ok(PreambleOutcome::Incomplete);
    }
    if ver_cmd & 0xf0 != 0x20 {
        return Err(ProxyError::MalformedFrame(format!(
            "unsupported proxy protocol v2 version byte {ver_cmd:#04x}"
        )));
    }

    src.advance(16);
    let mut addresses = src.split_to(addr_len);

    // LOCAL command or an address family we do not interpret: health checks
    // and such. The payload is still consumed.
    let is_proxy_cmd = ver_cmd & 0x0f == 0x01;
    let preamble = match (is_proxy_cmd, family) {
        (true, 0x11) if addr_len >= 12 => {
            let src_ip = Ipv4Addr::from(addresses.get_u32());
            let dst_ip = Ipv4Addr::from(addresses.get_u32());
            let src_port = addresses.get_u16();
            let dst_port = addresses.get_u16();
            ProxyPreamble {
                source: Some(SocketAddr::new(IpAddr::V4(src_ip), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
            }
        }
        (true, 0x21) if addr_len >= 36 => {
            let mut octets = [0u8; 16];
            addresses.copy_to_slice(&mut octets);
            let src_ip = Ipv6Addr::from(octets);
            addresses.copy_to_slice(&mut octets);
            let dst_ip = Ipv6Addr::from(octets);
            let src_port = addresses.get_u16();
            let dst_port = addresses.get_u16();
            ProxyPreamble {
                source: Some(SocketAddr::new(IpAddr::V6(src_ip), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V6(dst_ip), dst_port)),
            }
        }
        _ => ProxyPreamble {
            source: None,
            destination: None,
        },
    };
    Ok(PreambleOutcome::Parsed(preamble))
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn parses_a_v1_tcp4_line() {
        let mut buf = BytesMut::from(&b"PROXY TCP4 192.168.0.1 10.0.0.2 56324 9092\r\n\x00\x00\x00\x0a"[..]);
        match decode_preamble(&mut buf).unwrap() {
            PreambleOutcome::Parsed(preamble) => {
                assert_eq!(
                    preamble.source,
                    Some("192.168.0.1:56324".parse().unwrap())
                );
                assert_eq!(preamble.destination, Some("10.0.0.2:9092".parse().unwrap()));
            }
            other => panic!("expected parsed preamble, got {other:?}"),
        }
        // The Kafka bytes after the preamble stay in the buffer.
        assert_eq!(&buf[..], b"\x00\x00\x00\x0a");
    }

    #[test]
    fn parses_a_v1_unknown_line() {
        let mut buf = BytesMut::from(&b"PROXY UNKNOWN\r\n"[..]);
        match decode_preamble(&mut buf).unwrap() {
            PreambleOutcome::Parsed(preamble) => {
                assert_eq!(preamble.source, None);
            }
            other => panic!("expected parsed preamble, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_v2_tcp4_preamble() {
        let mut buf = BytesMut::new();
        buf.put_slice(V2_SIGNATURE);
        buf.put_u8(0x21); // version 2, PROXY
        buf.put_u8(0x11); // TCP over IPv4
        buf.put_u16(12);
        buf.put_slice(&[192, 168, 0, 1]);
        buf.put_slice(&[10, 0, 0, 2]);
        buf.put_u16(56324);
        buf.put_u16(9092);
        match decode_preamble(&mut buf).unwrap() {
            PreambleOutcome::Parsed(preamble) => {
                assert_eq!(
                    preamble.source,
                    Some("192.168.0.1:56324".parse().unwrap())
                );
            }
            other => panic!("expected parsed preamble, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn a_partial_prefix_awaits_more_bytes() {
        let mut buf = BytesMut::from(&b"PRO"[..]);
        assert!(matches!(
            decode_preamble(&mut buf).unwrap(),
            PreambleOutcome::Incomplete
        ));
        assert_eq!(&buf[..], b"PRO");
    }

    #[test]
    fn a_kafka_frame_is_not_a_preamble() {
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x2a\x00\x03"[..]);
        assert!(matches!(
            decode_preamble(&mut buf).unwrap(),
            PreambleOutcome::NotProxy
        ));
        assert_eq!(buf.len(), 6);
    }
}
