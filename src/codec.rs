//! Frame-aligned codecs for both sides of the proxy.
//!
//! The client-facing side decodes requests and encodes responses; the
//! broker-facing side encodes requests (rewriting correlation ids) and
//! decodes responses (pairing them with the correlation table). All four are
//! layered over a `LengthDelimitedCodec` configured so the 4-byte length
//! prefix stays part of the frame, which lets opaque frames pass through
//! byte-for-byte.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind, ResponseHeader};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::{Decodable, Encodable};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::api;
use crate::correlation::{CorrelationEntry, CorrelationMap};
use crate::error::ProxyError;
use crate::frame::{
    RequestFrame, ResponseFrame, REQUEST_CORRELATION_OFFSET, RESPONSE_CORRELATION_OFFSET,
};
use crate::haproxy::{self, PreambleOutcome, ProxyPreamble};

/// Default upper bound on a single frame, length prefix excluded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Runtime policy deciding whether a given api key is decoded or passed
/// through opaque.
///
/// Installed once per connection, before the outbound side goes active, and
/// read-only afterwards.
#[derive(Debug)]
pub enum DecodePredicate {
    /// Pre-install default: decode only `ApiVersions`, which the frontend
    /// intercepts itself. Everything else stays opaque.
    Bootstrap,
    /// Decode exactly what the filter chain subscribed to.
    Subscribed {
        requests: HashSet<i16>,
        responses: HashSet<i16>,
    },
    /// Force full decode until the SASL handshake completes, so the proxy can
    /// observe authentication; defer to `inner` afterwards.
    SaslAware {
        inner: Box<DecodePredicate>,
        handshake_done: Arc<AtomicBool>,
    },
}

impl DecodePredicate {
    pub fn wants_request(&self, api_key: i16) -> bool {
        match self {
            DecodePredicate::Bootstrap => api_key == ApiKey::ApiVersionsKey as i16,
            DecodePredicate::Subscribed { requests, .. } => requests.contains(&api_key),
            DecodePredicate::SaslAware {
                inner,
                handshake_done,
            } => {
                if !handshake_done.load(Ordering::Acquire) && api::is_supported(api_key) {
                    return true;
                }
                inner.wants_request(api_key)
            }
        }
    }

    pub fn wants_response(&self, api_key: i16) -> bool {
        match self {
            DecodePredicate::Bootstrap => false,
            DecodePredicate::Subscribed { responses, .. } => responses.contains(&api_key),
            DecodePredicate::SaslAware {
                inner,
                handshake_done,
            } => {
                if !handshake_done.load(Ordering::Acquire) && api::is_supported(api_key) {
                    return true;
                }
                inner.wants_response(api_key)
            }
        }
    }
}

/// Shared handle to a connection's predicate; replaced exactly once, when the
/// filter chain is fixed.
pub type SharedPredicate = Arc<RwLock<DecodePredicate>>;

fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .num_skip(0) // Do not strip the frame header
        .length_adjustment(4)
        .new_codec()
}

/// Pull one length-delimited frame, mapping oversize/negative lengths to
/// `MalformedFrame`.
fn decode_length(
    length: &mut LengthDelimitedCodec,
    src: &mut BytesMut,
) -> Result<Option<BytesMut>, ProxyError> {
    match length.decode(src) {
        Ok(frame) => Ok(frame),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            Err(ProxyError::MalformedFrame(err.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// What the client-facing decoder can produce.
#[derive(Debug)]
pub enum DownstreamItem {
    Preamble(ProxyPreamble),
    Request(RequestFrame),
}

/// Client-to-proxy request decoder. Lazily decodes per the predicate; also
/// recognizes the optional HAProxy preamble at stream start.
pub struct ClientRequestDecoder {
    length: LengthDelimitedCodec,
    predicate: SharedPredicate,
    expect_preamble: bool,
}

impl ClientRequestDecoder {
    pub fn new(predicate: SharedPredicate, max_frame_bytes: usize) -> Self {
        Self {
            length: frame_codec(max_frame_bytes),
            predicate,
            expect_preamble: true,
        }
    }
}

impl Decoder for ClientRequestDecoder {
    type Item = DownstreamItem;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.expect_preamble {
            match haproxy::decode_preamble(src)? {
                PreambleOutcome::Incomplete => return Ok(None),
                PreambleOutcome::NotProxy => self.expect_preamble = false,
                PreambleOutcome::Parsed(preamble) => {
                    self.expect_preamble = false;
                    return Ok(Some(DownstreamItem::Preamble(preamble)));
                }
            }
        }
        let Some(frame) = decode_length(&mut self.length, src)? else {
            return Ok(None);
        };
        let predicate = self.predicate.read().unwrap();
        decode_request_frame(frame, &predicate).map(|frame| Some(DownstreamItem::Request(frame)))
    }
}

/// Decode one request frame (length prefix included) under `predicate`.
///
/// Also used to upgrade the buffered pre-connect request once the real
/// predicate is installed.
pub fn decode_request_frame(
    mut frame: BytesMut,
    predicate: &DecodePredicate,
) -> Result<RequestFrame, ProxyError> {
    if frame.len() < 12 {
        return Err(ProxyError::MalformedFrame(format!(
            "request frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let api_key = frame.peek_bytes(4..6).get_i16();
    let api_version = frame.peek_bytes(6..8).get_i16();
    let correlation_id = frame.peek_bytes(8..12).get_i32();

    if predicate.wants_request(api_key) {
        let mut buf = frame;
        buf.advance(4); // skip length
        let header_version = api::request_header_version(api_key, api_version)?;
        let header = RequestHeader::decode(&mut buf, header_version)?;
        let body = api::decode_request_body(api_key, &mut buf, api_version)?;
        let has_response = match &body {
            RequestKind::ProduceRequest(produce) => produce.acks != 0,
            _ => true,
        };
        return Ok(RequestFrame::Decoded {
            header,
            body,
            has_response,
            promise: None,
        });
    }

    let has_response = if api_key == ApiKey::ProduceKey as i16 {
        produce_has_response(&frame, api_version)?
    } else {
        true
    };
    Ok(RequestFrame::Opaque {
        api_key,
        api_version,
        correlation_id,
        has_response,
        frame,
    })
}

/// Re-decode an opaque frame if the (newly installed) predicate asks for it.
pub fn upgrade_request_frame(
    frame: RequestFrame,
    predicate: &DecodePredicate,
) -> Result<RequestFrame, ProxyError> {
    match frame {
        RequestFrame::Opaque { frame, .. } => decode_request_frame(frame, predicate),
        decoded => Ok(decoded),
    }
}

/// Proxy-to-client response encoder. Correlation ids are already the
/// downstream ones by the time frames get here.
pub struct ClientResponseEncoder;

impl Encoder<ResponseFrame> for ClientResponseEncoder {
    type Error = ProxyError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ResponseFrame::Opaque { frame, .. } => dst.put_slice(&frame),
            ResponseFrame::Decoded {
                api_key,
                api_version,
                header,
                body,
            } => {
                let header_version = api::response_header_version(api_key, api_version)?;
                let mut bytes = BytesMut::new();
                header.encode(&mut bytes, header_version)?;
                api::encode_response_body(&body, &mut bytes, api_version)?;
                dst.put_u32(bytes.len() as u32);
                dst.put_slice(&bytes);
            }
        }
        Ok(())
    }
}

/// Proxy-to-broker request encoder. Allocates the upstream correlation id and
/// registers the in-flight entry.
pub struct BrokerRequestEncoder {
    correlation: Arc<CorrelationMap>,
    predicate: SharedPredicate,
}

impl BrokerRequestEncoder {
    pub fn new(correlation: Arc<CorrelationMap>, predicate: SharedPredicate) -> Self {
        Self {
            correlation,
            predicate,
        }
    }
}

impl Encoder<RequestFrame> for BrokerRequestEncoder {
    type Error = ProxyError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RequestFrame::Opaque {
                api_key,
                api_version,
                correlation_id,
                has_response,
                mut frame,
            } => {
                let entry = CorrelationEntry {
                    downstream_id: correlation_id,
                    api_key,
                    api_version,
                    decode_response: self.predicate.read().unwrap().wants_response(api_key),
                    promise: None,
                };
                let upstream_id = self.correlation.assign(has_response, entry);
                frame[REQUEST_CORRELATION_OFFSET..REQUEST_CORRELATION_OFFSET + 4]
                    .copy_from_slice(&upstream_id.to_be_bytes());
                dst.put_slice(&frame);
            }
            RequestFrame::Decoded {
                mut header,
                body,
                has_response,
                promise,
            } => {
                let api_key = header.request_api_key;
                let api_version = header.request_api_version;
                // Filter-solicited responses are always decoded so the
                // promise can resolve with a structured body.
                let decode_response =
                    promise.is_some() || self.predicate.read().unwrap().wants_response(api_key);
                let entry = CorrelationEntry {
                    downstream_id: header.correlation_id,
                    api_key,
                    api_version,
                    decode_response,
                    promise,
                };
                let upstream_id = self.correlation.assign(has_response, entry);
                header.correlation_id = upstream_id;
                let mut bytes = BytesMut::new();
                header.encode(&mut bytes, api::request_header_version(api_key, api_version)?)?;
                api::encode_request_body(&body, &mut bytes, api_version)?;
                dst.put_u32(bytes.len() as u32);
                dst.put_slice(&bytes);
            }
        }
        Ok(())
    }
}

/// Broker-to-proxy response decoder, driven by the correlation table.
///
/// Responses to filter-solicited requests resolve their promise right here
/// and are never emitted downstream.
pub struct BrokerResponseDecoder {
    length: LengthDelimitedCodec,
    correlation: Arc<CorrelationMap>,
}

impl BrokerResponseDecoder {
    pub fn new(correlation: Arc<CorrelationMap>, max_frame_bytes: usize) -> Self {
        Self {
            length: frame_codec(max_frame_bytes),
            correlation,
        }
    }
}

impl Decoder for BrokerResponseDecoder {
    type Item = ResponseFrame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(mut frame) = decode_length(&mut self.length, src)? else {
                return Ok(None);
            };
            if frame.len() < 8 {
                return Err(ProxyError::MalformedFrame(format!(
                    "response frame of {} bytes is shorter than its header",
                    frame.len()
                )));
            }
            let upstream_id = frame.peek_bytes(4..8).get_i32();
            let entry = self.correlation.consume(upstream_id)?;

            if let Some(promise) = entry.promise {
                let mut buf = frame;
                buf.advance(4);
                let header_version =
                    api::response_header_version(entry.api_key, entry.api_version)?;
                let _ = ResponseHeader::decode(&mut buf, header_version)?;
                let body = api::decode_response_body(entry.api_key, &mut buf, entry.api_version)?;
                let _ = promise.send(Ok(body));
                continue;
            }

            if entry.decode_response {
                let mut buf = frame;
                buf.advance(4);
                let header_version =
                    api::response_header_version(entry.api_key, entry.api_version)?;
                let mut header = ResponseHeader::decode(&mut buf, header_version)?;
                let body = api::decode_response_body(entry.api_key, &mut buf, entry.api_version)?;
                header.correlation_id = entry.downstream_id;
                return Ok(Some(ResponseFrame::Decoded {
                    api_key: entry.api_key,
                    api_version: entry.api_version,
                    header,
                    body,
                }));
            }

            frame[RESPONSE_CORRELATION_OFFSET..RESPONSE_CORRELATION_OFFSET + 4]
                .copy_from_slice(&entry.downstream_id.to_be_bytes());
            return Ok(Some(ResponseFrame::Opaque {
                correlation_id: entry.downstream_id,
                frame,
            }));
        }
    }
}

/// Decide `has_response` for a Produce request without decoding its body:
/// walk past the header and the optional transactional id to the acks field.
fn produce_has_response(frame: &[u8], api_version: i16) -> Result<bool, ProxyError> {
    let header_version = api::request_header_version(ApiKey::ProduceKey as i16, api_version)?;
    let mut cursor = Cursor::new(frame);
    cursor.skip(4 + 2 + 2 + 4)?; // length, api key, api version, correlation id
    if header_version >= 1 {
        let client_id_len = cursor.get_i16()?;
        if client_id_len > 0 {
            cursor.skip(client_id_len as usize)?;
        }
    }
    if header_version >= 2 {
        cursor.skip_tagged_fields()?;
    }
    if api_version >= 9 {
        // Compact nullable string: unsigned varint of length + 1.
        let len = cursor.get_unsigned_varint()?;
        if len > 0 {
            cursor.skip(len as usize - 1)?;
        }
    } else if api_version >= 3 {
        let len = cursor.get_i16()?;
        if len > 0 {
            cursor.skip(len as usize)?;
        }
    }
    Ok(cursor.get_i16()? != 0)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn skip(&mut self, n: usize) -> Result<(), ProxyError> {
        if self.pos + n > self.buf.len() {
            return Err(ProxyError::MalformedFrame(
                "produce request truncated before acks".to_string(),
            ));
        }
        self.pos += n;
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8, ProxyError> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| {
            ProxyError::MalformedFrame("produce request truncated before acks".to_string())
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn get_i16(&mut self) -> Result<i16, ProxyError> {
        let hi = self.get_u8()?;
        let lo = self.get_u8()?;
        Ok(i16::from_be_bytes([hi, lo]))
    }

    fn get_unsigned_varint(&mut self) -> Result<u32, ProxyError> {
        let mut value = 0u32;
        for shift in (0..32).step_by(7) {
            let byte = self.get_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProxyError::MalformedFrame(
            "unsigned varint is longer than 5 bytes".to_string(),
        ))
    }

    fn skip_tagged_fields(&mut self) -> Result<(), ProxyError> {
        let count = self.get_unsigned_varint()?;
        for _ in 0..count {
            let _tag = self.get_unsigned_varint()?;
            let size = self.get_unsigned_varint()?;
            self.skip(size as usize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kafka_protocol::messages::{MetadataRequest, MetadataResponse, RequestHeader, ResponseKind};
    use kafka_protocol::protocol::HeaderVersion;
    use rstest::rstest;

    use crate::util::str_bytes;

    use super::*;

    fn shared(predicate: DecodePredicate) -> SharedPredicate {
        Arc::new(RwLock::new(predicate))
    }

    fn subscribed(requests: &[i16], responses: &[i16]) -> DecodePredicate {
        DecodePredicate::Subscribed {
            requests: requests.iter().copied().collect(),
            responses: responses.iter().copied().collect(),
        }
    }

    /// Encode a metadata request frame the way a client would.
    fn metadata_request_bytes(correlation_id: i32, api_version: i16) -> BytesMut {
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::MetadataKey as i16;
        header.request_api_version = api_version;
        header.correlation_id = correlation_id;
        header.client_id = Some(str_bytes("portico-test"));
        let mut bytes = BytesMut::new();
        header
            .encode(
                &mut bytes,
                MetadataRequest::header_version(api_version),
            )
            .unwrap();
        MetadataRequest::default().encode(&mut bytes, api_version).unwrap();
        let mut framed = BytesMut::new();
        framed.put_u32(bytes.len() as u32);
        framed.put_slice(&bytes);
        framed
    }

    /// Produce request with just enough body for the acks peek.
    fn produce_request_bytes(api_version: i16, acks: i16) -> BytesMut {
        let header_version =
            api::request_header_version(ApiKey::ProduceKey as i16, api_version).unwrap();
        let mut bytes = BytesMut::new();
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::ProduceKey as i16;
        header.request_api_version = api_version;
        header.correlation_id = 45;
        header.client_id = Some(str_bytes("producer-1"));
        header.encode(&mut bytes, header_version).unwrap();
        if api_version >= 9 {
            bytes.put_u8(0); // null transactional id, compact
        } else if api_version >= 3 {
            bytes.put_i16(-1); // null transactional id
        }
        bytes.put_i16(acks);
        bytes.put_i32(30_000); // timeout
        if api_version >= 9 {
            bytes.put_u8(1); // empty compact topic array
            bytes.put_u8(0); // no tagged fields
        } else {
            bytes.put_i32(0); // empty topic array
        }
        let mut framed = BytesMut::new();
        framed.put_u32(bytes.len() as u32);
        framed.put_slice(&bytes);
        framed
    }

    #[test]
    fn undecoded_requests_pass_through_opaque() {
        let mut decoder = ClientRequestDecoder::new(shared(DecodePredicate::Bootstrap), 1024);
        let mut src = metadata_request_bytes(99, 5);
        let original = src.clone();
        match decoder.decode(&mut src).unwrap() {
            Some(DownstreamItem::Request(RequestFrame::Opaque {
                api_key,
                api_version,
                correlation_id,
                has_response,
                frame,
            })) => {
                assert_eq!(api_key, ApiKey::MetadataKey as i16);
                assert_eq!(api_version, 5);
                assert_eq!(correlation_id, 99);
                assert!(has_response);
                assert_eq!(frame, original);
            }
            other => panic!("expected an opaque request, got {other:?}"),
        }
    }

    #[test]
    fn subscribed_requests_are_decoded() {
        let predicate = shared(subscribed(&[ApiKey::MetadataKey as i16], &[]));
        let mut decoder = ClientRequestDecoder::new(predicate, 1024);
        let mut src = metadata_request_bytes(7, 5);
        match decoder.decode(&mut src).unwrap() {
            Some(DownstreamItem::Request(RequestFrame::Decoded { header, body, .. })) => {
                assert_eq!(header.correlation_id, 7);
                assert!(matches!(body, RequestKind::MetadataRequest(_)));
            }
            other => panic!("expected a decoded request, got {other:?}"),
        }
    }

    #[test]
    fn partial_frames_await_more_input() {
        let mut decoder = ClientRequestDecoder::new(shared(DecodePredicate::Bootstrap), 1024);
        let full = metadata_request_bytes(1, 5);
        let mut src = BytesMut::from(&full[..full.len() - 3]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.put_slice(&full[full.len() - 3..]);
        assert!(decoder.decode(&mut src).unwrap().is_some());
    }

    #[test]
    fn oversized_frames_are_malformed() {
        let mut decoder = ClientRequestDecoder::new(shared(DecodePredicate::Bootstrap), 64);
        let mut src = BytesMut::new();
        src.put_u32(65_536);
        src.put_slice(&[0u8; 16]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(ProxyError::MalformedFrame(_))
        ));
    }

    #[rstest]
    #[case(3, 0, false)]
    #[case(3, 1, true)]
    #[case(3, -1, true)]
    #[case(9, 0, false)]
    #[case(9, 1, true)]
    fn produce_acks_decides_has_response(
        #[case] api_version: i16,
        #[case] acks: i16,
        #[case] expected: bool,
    ) {
        let frame = produce_request_bytes(api_version, acks);
        assert_eq!(produce_has_response(&frame, api_version).unwrap(), expected);
    }

    #[test]
    fn opaque_round_trip_is_byte_exact_after_unrewriting() {
        let correlation = Arc::new(CorrelationMap::new());
        let mut encoder = BrokerRequestEncoder::new(
            Arc::clone(&correlation),
            shared(DecodePredicate::Bootstrap),
        );
        let original = metadata_request_bytes(42, 5);
        let mut decoder = ClientRequestDecoder::new(shared(DecodePredicate::Bootstrap), 1024);
        let mut src = original.clone();
        let Some(DownstreamItem::Request(frame)) = decoder.decode(&mut src).unwrap() else {
            panic!("frame expected");
        };
        let mut wire = BytesMut::new();
        encoder.encode(frame, &mut wire).unwrap();
        // Undo the correlation rewrite; everything else must be untouched.
        assert_eq!(
            wire.peek_bytes(REQUEST_CORRELATION_OFFSET..REQUEST_CORRELATION_OFFSET + 4).get_i32(),
            0
        );
        wire[REQUEST_CORRELATION_OFFSET..REQUEST_CORRELATION_OFFSET + 4]
            .copy_from_slice(&42i32.to_be_bytes());
        assert_eq!(wire, original);
        assert_eq!(correlation.in_flight(), 1);
    }

    #[test]
    fn responses_are_paired_and_rewritten() {
        let correlation = Arc::new(CorrelationMap::new());
        let upstream_id = correlation.assign(
            true,
            CorrelationEntry {
                downstream_id: 42,
                api_key: ApiKey::MetadataKey as i16,
                api_version: 5,
                decode_response: true,
                promise: None,
            },
        );
        let mut decoder = BrokerResponseDecoder::new(Arc::clone(&correlation), 1024);

        let mut bytes = BytesMut::new();
        let mut header = ResponseHeader::default();
        header.correlation_id = upstream_id;
        header
            .encode(&mut bytes, MetadataResponse::header_version(5))
            .unwrap();
        MetadataResponse::default().encode(&mut bytes, 5).unwrap();
        let mut src = BytesMut::new();
        src.put_u32(bytes.len() as u32);
        src.put_slice(&bytes);

        match decoder.decode(&mut src).unwrap() {
            Some(ResponseFrame::Decoded { header, body, .. }) => {
                assert_eq!(header.correlation_id, 42);
                assert!(matches!(body, ResponseKind::MetadataResponse(_)));
            }
            other => panic!("expected a decoded response, got {other:?}"),
        }
        assert_eq!(correlation.in_flight(), 0);
    }

    #[test]
    fn unknown_correlation_fails_the_decode() {
        let correlation = Arc::new(CorrelationMap::new());
        let mut decoder = BrokerResponseDecoder::new(correlation, 1024);
        let mut src = BytesMut::new();
        src.put_u32(8);
        src.put_i32(12345); // correlation id nothing is waiting for
        src.put_i32(0);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(ProxyError::UnknownCorrelation(12345))
        ));
    }

    #[test]
    fn promised_responses_resolve_out_of_band() {
        let correlation = Arc::new(CorrelationMap::new());
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let upstream_id = correlation.assign(
            true,
            CorrelationEntry {
                downstream_id: 0,
                api_key: ApiKey::MetadataKey as i16,
                api_version: 5,
                decode_response: true,
                promise: Some(tx),
            },
        );
        let mut decoder = BrokerResponseDecoder::new(Arc::clone(&correlation), 1024);

        let mut bytes = BytesMut::new();
        let mut header = ResponseHeader::default();
        header.correlation_id = upstream_id;
        header
            .encode(&mut bytes, MetadataResponse::header_version(5))
            .unwrap();
        MetadataResponse::default().encode(&mut bytes, 5).unwrap();
        let mut src = BytesMut::new();
        src.put_u32(bytes.len() as u32);
        src.put_slice(&bytes);

        // Nothing is emitted downstream; the promise gets the decoded body.
        assert!(decoder.decode(&mut src).unwrap().is_none());
        match rx.try_recv() {
            Ok(Ok(ResponseKind::MetadataResponse(_))) => {}
            other => panic!("expected resolved metadata promise, got {other:?}"),
        }
    }
}
