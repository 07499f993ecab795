//! Wire frames, either opaque byte spans or fully decoded messages.
//!
//! Opaque frames keep the 4-byte length prefix so they can be forwarded
//! without re-encoding; only the correlation id field is ever patched in
//! place. Decoded frames are re-encoded from their schema types, which
//! round-trips unknown tagged fields untouched.

use bytes::BytesMut;
use kafka_protocol::messages::{RequestHeader, RequestKind, ResponseHeader, ResponseKind};
use tokio::sync::oneshot;

use crate::error::ProxyError;

/// Completion slot for a response solicited by a filter rather than a client.
pub type ResponsePromise = oneshot::Sender<Result<ResponseKind, ProxyError>>;

/// Byte offset of the correlation id in a request frame (after the length
/// prefix, api key and api version).
pub const REQUEST_CORRELATION_OFFSET: usize = 8;
/// Byte offset of the correlation id in a response frame.
pub const RESPONSE_CORRELATION_OFFSET: usize = 4;

/// One client-to-broker message.
#[derive(Debug)]
pub enum RequestFrame {
    Opaque {
        api_key: i16,
        api_version: i16,
        correlation_id: i32,
        has_response: bool,
        /// The whole frame, length prefix included.
        frame: BytesMut,
    },
    Decoded {
        header: RequestHeader,
        body: RequestKind,
        has_response: bool,
        /// Present when the request was issued by a filter; the matching
        /// response resolves the promise instead of reaching the client.
        promise: Option<ResponsePromise>,
    },
}

impl RequestFrame {
    pub fn api_key(&self) -> i16 {
        match self {
            RequestFrame::Opaque { api_key, .. } => *api_key,
            RequestFrame::Decoded { header, .. } => header.request_api_key,
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            RequestFrame::Opaque { api_version, .. } => *api_version,
            RequestFrame::Decoded { header, .. } => header.request_api_version,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            RequestFrame::Opaque { correlation_id, .. } => *correlation_id,
            RequestFrame::Decoded { header, .. } => header.correlation_id,
        }
    }

    pub fn has_response(&self) -> bool {
        match self {
            RequestFrame::Opaque { has_response, .. } => *has_response,
            RequestFrame::Decoded { has_response, .. } => *has_response,
        }
    }
}

/// One broker-to-client message. By the time a frame leaves the response
/// decoder its correlation id has already been rewritten back to the
/// downstream one.
#[derive(Debug)]
pub enum ResponseFrame {
    Opaque {
        correlation_id: i32,
        frame: BytesMut,
    },
    Decoded {
        api_key: i16,
        api_version: i16,
        header: ResponseHeader,
        body: ResponseKind,
    },
}

impl ResponseFrame {
    pub fn correlation_id(&self) -> i32 {
        match self {
            ResponseFrame::Opaque { correlation_id, .. } => *correlation_id,
            ResponseFrame::Decoded { header, .. } => header.correlation_id,
        }
    }
}
