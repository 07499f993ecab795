//! Error taxonomy for the proxy data plane.

use std::error::Error;
use std::fmt::{Display, Formatter};

use kafka_protocol::protocol::buf::NotEnoughBytesError;
use kafka_protocol::protocol::{DecodeError, EncodeError};

/// Everything that can take a proxied connection down.
///
/// All variants are terminal for the connection they occur on: they bubble up
/// to the connection driver, which logs them and closes both sides. Filters
/// observe failures only through their promise rejections.
#[derive(Debug)]
pub enum ProxyError {
    /// A frame was truncated, oversized, or violated the Kafka schema.
    MalformedFrame(String),
    /// A response arrived whose correlation id matches no in-flight request.
    UnknownCorrelation(i32),
    /// The connection state machine received a message illegal for its state.
    IllegalState {
        state: &'static str,
        event: String,
    },
    /// A filter hook did not complete within its deadline.
    FilterTimeout {
        filter: String,
    },
    /// A filter hook completed with an error.
    FilterError {
        filter: String,
        message: String,
    },
    /// TCP connect to the upstream broker failed.
    UpstreamConnectFailure(String),
    /// The upstream broker closed the connection.
    UpstreamClosed,
    Io(std::io::Error),
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::MalformedFrame(detail) => {
                write!(f, "malformed frame: {detail}")
            }
            ProxyError::UnknownCorrelation(id) => {
                write!(f, "response with unknown correlation id {id}")
            }
            ProxyError::IllegalState { state, event } => {
                write!(f, "illegal message in state {state}: {event}")
            }
            ProxyError::FilterTimeout { filter } => {
                write!(f, "filter {filter} timed out")
            }
            ProxyError::FilterError { filter, message } => {
                write!(f, "filter {filter} failed: {message}")
            }
            ProxyError::UpstreamConnectFailure(detail) => {
                write!(f, "could not connect upstream: {detail}")
            }
            ProxyError::UpstreamClosed => {
                write!(f, "upstream connection closed")
            }
            ProxyError::Io(err) => {
                write!(f, "io error: {err}")
            }
        }
    }
}

impl Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<DecodeError> for ProxyError {
    fn from(_err: DecodeError) -> Self {
        ProxyError::MalformedFrame("schema decode failed".to_string())
    }
}

impl From<EncodeError> for ProxyError {
    fn from(_err: EncodeError) -> Self {
        ProxyError::MalformedFrame("schema encode failed".to_string())
    }
}

impl From<NotEnoughBytesError> for ProxyError {
    fn from(_err: NotEnoughBytesError) -> Self {
        ProxyError::MalformedFrame("frame shorter than its header".to_string())
    }
}
