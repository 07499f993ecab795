//! The broker-facing half of a proxied connection.
//!
//! Owns the upstream dial, the writer task that drains request frames toward
//! the broker, the reader task that decodes responses (resolving
//! filter-solicited promises as they arrive), and the response pump that
//! runs the remaining responses back through the filter chain in reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, TryStreamExt};
use kafka_protocol::messages::ResponseKind;
use tokio::io;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::chain::{FilterChain, ResponseChainOutcome};
use crate::cluster::{UpstreamTarget, VirtualCluster};
use crate::codec::{BrokerRequestEncoder, BrokerResponseDecoder, SharedPredicate};
use crate::correlation::CorrelationMap;
use crate::error::ProxyError;
use crate::filter::SharedConnectionInfo;
use crate::frame::{RequestFrame, ResponseFrame};

/// A live connection to the upstream broker.
pub struct UpstreamLink {
    /// Request frames sent here are encoded (correlation rewritten) and
    /// written to the broker, one in flight at a time: a stalled broker
    /// socket backpressures all the way to the client read.
    pub tx: mpsc::Sender<RequestFrame>,
    /// Responses that must flow to the client. Filter-solicited responses
    /// resolve their promise in the reader and never show up here.
    pub responses: mpsc::Receiver<ResponseFrame>,
    pub writer: JoinHandle<Result<(), ProxyError>>,
    pub reader: JoinHandle<Result<(), ProxyError>>,
}

/// Dial the chosen upstream and stand up its pipeline.
pub async fn connect(
    target: &UpstreamTarget,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    correlation: Arc<CorrelationMap>,
    predicate: SharedPredicate,
) -> Result<UpstreamLink, ProxyError> {
    let stream = timeout(
        connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        ProxyError::UpstreamConnectFailure(format!(
            "connect to {}:{} timed out",
            target.host, target.port
        ))
    })?
    .map_err(|err| {
        ProxyError::UpstreamConnectFailure(format!(
            "connect to {}:{} failed: {err}",
            target.host, target.port
        ))
    })?;

    let (read_half, write_half) = io::split(stream);
    let mut sink = FramedWrite::new(
        write_half,
        BrokerRequestEncoder::new(Arc::clone(&correlation), predicate),
    );
    let (tx, mut rx) = mpsc::channel::<RequestFrame>(1);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            sink.send(frame).await?;
        }
        // All senders gone: flush what is pending, then let the socket close.
        sink.flush().await?;
        Ok(())
    });

    // The reader stays responsive even while a filter hook stalls response
    // processing: promises resolve at decode time, and only frames bound for
    // the client wait in the (single-slot) hand-off below.
    let (response_tx, responses) = mpsc::channel::<ResponseFrame>(1);
    let mut framed = FramedRead::new(
        read_half,
        BrokerResponseDecoder::new(correlation, max_frame_bytes),
    );
    let reader = tokio::spawn(async move {
        while let Some(frame) = framed.try_next().await? {
            if response_tx.send(frame).await.is_err() {
                // Connection is tearing down.
                return Ok(());
            }
        }
        Ok(())
    });

    Ok(UpstreamLink {
        tx,
        responses,
        writer,
        reader,
    })
}

/// Process broker responses until the upstream goes away, routing each
/// through the reverse filter chain and on to the client writer.
pub async fn response_pump(
    responses: &mut mpsc::Receiver<ResponseFrame>,
    reader: &mut JoinHandle<Result<(), ProxyError>>,
    chain: &tokio::sync::Mutex<FilterChain>,
    client_tx: &mpsc::Sender<ResponseFrame>,
    cluster: &VirtualCluster,
    info: &SharedConnectionInfo,
    sasl_done: &AtomicBool,
) -> Result<(), ProxyError> {
    while let Some(frame) = responses.recv().await {
        match frame {
            ResponseFrame::Opaque {
                correlation_id,
                frame,
            } => {
                if cluster.log_frames {
                    debug!(correlation_id, len = frame.len(), "opaque response");
                    trace!(
                        payload = %hex::encode(&frame[..frame.len().min(64)]),
                        "opaque response bytes"
                    );
                }
                client_tx
                    .send(ResponseFrame::Opaque {
                        correlation_id,
                        frame,
                    })
                    .await
                    .map_err(|_| client_gone())?;
            }
            ResponseFrame::Decoded {
                api_key,
                api_version,
                header,
                body,
            } => {
                if cluster.log_frames {
                    debug!(
                        api_key,
                        api_version,
                        correlation_id = header.correlation_id,
                        "decoded response"
                    );
                }
                observe_sasl_response(&body, info, sasl_done);
                let outcome = chain
                    .lock()
                    .await
                    .run_response(api_key, api_version, header, body)
                    .await?;
                match outcome {
                    ResponseChainOutcome::Forward(frame) => {
                        client_tx.send(frame).await.map_err(|_| client_gone())?;
                    }
                    ResponseChainOutcome::Drop => {}
                    ResponseChainOutcome::Close => return Ok(()),
                }
            }
        }
    }
    // Channel closed: the reader hit EOF or a decode error.
    match reader.await {
        Ok(Ok(())) => Err(ProxyError::UpstreamClosed),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ProxyError::UpstreamClosed),
    }
}

fn client_gone() -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "client connection closed",
    ))
}

/// Promote the pending SASL identity once the broker accepts it, and stop
/// forcing decode from then on.
fn observe_sasl_response(
    body: &ResponseKind,
    info: &SharedConnectionInfo,
    sasl_done: &AtomicBool,
) {
    if let ResponseKind::SaslAuthenticateResponse(response) = body {
        if response.error_code == 0 {
            let mut info = info.write().unwrap();
            if let Some(id) = info.pending_authorized_id.take() {
                info.authorized_id = Some(id);
            }
            sasl_done.store(true, Ordering::Release);
        } else {
            warn!(
                error_code = response.error_code,
                "sasl authentication rejected by broker"
            );
            info.write().unwrap().pending_authorized_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use kafka_protocol::messages::SaslAuthenticateResponse;

    use super::*;

    #[test]
    fn successful_authentication_promotes_the_pending_identity() {
        let info: SharedConnectionInfo = Arc::new(RwLock::new(Default::default()));
        info.write().unwrap().pending_authorized_id = Some("alice".to_string());
        let done = AtomicBool::new(false);

        let mut response = SaslAuthenticateResponse::default();
        response.error_code = 0;
        observe_sasl_response(
            &ResponseKind::SaslAuthenticateResponse(response),
            &info,
            &done,
        );

        assert_eq!(
            info.read().unwrap().authorized_id.as_deref(),
            Some("alice")
        );
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn rejected_authentication_discards_the_pending_identity() {
        let info: SharedConnectionInfo = Arc::new(RwLock::new(Default::default()));
        info.write().unwrap().pending_authorized_id = Some("mallory".to_string());
        let done = AtomicBool::new(false);

        let mut response = SaslAuthenticateResponse::default();
        response.error_code = 58; // SASL_AUTHENTICATION_FAILED
        observe_sasl_response(
            &ResponseKind::SaslAuthenticateResponse(response),
            &info,
            &done,
        );

        assert_eq!(info.read().unwrap().authorized_id, None);
        assert!(!done.load(Ordering::Acquire));
    }
}
