//! The client-facing half of a proxied connection.
//!
//! A small pure state machine governs the pre-upstream phase: optional
//! HAProxy preamble, locally answered `ApiVersions`, then exactly one
//! buffered request while the `NetFilter` picks an upstream and the dial
//! completes. Once the outbound side is active, the request pump reads
//! client frames, runs them through the filter chain and hands them to the
//! upstream writer; backpressure propagates by simply not reading.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, TryStreamExt};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, RequestKind, ResponseHeader, ResponseKind,
};
use tokio::io::{self, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::backend::{self, UpstreamLink};
use crate::chain::{FilterChain, RequestChainOutcome};
use crate::cluster::{NetFilter, NetFilterContext, UpstreamTarget, VirtualCluster};
use crate::codec::{
    self, ClientRequestDecoder, ClientResponseEncoder, DecodePredicate, DownstreamItem,
    SharedPredicate,
};
use crate::correlation::CorrelationMap;
use crate::error::ProxyError;
use crate::filter::{ConnectionInfo, FilterContext, SharedConnectionInfo};
use crate::frame::{RequestFrame, ResponseFrame};

/// States of the client-facing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendState {
    Start,
    HaProxy,
    ApiVersions,
    Connecting,
    Connected,
    OutboundActive,
    Failed,
}

impl FrontendState {
    pub fn name(&self) -> &'static str {
        match self {
            FrontendState::Start => "START",
            FrontendState::HaProxy => "HA_PROXY",
            FrontendState::ApiVersions => "API_VERSIONS",
            FrontendState::Connecting => "CONNECTING",
            FrontendState::Connected => "CONNECTED",
            FrontendState::OutboundActive => "OUTBOUND_ACTIVE",
            FrontendState::Failed => "FAILED",
        }
    }
}

/// Events the driver feeds into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendEvent {
    PreambleReceived,
    /// An `ApiVersions` request the proxy will answer itself.
    ApiVersionsReceived,
    /// Any request that must reach a broker.
    RequestReceived,
    UpstreamConnected,
    UpstreamActive,
    UpstreamFailed,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendAction {
    CaptureSourceAddress,
    RespondApiVersions,
    /// Buffer the triggering request and ask the `NetFilter` for an upstream.
    SelectServer,
    FlushBufferedRequest,
    ForwardRequest,
}

/// Pure transition function. Anything not listed is illegal in that state;
/// the connection fails and closes.
pub fn on_event(
    state: FrontendState,
    event: FrontendEvent,
) -> Result<(FrontendState, Option<FrontendAction>), ProxyError> {
    use FrontendAction::*;
    use FrontendEvent::*;
    use FrontendState::*;

    Ok(match (state, event) {
        (_, UpstreamFailed) => (Failed, None),
        (Start, PreambleReceived) => (HaProxy, Some(CaptureSourceAddress)),
        (Start | HaProxy | ApiVersions, ApiVersionsReceived) => {
            (ApiVersions, Some(RespondApiVersions))
        }
        (Start | HaProxy | ApiVersions, RequestReceived) => (Connecting, Some(SelectServer)),
        (Connecting, UpstreamConnected) => (Connected, None),
        (Connected, UpstreamActive) => (OutboundActive, Some(FlushBufferedRequest)),
        (OutboundActive, RequestReceived | ApiVersionsReceived) => {
            (OutboundActive, Some(ForwardRequest))
        }
        (state, event) => {
            return Err(ProxyError::IllegalState {
                state: state.name(),
                event: format!("{event:?}"),
            })
        }
    })
}

/// Connection-independent wiring shared by every accepted socket.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub cluster: Arc<VirtualCluster>,
    pub net_filter: Arc<dyn NetFilter>,
    /// Canned body served for intercepted `ApiVersions` requests.
    pub api_versions: Arc<ApiVersionsResponse>,
    pub filter_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Answer `ApiVersions` locally instead of buffering it upstream.
    pub intercept_api_versions: bool,
    /// Force decode until a SASL handshake completes, to capture the
    /// authenticated identity for filters.
    pub observe_sasl: bool,
}

/// Drive one client connection to completion.
pub async fn handle_connection(
    conn_id: Uuid,
    opts: ConnectionOptions,
    socket: TcpStream,
) -> Result<(), ProxyError> {
    let peer = socket.peer_addr().ok();
    let local = socket.local_addr().ok();
    let info: SharedConnectionInfo = Arc::new(RwLock::new(ConnectionInfo {
        source_address: peer,
        local_address: local,
        ..Default::default()
    }));
    let predicate: SharedPredicate = Arc::new(RwLock::new(DecodePredicate::Bootstrap));

    let (read_half, write_half) = io::split(socket);
    let mut requests = tokio_util::codec::FramedRead::new(
        read_half,
        ClientRequestDecoder::new(Arc::clone(&predicate), opts.max_frame_bytes),
    );
    let (client_tx, client_rx) = mpsc::channel::<ResponseFrame>(1);
    let client_writer = tokio::spawn(write_responses(
        client_rx,
        tokio_util::codec::FramedWrite::new(write_half, ClientResponseEncoder),
    ));

    let result = run_connection(
        conn_id,
        &opts,
        &info,
        &predicate,
        &mut requests,
        &client_tx,
    )
    .await;

    drop(requests);
    drop(client_tx);
    let _ = client_writer.await;
    if opts.cluster.log_network {
        info!(%conn_id, "connection closed");
    }
    result
}

async fn run_connection(
    conn_id: Uuid,
    opts: &ConnectionOptions,
    info: &SharedConnectionInfo,
    predicate: &SharedPredicate,
    requests: &mut tokio_util::codec::FramedRead<ReadHalf<TcpStream>, ClientRequestDecoder>,
    client_tx: &mpsc::Sender<ResponseFrame>,
) -> Result<(), ProxyError> {
    let Some((state, target, buffered)) =
        accept_phase(opts, info, requests, client_tx).await?
    else {
        // Client went away before asking for a broker.
        return Ok(());
    };

    // The chain is fixed now: install the real decode predicate, then give
    // the buffered request a chance to decode under it.
    let sasl_done = Arc::new(AtomicBool::new(false));
    let subscribed = FilterChain::decode_predicate(&target.filters);
    let installed = if opts.observe_sasl {
        DecodePredicate::SaslAware {
            inner: Box::new(subscribed),
            handshake_done: Arc::clone(&sasl_done),
        }
    } else {
        subscribed
    };
    *predicate.write().unwrap() = installed;
    let buffered = codec::upgrade_request_frame(buffered, &predicate.read().unwrap())?;

    let correlation = Arc::new(CorrelationMap::new());
    let link = match backend::connect(
        &target,
        opts.connect_timeout,
        opts.max_frame_bytes,
        Arc::clone(&correlation),
        Arc::clone(predicate),
    )
    .await
    {
        Ok(link) => link,
        Err(err) => {
            let _ = on_event(state, FrontendEvent::UpstreamFailed);
            error!(%conn_id, %err, "upstream connect failed");
            return Err(err);
        }
    };
    let (state, _) = on_event(state, FrontendEvent::UpstreamConnected)?;
    if opts.cluster.log_network {
        info!(%conn_id, host = %target.host, port = target.port, "connected upstream");
    }

    let UpstreamLink {
        tx: upstream_tx,
        mut responses,
        writer: upstream_writer,
        reader: mut upstream_reader,
    } = link;
    let description = format!(
        "{}@{conn_id}: {:?} -> {}:{}",
        opts.cluster.name,
        info.read().unwrap().source_address,
        target.host,
        target.port
    );
    let ctx = FilterContext::new(
        Arc::clone(info),
        Arc::clone(&opts.cluster),
        upstream_tx.clone(),
        description,
    );
    let chain = Mutex::new(FilterChain::new(target.filters, ctx, opts.filter_timeout));

    // Outbound is live: the request pump flushes the single buffered request
    // first. Both pumps run concurrently so a filter hook can await an
    // out-of-band response while the reader keeps draining the broker.
    let (_state, _) = on_event(state, FrontendEvent::UpstreamActive)?;
    let outcome = tokio::select! {
        result = request_pump(Some(buffered), requests, &chain, &upstream_tx, client_tx, opts, info) => result,
        result = backend::response_pump(
            &mut responses,
            &mut upstream_reader,
            &chain,
            client_tx,
            &opts.cluster,
            info,
            &sasl_done,
        ) => result,
    };

    // Teardown: fail outstanding promises, then let the writers drain.
    correlation.cancel_all();
    drop(chain);
    drop(upstream_tx);
    let _ = upstream_writer.await;
    outcome
}

/// Run the pre-upstream state machine until the first broker-bound request.
async fn accept_phase(
    opts: &ConnectionOptions,
    info: &SharedConnectionInfo,
    requests: &mut tokio_util::codec::FramedRead<ReadHalf<TcpStream>, ClientRequestDecoder>,
    client_tx: &mpsc::Sender<ResponseFrame>,
) -> Result<Option<(FrontendState, UpstreamTarget, RequestFrame)>, ProxyError> {
    let mut state = FrontendState::Start;
    while let Some(item) = requests.try_next().await? {
        match item {
            DownstreamItem::Preamble(preamble) => {
                let (next, _) = fail_on_illegal(&mut state, FrontendEvent::PreambleReceived)?;
                state = next;
                info.write().unwrap().client_address = preamble.source;
            }
            DownstreamItem::Request(frame) => {
                let intercepted = opts.intercept_api_versions
                    && frame.api_key() == ApiKey::ApiVersionsKey as i16;
                if intercepted {
                    let (next, _) =
                        fail_on_illegal(&mut state, FrontendEvent::ApiVersionsReceived)?;
                    state = next;
                    respond_api_versions(opts, info, frame, client_tx).await?;
                } else {
                    let (next, _) = fail_on_illegal(&mut state, FrontendEvent::RequestReceived)?;
                    state = next;
                    let snapshot = info.read().unwrap().clone();
                    let ctx = NetFilterContext {
                        info: &snapshot,
                        virtual_cluster: &opts.cluster.name,
                    };
                    let target = opts.net_filter.select_server(&ctx).await?;
                    return Ok(Some((state, target, frame)));
                }
            }
        }
    }
    Ok(None)
}

fn fail_on_illegal(
    state: &mut FrontendState,
    event: FrontendEvent,
) -> Result<(FrontendState, Option<FrontendAction>), ProxyError> {
    on_event(*state, event).map_err(|err| {
        error!(state = state.name(), %err, "illegal message for connection state");
        *state = FrontendState::Failed;
        err
    })
}

/// Answer an intercepted `ApiVersions` request from the canned response.
async fn respond_api_versions(
    opts: &ConnectionOptions,
    info: &SharedConnectionInfo,
    frame: RequestFrame,
    client_tx: &mpsc::Sender<ResponseFrame>,
) -> Result<(), ProxyError> {
    // The bootstrap predicate always decodes ApiVersions.
    let RequestFrame::Decoded { header, body, .. } = frame else {
        return Err(ProxyError::MalformedFrame(
            "api versions request was not decoded".to_string(),
        ));
    };
    if let RequestKind::ApiVersionsRequest(request) = &body {
        if header.request_api_version >= 3 {
            let mut info = info.write().unwrap();
            info.client_software_name = Some(request.client_software_name.to_string());
            info.client_software_version = Some(request.client_software_version.to_string());
        }
    }
    let mut response_header = ResponseHeader::default();
    response_header.correlation_id = header.correlation_id;
    client_tx
        .send(ResponseFrame::Decoded {
            api_key: ApiKey::ApiVersionsKey as i16,
            api_version: header.request_api_version,
            header: response_header,
            body: ResponseKind::ApiVersionsResponse((*opts.api_versions).clone()),
        })
        .await
        .map_err(|_| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client connection closed",
            ))
        })
}

#[derive(Debug, PartialEq, Eq)]
enum PumpFlow {
    Continue,
    Close,
}

/// Feed the buffered pre-connect request, then read client frames until EOF.
async fn request_pump(
    initial: Option<RequestFrame>,
    requests: &mut tokio_util::codec::FramedRead<ReadHalf<TcpStream>, ClientRequestDecoder>,
    chain: &Mutex<FilterChain>,
    upstream_tx: &mpsc::Sender<RequestFrame>,
    client_tx: &mpsc::Sender<ResponseFrame>,
    opts: &ConnectionOptions,
    info: &SharedConnectionInfo,
) -> Result<(), ProxyError> {
    if let Some(frame) = initial {
        match process_request(frame, chain, upstream_tx, client_tx, opts, info).await? {
            PumpFlow::Continue => {}
            PumpFlow::Close => return Ok(()),
        }
    }
    while let Some(item) = requests.try_next().await? {
        let frame = match item {
            DownstreamItem::Preamble(_) => {
                return Err(ProxyError::IllegalState {
                    state: FrontendState::OutboundActive.name(),
                    event: "proxy protocol preamble".to_string(),
                })
            }
            DownstreamItem::Request(frame) => frame,
        };
        match process_request(frame, chain, upstream_tx, client_tx, opts, info).await? {
            PumpFlow::Continue => {}
            PumpFlow::Close => return Ok(()),
        }
    }
    Ok(())
}

/// Push one request through the chain and onward.
async fn process_request(
    frame: RequestFrame,
    chain: &Mutex<FilterChain>,
    upstream_tx: &mpsc::Sender<RequestFrame>,
    client_tx: &mpsc::Sender<ResponseFrame>,
    opts: &ConnectionOptions,
    info: &SharedConnectionInfo,
) -> Result<PumpFlow, ProxyError> {
    if opts.cluster.log_frames {
        debug!(
            api_key = frame.api_key(),
            api_version = frame.api_version(),
            correlation_id = frame.correlation_id(),
            has_response = frame.has_response(),
            "downstream request"
        );
        if let RequestFrame::Opaque { frame: payload, .. } = &frame {
            trace!(
                payload = %hex::encode(&payload[..payload.len().min(64)]),
                "opaque request bytes"
            );
        }
    }
    match frame {
        // Opaque frames bypass the chain entirely.
        RequestFrame::Opaque { .. } => {
            upstream_tx
                .send(frame)
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
            Ok(PumpFlow::Continue)
        }
        RequestFrame::Decoded {
            header,
            body,
            has_response,
            ..
        } => {
            observe_sasl_request(&body, info);
            let outcome = chain
                .lock()
                .await
                .run_request(header, body, has_response)
                .await?;
            match outcome {
                RequestChainOutcome::Forward(frame) => {
                    upstream_tx
                        .send(frame)
                        .await
                        .map_err(|_| ProxyError::UpstreamClosed)?;
                    Ok(PumpFlow::Continue)
                }
                RequestChainOutcome::ShortCircuit {
                    response,
                    close_connection,
                } => {
                    if let Some(response) = response {
                        client_tx.send(response).await.map_err(|_| {
                            ProxyError::Io(std::io::Error::new(
                                std::io::ErrorKind::BrokenPipe,
                                "client connection closed",
                            ))
                        })?;
                    }
                    if close_connection {
                        Ok(PumpFlow::Close)
                    } else {
                        Ok(PumpFlow::Continue)
                    }
                }
                RequestChainOutcome::Drop => Ok(PumpFlow::Continue),
            }
        }
    }
}

/// Remember the identity a PLAIN authenticate request claims; the backend
/// promotes it once the broker accepts.
fn observe_sasl_request(body: &RequestKind, info: &SharedConnectionInfo) {
    if let RequestKind::SaslAuthenticateRequest(request) = body {
        let parts: Vec<&[u8]> = request.auth_bytes.split(|byte| *byte == 0).collect();
        if parts.len() == 3 {
            if let Ok(authcid) = std::str::from_utf8(parts[1]) {
                if !authcid.is_empty() {
                    info.write().unwrap().pending_authorized_id = Some(authcid.to_string());
                }
            }
        }
    }
}

/// Drain response frames to the client socket, flushing before close.
async fn write_responses(
    mut rx: mpsc::Receiver<ResponseFrame>,
    mut sink: tokio_util::codec::FramedWrite<WriteHalf<TcpStream>, ClientResponseEncoder>,
) -> Result<(), ProxyError> {
    while let Some(frame) = rx.recv().await {
        sink.send(frame).await?;
    }
    sink.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_state() {
        let (state, action) = on_event(FrontendState::Start, FrontendEvent::PreambleReceived).unwrap();
        assert_eq!(state, FrontendState::HaProxy);
        assert_eq!(action, Some(FrontendAction::CaptureSourceAddress));

        let (state, action) = on_event(state, FrontendEvent::ApiVersionsReceived).unwrap();
        assert_eq!(state, FrontendState::ApiVersions);
        assert_eq!(action, Some(FrontendAction::RespondApiVersions));

        let (state, action) = on_event(state, FrontendEvent::RequestReceived).unwrap();
        assert_eq!(state, FrontendState::Connecting);
        assert_eq!(action, Some(FrontendAction::SelectServer));

        let (state, _) = on_event(state, FrontendEvent::UpstreamConnected).unwrap();
        assert_eq!(state, FrontendState::Connected);

        let (state, action) = on_event(state, FrontendEvent::UpstreamActive).unwrap();
        assert_eq!(state, FrontendState::OutboundActive);
        assert_eq!(action, Some(FrontendAction::FlushBufferedRequest));

        let (state, action) = on_event(state, FrontendEvent::RequestReceived).unwrap();
        assert_eq!(state, FrontendState::OutboundActive);
        assert_eq!(action, Some(FrontendAction::ForwardRequest));
    }

    #[test]
    fn api_versions_can_repeat_before_an_upstream_is_chosen() {
        let (state, _) = on_event(FrontendState::Start, FrontendEvent::ApiVersionsReceived).unwrap();
        let (state, action) = on_event(state, FrontendEvent::ApiVersionsReceived).unwrap();
        assert_eq!(state, FrontendState::ApiVersions);
        assert_eq!(action, Some(FrontendAction::RespondApiVersions));
    }

    #[test]
    fn a_second_request_while_connecting_is_illegal() {
        let (state, _) = on_event(FrontendState::Start, FrontendEvent::RequestReceived).unwrap();
        assert_eq!(state, FrontendState::Connecting);
        // Only one message may be buffered; the next one fails the connection.
        let err = on_event(state, FrontendEvent::RequestReceived).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::IllegalState { state: "CONNECTING", .. }
        ));
    }

    #[test]
    fn a_late_preamble_is_illegal() {
        let (state, _) = on_event(FrontendState::Start, FrontendEvent::ApiVersionsReceived).unwrap();
        assert!(on_event(state, FrontendEvent::PreambleReceived).is_err());
    }

    #[test]
    fn upstream_failure_is_terminal_from_any_state() {
        for state in [
            FrontendState::Start,
            FrontendState::Connecting,
            FrontendState::OutboundActive,
        ] {
            let (next, action) = on_event(state, FrontendEvent::UpstreamFailed).unwrap();
            assert_eq!(next, FrontendState::Failed);
            assert_eq!(action, None);
        }
    }
}
