//! The filter SPI: interception hooks over decoded frames.
//!
//! Filters subscribe to api keys via [`Filter::wants_request`] /
//! [`Filter::wants_response`]; only subscribed keys are decoded at all. Each
//! hook receives the decoded header and body and returns a result that
//! directs forwarding, short-circuiting, dropping, or closing. Hooks run
//! serialized per connection, with a timeout enforced by the chain runtime.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::BytesMut;
use kafka_protocol::messages::*;
use tokio::sync::{mpsc, oneshot};

use crate::api;
use crate::cluster::VirtualCluster;
use crate::error::ProxyError;
use crate::frame::RequestFrame;

/// What the proxy knows about one downstream connection, exposed to filters
/// through [`FilterContext`] accessors.
#[derive(Debug, Default, Clone)]
pub struct ConnectionInfo {
    /// Peer address of the accepted socket.
    pub source_address: Option<SocketAddr>,
    /// Local address the client connected to.
    pub local_address: Option<SocketAddr>,
    /// Original client address, when an HAProxy preamble announced one.
    pub client_address: Option<SocketAddr>,
    /// TLS SNI hostname, when termination happens in front of the core.
    pub sni_hostname: Option<String>,
    pub client_software_name: Option<String>,
    pub client_software_version: Option<String>,
    /// Authenticated identity, once a SASL handshake succeeded.
    pub authorized_id: Option<String>,
    /// Identity claimed by an in-flight SASL authenticate request; promoted
    /// to `authorized_id` when the broker accepts it.
    pub(crate) pending_authorized_id: Option<String>,
}

pub type SharedConnectionInfo = Arc<RwLock<ConnectionInfo>>;

/// Outcome of a request hook.
#[derive(Debug)]
pub enum RequestFilterResult {
    /// Hand the (possibly mutated) request to the next filter, then upstream.
    Forward {
        header: RequestHeader,
        body: RequestKind,
    },
    /// Do not contact the broker; send this response back through the
    /// response hooks of the filters before this one, then to the client.
    ShortCircuit {
        body: ResponseKind,
        close_connection: bool,
    },
    /// Discard the request silently.
    Drop,
}

impl RequestFilterResult {
    pub fn forward(header: RequestHeader, body: RequestKind) -> Self {
        RequestFilterResult::Forward { header, body }
    }

    pub fn short_circuit(body: ResponseKind) -> Self {
        RequestFilterResult::ShortCircuit {
            body,
            close_connection: false,
        }
    }

    pub fn short_circuit_then_close(body: ResponseKind) -> Self {
        RequestFilterResult::ShortCircuit {
            body,
            close_connection: true,
        }
    }
}

/// Outcome of a response hook.
#[derive(Debug)]
pub enum ResponseFilterResult {
    Forward {
        header: ResponseHeader,
        body: ResponseKind,
    },
    Drop,
    Close,
}

impl ResponseFilterResult {
    pub fn forward(header: ResponseHeader, body: ResponseKind) -> Self {
        ResponseFilterResult::Forward { header, body }
    }
}

/// Pending result of [`FilterContext::send_request`].
#[derive(Debug)]
pub struct ResponseReceiver(oneshot::Receiver<Result<ResponseKind, ProxyError>>);

impl ResponseReceiver {
    /// Wait for the broker's response to an out-of-band request.
    pub async fn await_response(self) -> Result<ResponseKind, ProxyError> {
        match self.0.await {
            Ok(result) => result,
            // Sender dropped without resolving: the request either expected
            // no response or the connection went away.
            Err(_) => Err(ProxyError::UpstreamClosed),
        }
    }
}

/// Per-connection services available to filter hooks.
pub struct FilterContext {
    info: SharedConnectionInfo,
    cluster: Arc<VirtualCluster>,
    upstream: mpsc::Sender<RequestFrame>,
    description: String,
}

impl FilterContext {
    pub(crate) fn new(
        info: SharedConnectionInfo,
        cluster: Arc<VirtualCluster>,
        upstream: mpsc::Sender<RequestFrame>,
        description: String,
    ) -> Self {
        Self {
            info,
            cluster,
            upstream,
            description,
        }
    }

    /// Send an out-of-band request to the upstream broker.
    ///
    /// The runtime allocates a fresh upstream correlation id; the matching
    /// response resolves the returned receiver and is never delivered to the
    /// client. Other filters see neither the request nor the response.
    pub async fn send_request(
        &self,
        api_version: i16,
        body: RequestKind,
    ) -> Result<ResponseReceiver, ProxyError> {
        let api_key = api::request_body_api_key(&body)?;
        let mut header = RequestHeader::default();
        header.request_api_key = api_key;
        header.request_api_version = api_version;
        let has_response = match &body {
            RequestKind::ProduceRequest(produce) => produce.acks != 0,
            _ => true,
        };
        let (promise, receiver) = oneshot::channel();
        let frame = RequestFrame::Decoded {
            header,
            body,
            has_response,
            promise: Some(promise),
        };
        self.upstream
            .send(frame)
            .await
            .map_err(|_| ProxyError::UpstreamClosed)?;
        Ok(ResponseReceiver(receiver))
    }

    /// A scratch buffer for hook-local work. Dropping it releases it, at the
    /// latest when the hook completes.
    pub fn allocate_byte_buffer(&self, initial_capacity: usize) -> BytesMut {
        BytesMut::with_capacity(initial_capacity)
    }

    pub fn virtual_cluster_name(&self) -> &str {
        &self.cluster.name
    }

    pub fn channel_description(&self) -> &str {
        &self.description
    }

    pub fn source_address(&self) -> Option<SocketAddr> {
        self.info.read().unwrap().source_address
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.info.read().unwrap().local_address
    }

    /// Client address announced by an HAProxy preamble, when present.
    pub fn client_address(&self) -> Option<SocketAddr> {
        self.info.read().unwrap().client_address
    }

    pub fn sni_hostname(&self) -> Option<String> {
        self.info.read().unwrap().sni_hostname.clone()
    }

    pub fn client_software_name(&self) -> Option<String> {
        self.info.read().unwrap().client_software_name.clone()
    }

    pub fn client_software_version(&self) -> Option<String> {
        self.info.read().unwrap().client_software_version.clone()
    }

    pub fn authorized_id(&self) -> Option<String> {
        self.info.read().unwrap().authorized_id.clone()
    }
}

/// A user-supplied interceptor.
///
/// Override the `wants_*` methods to subscribe to api keys, then either the
/// typed per-api hooks or the `on_request`/`on_response` catch-alls. Every
/// typed hook defaults to the catch-all, which defaults to forwarding.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Whether requests with this api key should be decoded and offered to
    /// this filter's request hooks.
    fn wants_request(&self, api_key: ApiKey) -> bool {
        let _ = api_key;
        false
    }

    /// Whether responses with this api key should be decoded and offered to
    /// this filter's response hooks.
    fn wants_response(&self, api_key: ApiKey) -> bool {
        let _ = api_key;
        false
    }

    async fn on_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        body: RequestKind,
    ) -> Result<RequestFilterResult, ProxyError> {
        let _ = ctx;
        Ok(RequestFilterResult::forward(header, body))
    }

    async fn on_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        body: ResponseKind,
    ) -> Result<ResponseFilterResult, ProxyError> {
        let _ = ctx;
        Ok(ResponseFilterResult::forward(header, body))
    }

    async fn on_produce_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: ProduceRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::ProduceRequest(request))
            .await
    }

    async fn on_fetch_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: FetchRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::FetchRequest(request))
            .await
    }

    async fn on_list_offsets_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: ListOffsetsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::ListOffsetsRequest(request))
            .await
    }

    async fn on_metadata_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: MetadataRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::MetadataRequest(request))
            .await
    }

    async fn on_offset_commit_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: OffsetCommitRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::OffsetCommitRequest(request))
            .await
    }

    async fn on_offset_fetch_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: OffsetFetchRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::OffsetFetchRequest(request))
            .await
    }

    async fn on_find_coordinator_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: FindCoordinatorRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::FindCoordinatorRequest(request))
            .await
    }

    async fn on_sasl_handshake_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: SaslHandshakeRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::SaslHandshakeRequest(request))
            .await
    }

    async fn on_api_versions_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: ApiVersionsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::ApiVersionsRequest(request))
            .await
    }

    async fn on_create_topics_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: CreateTopicsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::CreateTopicsRequest(request))
            .await
    }

    async fn on_delete_topics_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: DeleteTopicsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::DeleteTopicsRequest(request))
            .await
    }

    async fn on_init_producer_id_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: InitProducerIdRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::InitProducerIdRequest(request))
            .await
    }

    async fn on_sasl_authenticate_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: SaslAuthenticateRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::SaslAuthenticateRequest(request))
            .await
    }

    async fn on_describe_groups_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: DescribeGroupsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::DescribeGroupsRequest(request))
            .await
    }

    async fn on_list_groups_request(
        &mut self,
        ctx: &mut FilterContext,
        header: RequestHeader,
        request: ListGroupsRequest,
    ) -> Result<RequestFilterResult, ProxyError> {
        self.on_request(ctx, header, RequestKind::ListGroupsRequest(request))
            .await
    }

    async fn on_produce_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: ProduceResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::ProduceResponse(response))
            .await
    }

    async fn on_fetch_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: FetchResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::FetchResponse(response))
            .await
    }

    async fn on_list_offsets_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: ListOffsetsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::ListOffsetsResponse(response))
            .await
    }

    async fn on_metadata_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: MetadataResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::MetadataResponse(response))
            .await
    }

    async fn on_offset_commit_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: OffsetCommitResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::OffsetCommitResponse(response))
            .await
    }

    async fn on_offset_fetch_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: OffsetFetchResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::OffsetFetchResponse(response))
            .await
    }

    async fn on_find_coordinator_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: FindCoordinatorResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::FindCoordinatorResponse(response))
            .await
    }

    async fn on_sasl_handshake_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: SaslHandshakeResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::SaslHandshakeResponse(response))
            .await
    }

    async fn on_api_versions_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: ApiVersionsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::ApiVersionsResponse(response))
            .await
    }

    async fn on_create_topics_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: CreateTopicsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::CreateTopicsResponse(response))
            .await
    }

    async fn on_delete_topics_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: DeleteTopicsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::DeleteTopicsResponse(response))
            .await
    }

    async fn on_init_producer_id_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: InitProducerIdResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::InitProducerIdResponse(response))
            .await
    }

    async fn on_sasl_authenticate_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: SaslAuthenticateResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::SaslAuthenticateResponse(response))
            .await
    }

    async fn on_describe_groups_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: DescribeGroupsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::DescribeGroupsResponse(response))
            .await
    }

    async fn on_list_groups_response(
        &mut self,
        ctx: &mut FilterContext,
        header: ResponseHeader,
        response: ListGroupsResponse,
    ) -> Result<ResponseFilterResult, ProxyError> {
        self.on_response(ctx, header, ResponseKind::ListGroupsResponse(response))
            .await
    }
}

/// A filter instance paired with the name it was configured under.
pub struct NamedFilter {
    pub name: String,
    pub filter: Box<dyn Filter>,
}

impl NamedFilter {
    pub fn new(name: impl Into<String>, filter: impl Filter + 'static) -> Self {
        Self {
            name: name.into(),
            filter: Box::new(filter),
        }
    }
}

/// Route a decoded request to the filter's typed hook.
pub(crate) async fn dispatch_request(
    filter: &mut dyn Filter,
    ctx: &mut FilterContext,
    header: RequestHeader,
    body: RequestKind,
) -> Result<RequestFilterResult, ProxyError> {
    match body {
        RequestKind::ProduceRequest(req) => filter.on_produce_request(ctx, header, req).await,
        RequestKind::FetchRequest(req) => filter.on_fetch_request(ctx, header, req).await,
        RequestKind::ListOffsetsRequest(req) => {
            filter.on_list_offsets_request(ctx, header, req).await
        }
        RequestKind::MetadataRequest(req) => filter.on_metadata_request(ctx, header, req).await,
        RequestKind::OffsetCommitRequest(req) => {
            filter.on_offset_commit_request(ctx, header, req).await
        }
        RequestKind::OffsetFetchRequest(req) => {
            filter.on_offset_fetch_request(ctx, header, req).await
        }
        RequestKind::FindCoordinatorRequest(req) => {
            filter.on_find_coordinator_request(ctx, header, req).await
        }
        RequestKind::SaslHandshakeRequest(req) => {
            filter.on_sasl_handshake_request(ctx, header, req).await
        }
        RequestKind::ApiVersionsRequest(req) => {
            filter.on_api_versions_request(ctx, header, req).await
        }
        RequestKind::CreateTopicsRequest(req) => {
            filter.on_create_topics_request(ctx, header, req).await
        }
        RequestKind::DeleteTopicsRequest(req) => {
            filter.on_delete_topics_request(ctx, header, req).await
        }
        RequestKind::InitProducerIdRequest(req) => {
            filter.on_init_producer_id_request(ctx, header, req).await
        }
        RequestKind::SaslAuthenticateRequest(req) => {
            filter.on_sasl_authenticate_request(ctx, header, req).await
        }
        RequestKind::DescribeGroupsRequest(req) => {
            filter.on_describe_groups_request(ctx, header, req).await
        }
        RequestKind::ListGroupsRequest(req) => {
            filter.on_list_groups_request(ctx, header, req).await
        }
        other => filter.on_request(ctx, header, other).await,
    }
}

/// Route a decoded response to the filter's typed hook.
pub(crate) async fn dispatch_response(
    filter: &mut dyn Filter,
    ctx: &mut FilterContext,
    header: ResponseHeader,
    body: ResponseKind,
) -> Result<ResponseFilterResult, ProxyError> {
    match body {
        ResponseKind::ProduceResponse(res) => filter.on_produce_response(ctx, header, res).await,
        ResponseKind::FetchResponse(res) => filter.on_fetch_response(ctx, header, res).await,
        ResponseKind::ListOffsetsResponse(res) => {
            filter.on_list_offsets_response(ctx, header, res).await
        }
        ResponseKind::MetadataResponse(res) => filter.on_metadata_response(ctx, header, res).await,
        ResponseKind::OffsetCommitResponse(res) => {
            filter.on_offset_commit_response(ctx, header, res).await
        }
        ResponseKind::OffsetFetchResponse(res) => {
            filter.on_offset_fetch_response(ctx, header, res).await
        }
        ResponseKind::FindCoordinatorResponse(res) => {
            filter.on_find_coordinator_response(ctx, header, res).await
        }
        ResponseKind::SaslHandshakeResponse(res) => {
            filter.on_sasl_handshake_response(ctx, header, res).await
        }
        ResponseKind::ApiVersionsResponse(res) => {
            filter.on_api_versions_response(ctx, header, res).await
        }
        ResponseKind::CreateTopicsResponse(res) => {
            filter.on_create_topics_response(ctx, header, res).await
        }
        ResponseKind::DeleteTopicsResponse(res) => {
            filter.on_delete_topics_response(ctx, header, res).await
        }
        ResponseKind::InitProducerIdResponse(res) => {
            filter.on_init_producer_id_response(ctx, header, res).await
        }
        ResponseKind::SaslAuthenticateResponse(res) => {
            filter.on_sasl_authenticate_response(ctx, header, res).await
        }
        ResponseKind::DescribeGroupsResponse(res) => {
            filter.on_describe_groups_response(ctx, header, res).await
        }
        ResponseKind::ListGroupsResponse(res) => {
            filter.on_list_groups_response(ctx, header, res).await
        }
        other => filter.on_response(ctx, header, other).await,
    }
}
