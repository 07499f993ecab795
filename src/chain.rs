//! Invocation of the ordered filter chain over decoded frames.
//!
//! Request hooks run front-to-back, response hooks back-to-front. A filter
//! that short-circuits a request routes its synthesized response through the
//! response hooks of the filters before it, exactly as if the broker had
//! answered from that position in the chain. Every hook runs under a
//! deadline; a timeout or hook error fails the whole connection.

use std::collections::HashSet;
use std::time::Duration;

use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind};
use tokio::time::timeout;

use crate::api;
use crate::codec::DecodePredicate;
use crate::error::ProxyError;
use crate::filter::{
    dispatch_request, dispatch_response, FilterContext, NamedFilter, RequestFilterResult,
    ResponseFilterResult,
};
use crate::frame::{RequestFrame, ResponseFrame};

/// Default per-hook deadline.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(20);

/// What the chain decided about a request.
#[derive(Debug)]
pub enum RequestChainOutcome {
    Forward(RequestFrame),
    ShortCircuit {
        /// The synthesized response, unless a response hook dropped it.
        response: Option<ResponseFrame>,
        close_connection: bool,
    },
    Drop,
}

/// What the chain decided about a response.
#[derive(Debug)]
pub enum ResponseChainOutcome {
    Forward(ResponseFrame),
    Drop,
    Close,
}

/// The per-connection chain plus the context its hooks run against.
pub struct FilterChain {
    filters: Vec<NamedFilter>,
    ctx: FilterContext,
    hook_timeout: Duration,
}

impl FilterChain {
    pub fn new(filters: Vec<NamedFilter>, ctx: FilterContext, hook_timeout: Duration) -> Self {
        Self {
            filters,
            ctx,
            hook_timeout,
        }
    }

    /// The predicate matching exactly what this set of filters subscribed to.
    pub fn decode_predicate(filters: &[NamedFilter]) -> DecodePredicate {
        let mut requests = HashSet::new();
        let mut responses = HashSet::new();
        for (key, _, _) in api::SUPPORTED_APIS {
            for named in filters {
                if named.filter.wants_request(*key) {
                    requests.insert(*key as i16);
                }
                if named.filter.wants_response(*key) {
                    responses.insert(*key as i16);
                }
            }
        }
        DecodePredicate::Subscribed {
            requests,
            responses,
        }
    }

    /// Run a decoded request through the chain, front to back.
    pub async fn run_request(
        &mut self,
        header: RequestHeader,
        body: RequestKind,
        has_response: bool,
    ) -> Result<RequestChainOutcome, ProxyError> {
        let api_key = header.request_api_key;
        let api_version = header.request_api_version;
        let downstream_id = header.correlation_id;
        let key = typed_key(api_key)?;

        let mut header = header;
        let mut body = body;
        for index in 0..self.filters.len() {
            if !self.filters[index].filter.wants_request(key) {
                continue;
            }
            let name = self.filters[index].name.clone();
            let hook = dispatch_request(
                self.filters[index].filter.as_mut(),
                &mut self.ctx,
                header,
                body,
            );
            let result = match timeout(self.hook_timeout, hook).await {
                Err(_) => return Err(ProxyError::FilterTimeout { filter: name }),
                Ok(Err(err)) => {
                    return Err(ProxyError::FilterError {
                        filter: name,
                        message: err.to_string(),
                    })
                }
                Ok(Ok(result)) => result,
            };
            match result {
                RequestFilterResult::Forward {
                    header: next_header,
                    body: next_body,
                } => {
                    header = next_header;
                    body = next_body;
                }
                RequestFilterResult::ShortCircuit {
                    body: response_body,
                    close_connection,
                } => {
                    let mut response_header = ResponseHeader::default();
                    response_header.correlation_id = downstream_id;
                    let outcome = self
                        .run_response_from(index, api_key, api_version, response_header, response_body)
                        .await?;
                    let (response, close_from_response) = match outcome {
                        ResponseChainOutcome::Forward(frame) => (Some(frame), false),
                        ResponseChainOutcome::Drop => (None, false),
                        ResponseChainOutcome::Close => (None, true),
                    };
                    return Ok(RequestChainOutcome::ShortCircuit {
                        response,
                        close_connection: close_connection || close_from_response,
                    });
                }
                RequestFilterResult::Drop => return Ok(RequestChainOutcome::Drop),
            }
        }
        Ok(RequestChainOutcome::Forward(RequestFrame::Decoded {
            header,
            body,
            has_response,
            promise: None,
        }))
    }

    /// Run a decoded response through the whole chain, back to front.
    pub async fn run_response(
        &mut self,
        api_key: i16,
        api_version: i16,
        header: ResponseHeader,
        body: ResponseKind,
    ) -> Result<ResponseChainOutcome, ProxyError> {
        self.run_response_from(self.filters.len(), api_key, api_version, header, body)
            .await
    }

    /// Run response hooks of filters below `limit`, in reverse order.
    async fn run_response_from(
        &mut self,
        limit: usize,
        api_key: i16,
        api_version: i16,
        mut header: ResponseHeader,
        mut body: ResponseKind,
    ) -> Result<ResponseChainOutcome, ProxyError> {
        let key = typed_key(api_key)?;
        for index in (0..limit).rev() {
            if !self.filters[index].filter.wants_response(key) {
                continue;
            }
            let name = self.filters[index].name.clone();
            let hook = dispatch_response(
                self.filters[index].filter.as_mut(),
                &mut self.ctx,
                header,
                body,
            );
            let result = match timeout(self.hook_timeout, hook).await {
                Err(_) => return Err(ProxyError::FilterTimeout { filter: name }),
                Ok(Err(err)) => {
                    return Err(ProxyError::FilterError {
                        filter: name,
                        message: err.to_string(),
                    })
                }
                Ok(Ok(result)) => result,
            };
            match result {
                ResponseFilterResult::Forward {
                    header: next_header,
                    body: next_body,
                } => {
                    header = next_header;
                    body = next_body;
                }
                ResponseFilterResult::Drop => return Ok(ResponseChainOutcome::Drop),
                ResponseFilterResult::Close => return Ok(ResponseChainOutcome::Close),
            }
        }
        Ok(ResponseChainOutcome::Forward(ResponseFrame::Decoded {
            api_key,
            api_version,
            header,
            body,
        }))
    }
}

fn typed_key(api_key: i16) -> Result<ApiKey, ProxyError> {
    ApiKey::try_from(api_key)
        .map_err(|_| ProxyError::MalformedFrame(format!("unknown api key {api_key}")))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, RwLock};

    use async_trait::async_trait;
    use kafka_protocol::messages::{MetadataRequest, MetadataResponse};
    use tokio::sync::mpsc;

    use crate::cluster::VirtualCluster;
    use crate::filter::Filter;

    use super::*;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records hook invocations; optionally short-circuits metadata requests.
    struct Recording {
        tag: &'static str,
        journal: Journal,
        short_circuit: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Filter for Recording {
        fn wants_request(&self, api_key: ApiKey) -> bool {
            api_key == ApiKey::MetadataKey
        }

        fn wants_response(&self, api_key: ApiKey) -> bool {
            api_key == ApiKey::MetadataKey
        }

        async fn on_request(
            &mut self,
            _ctx: &mut FilterContext,
            header: RequestHeader,
            body: RequestKind,
        ) -> Result<RequestFilterResult, ProxyError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.journal.lock().unwrap().push(format!("{}:req", self.tag));
            if self.short_circuit {
                return Ok(RequestFilterResult::short_circuit(
                    ResponseKind::MetadataResponse(MetadataResponse::default()),
                ));
            }
            Ok(RequestFilterResult::forward(header, body))
        }

        async fn on_response(
            &mut self,
            _ctx: &mut FilterContext,
            header: ResponseHeader,
            body: ResponseKind,
        ) -> Result<ResponseFilterResult, ProxyError> {
            self.journal.lock().unwrap().push(format!("{}:res", self.tag));
            Ok(ResponseFilterResult::forward(header, body))
        }
    }

    fn chain_with(filters: Vec<NamedFilter>, hook_timeout: Duration) -> FilterChain {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = FilterContext::new(
            Arc::new(RwLock::new(Default::default())),
            Arc::new(VirtualCluster::new("test")),
            tx,
            "test-channel".to_string(),
        );
        FilterChain::new(filters, ctx, hook_timeout)
    }

    fn metadata_header(correlation_id: i32) -> RequestHeader {
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::MetadataKey as i16;
        header.request_api_version = 5;
        header.correlation_id = correlation_id;
        header
    }

    fn recording(tag: &'static str, journal: &Journal, short_circuit: bool) -> NamedFilter {
        NamedFilter::new(
            tag,
            Recording {
                tag,
                journal: Arc::clone(journal),
                short_circuit,
                delay: None,
            },
        )
    }

    #[tokio::test]
    async fn requests_run_front_to_back_and_responses_in_reverse() {
        let journal: Journal = Default::default();
        let mut chain = chain_with(
            vec![
                recording("a", &journal, false),
                recording("b", &journal, false),
            ],
            DEFAULT_HOOK_TIMEOUT,
        );

        let outcome = chain
            .run_request(
                metadata_header(1),
                RequestKind::MetadataRequest(MetadataRequest::default()),
                true,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RequestChainOutcome::Forward(_)));

        let mut header = ResponseHeader::default();
        header.correlation_id = 1;
        chain
            .run_response(
                ApiKey::MetadataKey as i16,
                5,
                header,
                ResponseKind::MetadataResponse(MetadataResponse::default()),
            )
            .await
            .unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["a:req", "b:req", "b:res", "a:res"]
        );
    }

    #[tokio::test]
    async fn short_circuit_routes_back_through_earlier_filters_only() {
        let journal: Journal = Default::default();
        let mut chain = chain_with(
            vec![
                recording("a", &journal, false),
                recording("b", &journal, true),
                recording("c", &journal, false),
            ],
            DEFAULT_HOOK_TIMEOUT,
        );

        let outcome = chain
            .run_request(
                metadata_header(7),
                RequestKind::MetadataRequest(MetadataRequest::default()),
                true,
            )
            .await
            .unwrap();

        match outcome {
            RequestChainOutcome::ShortCircuit {
                response: Some(ResponseFrame::Decoded { header, .. }),
                close_connection,
            } => {
                assert_eq!(header.correlation_id, 7);
                assert!(!close_connection);
            }
            other => panic!("expected short circuit with response, got {other:?}"),
        }
        // Filter c never saw the request; only a saw the response.
        assert_eq!(*journal.lock().unwrap(), vec!["a:req", "b:req", "a:res"]);
    }

    #[tokio::test]
    async fn unsubscribed_filters_are_skipped() {
        struct Deaf;
        #[async_trait]
        impl Filter for Deaf {}

        let journal: Journal = Default::default();
        let mut chain = chain_with(
            vec![
                NamedFilter::new("deaf", Deaf),
                recording("a", &journal, false),
            ],
            DEFAULT_HOOK_TIMEOUT,
        );
        chain
            .run_request(
                metadata_header(3),
                RequestKind::MetadataRequest(MetadataRequest::default()),
                true,
            )
            .await
            .unwrap();
        assert_eq!(*journal.lock().unwrap(), vec!["a:req"]);
    }

    #[tokio::test]
    async fn a_stalled_hook_times_out() {
        let journal: Journal = Default::default();
        let stalled = NamedFilter::new(
            "stalled",
            Recording {
                tag: "stalled",
                journal: Arc::clone(&journal),
                short_circuit: false,
                delay: Some(Duration::from_millis(200)),
            },
        );
        let mut chain = chain_with(vec![stalled], Duration::from_millis(20));
        let err = chain
            .run_request(
                metadata_header(1),
                RequestKind::MetadataRequest(MetadataRequest::default()),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::FilterTimeout { filter } if filter == "stalled"));
    }

    #[test]
    fn predicate_reflects_subscriptions() {
        let journal: Journal = Default::default();
        let filters = vec![recording("a", &journal, false)];
        let predicate = FilterChain::decode_predicate(&filters);
        assert!(predicate.wants_request(ApiKey::MetadataKey as i16));
        assert!(predicate.wants_response(ApiKey::MetadataKey as i16));
        assert!(!predicate.wants_request(ApiKey::ProduceKey as i16));
    }
}
