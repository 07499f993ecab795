//! Per-api dispatch between raw bytes and the `kafka-protocol` schema types.
//!
//! The proxy only ever decodes the api keys listed here; every other key is
//! legal on the wire but passes through opaque. Filters can therefore only
//! subscribe to keys in this table.

use bytes::BytesMut;
use indexmap::IndexMap;
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::*;
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion};

use crate::error::ProxyError;

/// Api keys the proxy can fully decode, with the version range it speaks.
pub const SUPPORTED_APIS: &[(ApiKey, i16, i16)] = &[
    (ApiKey::ProduceKey, 0, 9),
    (ApiKey::FetchKey, 0, 13),
    (ApiKey::ListOffsetsKey, 0, 7),
    (ApiKey::MetadataKey, 0, 12),
    (ApiKey::OffsetCommitKey, 0, 8),
    (ApiKey::OffsetFetchKey, 0, 8),
    (ApiKey::FindCoordinatorKey, 0, 4),
    (ApiKey::SaslHandshakeKey, 0, 1),
    (ApiKey::ApiVersionsKey, 0, 3),
    (ApiKey::CreateTopicsKey, 0, 7),
    (ApiKey::DeleteTopicsKey, 0, 6),
    (ApiKey::InitProducerIdKey, 0, 4),
    (ApiKey::SaslAuthenticateKey, 0, 2),
    (ApiKey::DescribeGroupsKey, 0, 5),
    (ApiKey::ListGroupsKey, 0, 4),
];

/// Api keys the proxy forwards opaque but still advertises in its canned
/// `ApiVersions` response, so clients keep using them through the proxy.
const PASSTHROUGH_APIS: &[(i16, i16, i16)] = &[
    (11, 0, 7), // JoinGroup
    (12, 0, 4), // Heartbeat
    (13, 0, 4), // LeaveGroup
    (14, 0, 5), // SyncGroup
    (21, 0, 2), // DeleteRecords
    (32, 0, 4), // DescribeConfigs
    (33, 0, 2), // AlterConfigs
    (42, 0, 2), // DeleteGroups
];

pub fn is_supported(api_key: i16) -> bool {
    SUPPORTED_APIS.iter().any(|(key, _, _)| *key as i16 == api_key)
}

fn unsupported(api_key: i16) -> ProxyError {
    ProxyError::MalformedFrame(format!("unsupported api key {api_key}"))
}

fn api_key(raw: i16) -> Result<ApiKey, ProxyError> {
    ApiKey::try_from(raw).map_err(|_| unsupported(raw))
}

/// Header version of a request with the given api key and version.
pub fn request_header_version(key: i16, api_version: i16) -> Result<i16, ProxyError> {
    Ok(match api_key(key)? {
        ApiKey::ProduceKey => ProduceRequest::header_version(api_version),
        ApiKey::FetchKey => FetchRequest::header_version(api_version),
        ApiKey::ListOffsetsKey => ListOffsetsRequest::header_version(api_version),
        ApiKey::MetadataKey => MetadataRequest::header_version(api_version),
        ApiKey::OffsetCommitKey => OffsetCommitRequest::header_version(api_version),
        ApiKey::OffsetFetchKey => OffsetFetchRequest::header_version(api_version),
        ApiKey::FindCoordinatorKey => FindCoordinatorRequest::header_version(api_version),
        ApiKey::SaslHandshakeKey => SaslHandshakeRequest::header_version(api_version),
        ApiKey::ApiVersionsKey => ApiVersionsRequest::header_version(api_version),
        ApiKey::CreateTopicsKey => CreateTopicsRequest::header_version(api_version),
        ApiKey::DeleteTopicsKey => DeleteTopicsRequest::header_version(api_version),
        ApiKey::InitProducerIdKey => InitProducerIdRequest::header_version(api_version),
        ApiKey::SaslAuthenticateKey => SaslAuthenticateRequest::header_version(api_version),
        ApiKey::DescribeGroupsKey => DescribeGroupsRequest::header_version(api_version),
        ApiKey::ListGroupsKey => ListGroupsRequest::header_version(api_version),
        _ => return Err(unsupported(key)),
    })
}

/// Header version of a response with the given api key and version.
///
/// `ApiVersions` responses use header version 0 whatever the body version;
/// the generated `HeaderVersion` impl encodes that rule.
pub fn response_header_version(key: i16, api_version: i16) -> Result<i16, ProxyError> {
    Ok(match api_key(key)? {
        ApiKey::ProduceKey => ProduceResponse::header_version(api_version),
        ApiKey::FetchKey => FetchResponse::header_version(api_version),
        ApiKey::ListOffsetsKey => ListOffsetsResponse::header_version(api_version),
        ApiKey::MetadataKey => MetadataResponse::header_version(api_version),
        ApiKey::OffsetCommitKey => OffsetCommitResponse::header_version(api_version),
        ApiKey::OffsetFetchKey => OffsetFetchResponse::header_version(api_version),
        ApiKey::FindCoordinatorKey => FindCoordinatorResponse::header_version(api_version),
        ApiKey::SaslHandshakeKey => SaslHandshakeResponse::header_version(api_version),
        ApiKey::ApiVersionsKey => ApiVersionsResponse::header_version(api_version),
        ApiKey::CreateTopicsKey => CreateTopicsResponse::header_version(api_version),
        ApiKey::DeleteTopicsKey => DeleteTopicsResponse::header_version(api_version),
        ApiKey::InitProducerIdKey => InitProducerIdResponse::header_version(api_version),
        ApiKey::SaslAuthenticateKey => SaslAuthenticateResponse::header_version(api_version),
        ApiKey::DescribeGroupsKey => DescribeGroupsResponse::header_version(api_version),
        ApiKey::ListGroupsKey => ListGroupsResponse::header_version(api_version),
        _ => return Err(unsupported(key)),
    })
}

/// Decode a request body. The buffer must be positioned just past the header.
pub fn decode_request_body(
    key: i16,
    buf: &mut BytesMut,
    api_version: i16,
) -> Result<RequestKind, ProxyError> {
    Ok(match api_key(key)? {
        ApiKey::ProduceKey => {
            RequestKind::ProduceRequest(ProduceRequest::decode(buf, api_version)?)
        }
        ApiKey::FetchKey => RequestKind::FetchRequest(FetchRequest::decode(buf, api_version)?),
        ApiKey::ListOffsetsKey => {
            RequestKind::ListOffsetsRequest(ListOffsetsRequest::decode(buf, api_version)?)
        }
        ApiKey::MetadataKey => {
            RequestKind::MetadataRequest(MetadataRequest::decode(buf, api_version)?)
        }
        ApiKey::OffsetCommitKey => {
            RequestKind::OffsetCommitRequest(OffsetCommitRequest::decode(buf, api_version)?)
        }
        ApiKey::OffsetFetchKey => {
            RequestKind::OffsetFetchRequest(OffsetFetchRequest::decode(buf, api_version)?)
        }
        ApiKey::FindCoordinatorKey => {
            RequestKind::FindCoordinatorRequest(FindCoordinatorRequest::decode(buf, api_version)?)
        }
        ApiKey::SaslHandshakeKey => {
            RequestKind::SaslHandshakeRequest(SaslHandshakeRequest::decode(buf, api_version)?)
        }
        ApiKey::ApiVersionsKey => {
            RequestKind::ApiVersionsRequest(ApiVersionsRequest::decode(buf, api_version)?)
        }
        ApiKey::CreateTopicsKey => {
            RequestKind::CreateTopicsRequest(CreateTopicsRequest::decode(buf, api_version)?)
        }
        ApiKey::DeleteTopicsKey => {
            RequestKind::DeleteTopicsRequest(DeleteTopicsRequest::decode(buf, api_version)?)
        }
        ApiKey::InitProducerIdKey => {
            RequestKind::InitProducerIdRequest(InitProducerIdRequest::decode(buf, api_version)?)
        }
        ApiKey::SaslAuthenticateKey => {
            RequestKind::SaslAuthenticateRequest(SaslAuthenticateRequest::decode(buf, api_version)?)
        }
        ApiKey::DescribeGroupsKey => {
            RequestKind::DescribeGroupsRequest(DescribeGroupsRequest::decode(buf, api_version)?)
        }
        ApiKey::ListGroupsKey => {
            RequestKind::ListGroupsRequest(ListGroupsRequest::decode(buf, api_version)?)
        }
        _ => return Err(unsupported(key)),
    })
}

/// Encode a request body after its header.
pub fn encode_request_body(
    body: &RequestKind,
    buf: &mut BytesMut,
    api_version: i16,
) -> Result<(), ProxyError> {
    match body {
        RequestKind::ProduceRequest(req) => req.encode(buf, api_version)?,
        RequestKind::FetchRequest(req) => req.encode(buf, api_version)?,
        RequestKind::ListOffsetsRequest(req) => req.encode(buf, api_version)?,
        RequestKind::MetadataRequest(req) => req.encode(buf, api_version)?,
        RequestKind::OffsetCommitRequest(req) => req.encode(buf, api_version)?,
        RequestKind::OffsetFetchRequest(req) => req.encode(buf, api_version)?,
        RequestKind::FindCoordinatorRequest(req) => req.encode(buf, api_version)?,
        RequestKind::SaslHandshakeRequest(req) => req.encode(buf, api_version)?,
        RequestKind::ApiVersionsRequest(req) => req.encode(buf, api_version)?,
        RequestKind::CreateTopicsRequest(req) => req.encode(buf, api_version)?,
        RequestKind::DeleteTopicsRequest(req) => req.encode(buf, api_version)?,
        RequestKind::InitProducerIdRequest(req) => req.encode(buf, api_version)?,
        RequestKind::SaslAuthenticateRequest(req) => req.encode(buf, api_version)?,
        RequestKind::DescribeGroupsRequest(req) => req.encode(buf, api_version)?,
        RequestKind::ListGroupsRequest(req) => req.encode(buf, api_version)?,
        other => {
            return Err(ProxyError::MalformedFrame(format!(
                "cannot encode unsupported request {other:?}"
            )))
        }
    }
    Ok(())
}

/// Decode a response body. The buffer must be positioned just past the header.
pub fn decode_response_body(
    key: i16,
    buf: &mut BytesMut,
    api_version: i16,
) -> Result<ResponseKind, ProxyError> {
    Ok(match api_key(key)? {
        ApiKey::ProduceKey => {
            ResponseKind::ProduceResponse(ProduceResponse::decode(buf, api_version)?)
        }
        ApiKey::FetchKey => ResponseKind::FetchResponse(FetchResponse::decode(buf, api_version)?),
        ApiKey::ListOffsetsKey => {
            ResponseKind::ListOffsetsResponse(ListOffsetsResponse::decode(buf, api_version)?)
        }
        ApiKey::MetadataKey => {
            ResponseKind::MetadataResponse(MetadataResponse::decode(buf, api_version)?)
        }
        ApiKey::OffsetCommitKey => {
            ResponseKind::OffsetCommitResponse(OffsetCommitResponse::decode(buf, api_version)?)
        }
        ApiKey::OffsetFetchKey => {
            ResponseKind::OffsetFetchResponse(OffsetFetchResponse::decode(buf, api_version)?)
        }
        ApiKey::FindCoordinatorKey => {
            ResponseKind::FindCoordinatorResponse(FindCoordinatorResponse::decode(buf, api_version)?)
        }
        ApiKey::SaslHandshakeKey => {
            ResponseKind::SaslHandshakeResponse(SaslHandshakeResponse::decode(buf, api_version)?)
        }
        ApiKey::ApiVersionsKey => {
            ResponseKind::ApiVersionsResponse(ApiVersionsResponse::decode(buf, api_version)?)
        }
        ApiKey::CreateTopicsKey => {
            ResponseKind::CreateTopicsResponse(CreateTopicsResponse::decode(buf, api_version)?)
        }
        ApiKey::DeleteTopicsKey => {
            ResponseKind::DeleteTopicsResponse(DeleteTopicsResponse::decode(buf, api_version)?)
        }
        ApiKey::InitProducerIdKey => {
            ResponseKind::InitProducerIdResponse(InitProducerIdResponse::decode(buf, api_version)?)
        }
        ApiKey::SaslAuthenticateKey => ResponseKind::SaslAuthenticateResponse(
            SaslAuthenticateResponse::decode(buf, api_version)?,
        ),
        ApiKey::DescribeGroupsKey => {
            ResponseKind::DescribeGroupsResponse(DescribeGroupsResponse::decode(buf, api_version)?)
        }
        ApiKey::ListGroupsKey => {
            ResponseKind::ListGroupsResponse(ListGroupsResponse::decode(buf, api_version)?)
        }
        _ => return Err(unsupported(key)),
    })
}

/// Encode a response body after its header.
pub fn encode_response_body(
    body: &ResponseKind,
    buf: &mut BytesMut,
    api_version: i16,
) -> Result<(), ProxyError> {
    match body {
        ResponseKind::ProduceResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::FetchResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::ListOffsetsResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::MetadataResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::OffsetCommitResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::OffsetFetchResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::FindCoordinatorResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::SaslHandshakeResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::ApiVersionsResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::CreateTopicsResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::DeleteTopicsResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::InitProducerIdResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::SaslAuthenticateResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::DescribeGroupsResponse(res) => res.encode(buf, api_version)?,
        ResponseKind::ListGroupsResponse(res) => res.encode(buf, api_version)?,
        other => {
            return Err(ProxyError::MalformedFrame(format!(
                "cannot encode unsupported response {other:?}"
            )))
        }
    }
    Ok(())
}

/// Api key of a decoded request body.
pub fn request_body_api_key(body: &RequestKind) -> Result<i16, ProxyError> {
    Ok(match body {
        RequestKind::ProduceRequest(_) => ApiKey::ProduceKey as i16,
        RequestKind::FetchRequest(_) => ApiKey::FetchKey as i16,
        RequestKind::ListOffsetsRequest(_) => ApiKey::ListOffsetsKey as i16,
        RequestKind::MetadataRequest(_) => ApiKey::MetadataKey as i16,
        RequestKind::OffsetCommitRequest(_) => ApiKey::OffsetCommitKey as i16,
        RequestKind::OffsetFetchRequest(_) => ApiKey::OffsetFetchKey as i16,
        RequestKind::FindCoordinatorRequest(_) => ApiKey::FindCoordinatorKey as i16,
        RequestKind::SaslHandshakeRequest(_) => ApiKey::SaslHandshakeKey as i16,
        RequestKind::ApiVersionsRequest(_) => ApiKey::ApiVersionsKey as i16,
        RequestKind::CreateTopicsRequest(_) => ApiKey::CreateTopicsKey as i16,
        RequestKind::DeleteTopicsRequest(_) => ApiKey::DeleteTopicsKey as i16,
        RequestKind::InitProducerIdRequest(_) => ApiKey::InitProducerIdKey as i16,
        RequestKind::SaslAuthenticateRequest(_) => ApiKey::SaslAuthenticateKey as i16,
        RequestKind::DescribeGroupsRequest(_) => ApiKey::DescribeGroupsKey as i16,
        RequestKind::ListGroupsRequest(_) => ApiKey::ListGroupsKey as i16,
        other => {
            return Err(ProxyError::MalformedFrame(format!(
                "unsupported request {other:?}"
            )))
        }
    })
}

/// The canned `ApiVersions` response body served without contacting a broker.
pub fn canned_api_versions() -> ApiVersionsResponse {
    let mut api_keys = IndexMap::new();
    for (key, min, max) in SUPPORTED_APIS {
        let mut version = ApiVersion::default();
        version.min_version = *min;
        version.max_version = *max;
        api_keys.insert(*key as i16, version);
    }
    for (key, min, max) in PASSTHROUGH_APIS {
        let mut version = ApiVersion::default();
        version.min_version = *min;
        version.max_version = *max;
        api_keys.insert(*key, version);
    }
    let mut response = ApiVersionsResponse::default();
    response.error_code = 0;
    response.api_keys = api_keys;
    response
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn produce_is_supported_join_group_is_not() {
        assert!(is_supported(ApiKey::ProduceKey as i16));
        assert!(!is_supported(11));
    }

    #[rstest]
    #[case(ApiKey::ApiVersionsKey as i16, 0)]
    #[case(ApiKey::ApiVersionsKey as i16, 3)]
    fn api_versions_response_header_is_always_v0(#[case] key: i16, #[case] version: i16) {
        assert_eq!(response_header_version(key, version).unwrap(), 0);
    }

    #[test]
    fn canned_api_versions_covers_the_supported_set() {
        let canned = canned_api_versions();
        for (key, min, max) in SUPPORTED_APIS {
            let version = canned.api_keys.get(&(*key as i16)).unwrap();
            assert_eq!(version.min_version, *min);
            assert_eq!(version.max_version, *max);
        }
    }

    #[test]
    fn round_trips_a_metadata_request() {
        let mut body = MetadataRequest::default();
        body.allow_auto_topic_creation = true;
        let mut buf = BytesMut::new();
        encode_request_body(&RequestKind::MetadataRequest(body.clone()), &mut buf, 5).unwrap();
        let decoded = decode_request_body(ApiKey::MetadataKey as i16, &mut buf, 5).unwrap();
        assert_eq!(decoded, RequestKind::MetadataRequest(body));
    }
}
