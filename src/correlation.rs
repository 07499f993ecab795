//! Tracking of in-flight requests on a broker connection.
//!
//! The proxy rewrites every upstream correlation id from a per-connection
//! monotonic counter; this table remembers what the client originally sent so
//! the matching response can be routed back. Requests that expect no response
//! (Produce with acks=0) are never inserted.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;

use crate::error::ProxyError;
use crate::frame::ResponsePromise;

/// What we need to remember about one in-flight request.
#[derive(Debug)]
pub struct CorrelationEntry {
    /// Correlation id the client assigned; restored on the way back.
    pub downstream_id: i32,
    pub api_key: i16,
    pub api_version: i16,
    /// Whether the response body should be decoded rather than passed opaque.
    pub decode_response: bool,
    /// Present when the request was solicited by a filter; the response
    /// resolves this promise and never reaches the client.
    pub promise: Option<ResponsePromise>,
}

/// Per-broker-connection correlation table.
///
/// Shared between the request encoder and the response decoder of one
/// upstream connection; never shared across connections.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    next_id: AtomicI32,
    inflight: DashMap<i32, CorrelationEntry>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next upstream correlation id, inserting `entry` when the
    /// request expects a response.
    pub fn assign(&self, has_response: bool, entry: CorrelationEntry) -> i32 {
        let upstream_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if has_response {
            self.inflight.insert(upstream_id, entry);
        }
        upstream_id
    }

    /// Look up and remove the entry for a response that just arrived.
    pub fn consume(&self, upstream_id: i32) -> Result<CorrelationEntry, ProxyError> {
        self.inflight
            .remove(&upstream_id)
            .map(|(_, entry)| entry)
            .ok_or(ProxyError::UnknownCorrelation(upstream_id))
    }

    /// Fail every outstanding promise; called when the upstream closes.
    pub fn cancel_all(&self) {
        let pending: Vec<i32> = self.inflight.iter().map(|entry| *entry.key()).collect();
        for upstream_id in pending {
            if let Some((_, entry)) = self.inflight.remove(&upstream_id) {
                if let Some(promise) = entry.promise {
                    let _ = promise.send(Err(ProxyError::UpstreamClosed));
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    fn entry(downstream_id: i32) -> CorrelationEntry {
        CorrelationEntry {
            downstream_id,
            api_key: 3,
            api_version: 5,
            decode_response: false,
            promise: None,
        }
    }

    #[test]
    fn ids_are_monotonic_from_zero() {
        let map = CorrelationMap::new();
        assert_eq!(map.assign(true, entry(10)), 0);
        assert_eq!(map.assign(false, entry(11)), 1);
        assert_eq!(map.assign(true, entry(12)), 2);
    }

    #[test]
    fn fire_and_forget_requests_are_not_tracked() {
        let map = CorrelationMap::new();
        let id = map.assign(false, entry(45));
        assert_eq!(map.in_flight(), 0);
        assert!(matches!(
            map.consume(id),
            Err(ProxyError::UnknownCorrelation(_))
        ));
    }

    #[test]
    fn consume_removes_the_entry() {
        let map = CorrelationMap::new();
        let id = map.assign(true, entry(45));
        let entry = map.consume(id).unwrap();
        assert_eq!(entry.downstream_id, 45);
        assert_eq!(map.in_flight(), 0);
        assert!(map.consume(id).is_err());
    }

    #[test]
    fn cancel_all_fails_outstanding_promises() {
        let map = CorrelationMap::new();
        let (tx, mut rx) = oneshot::channel();
        map.assign(
            true,
            CorrelationEntry {
                downstream_id: 1,
                api_key: 3,
                api_version: 5,
                decode_response: true,
                promise: Some(tx),
            },
        );
        map.cancel_all();
        assert_eq!(map.in_flight(), 0);
        match rx.try_recv() {
            Ok(Err(ProxyError::UpstreamClosed)) => {}
            other => panic!("expected cancelled promise, got {other:?}"),
        }
    }
}
