//! Descriptors the data plane consumes from the outer layers: the virtual
//! cluster, and the `NetFilter` that chooses an upstream per connection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProxyError;
use crate::filter::{ConnectionInfo, NamedFilter};

/// TLS settings for the broker-facing side. The core only carries the
/// descriptor; termination itself lives outside the data plane.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTls {
    /// Server name to present, when different from the dialed host.
    pub server_name: Option<String>,
}

/// The externally-visible representation of one target cluster.
#[derive(Debug, Clone)]
pub struct VirtualCluster {
    pub name: String,
    pub upstream_tls: Option<UpstreamTls>,
    /// Log every frame's api key, version and correlation id.
    pub log_frames: bool,
    /// Log connection lifecycle events.
    pub log_network: bool,
}

impl VirtualCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            upstream_tls: None,
            log_frames: false,
            log_network: false,
        }
    }
}

/// What the frontend knows about a connection when the upstream is chosen.
pub struct NetFilterContext<'a> {
    pub info: &'a ConnectionInfo,
    pub virtual_cluster: &'a str,
}

/// Where to dial, and which filters to interpose on this connection.
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub filters: Vec<NamedFilter>,
}

/// Chooses the upstream broker for each incoming connection.
#[async_trait]
pub trait NetFilter: Send + Sync {
    async fn select_server(
        &self,
        ctx: &NetFilterContext<'_>,
    ) -> Result<UpstreamTarget, ProxyError>;
}

/// Builds the per-connection filter chain. Instances are owned by the
/// connection; nothing is shared through the core.
pub trait FilterChainFactory: Send + Sync {
    fn build(&self) -> Vec<NamedFilter>;
}

/// The empty chain: a purely transparent proxy.
pub struct EmptyChain;

impl FilterChainFactory for EmptyChain {
    fn build(&self) -> Vec<NamedFilter> {
        Vec::new()
    }
}

/// A `NetFilter` that dials a fixed bootstrap address for every connection.
pub struct StaticNetFilter {
    host: String,
    port: u16,
    factory: Arc<dyn FilterChainFactory>,
}

impl StaticNetFilter {
    pub fn new(host: impl Into<String>, port: u16, factory: Arc<dyn FilterChainFactory>) -> Self {
        Self {
            host: host.into(),
            port,
            factory,
        }
    }
}

#[async_trait]
impl NetFilter for StaticNetFilter {
    async fn select_server(
        &self,
        _ctx: &NetFilterContext<'_>,
    ) -> Result<UpstreamTarget, ProxyError> {
        Ok(UpstreamTarget {
            host: self.host.clone(),
            port: self.port,
            filters: self.factory.build(),
        })
    }
}
