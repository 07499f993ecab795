//! Accept loop binding the data plane together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api;
use crate::cluster::{EmptyChain, NetFilter, StaticNetFilter, VirtualCluster};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::frontend::{handle_connection, ConnectionOptions};
use crate::util::parse_host_port;

/// A configured proxy, ready to bind.
pub struct Server {
    config: ProxyConfig,
    cluster: Arc<VirtualCluster>,
    net_filter: Arc<dyn NetFilter>,
}

impl Server {
    /// A proxy with a caller-supplied `NetFilter` (and hence filter chains).
    pub fn new(config: ProxyConfig, net_filter: Arc<dyn NetFilter>) -> Self {
        let cluster = Arc::new(config.virtual_cluster());
        Self {
            config,
            cluster,
            net_filter,
        }
    }

    /// A purely transparent proxy toward the configured upstream.
    pub fn transparent(config: ProxyConfig) -> Result<Self, ProxyError> {
        let (host, port) = parse_host_port(&config.upstream)?;
        let net_filter = Arc::new(StaticNetFilter::new(host, port, Arc::new(EmptyChain)));
        Ok(Self::new(config, net_filter))
    }

    /// Bind the listen address without accepting yet.
    pub async fn bind(self) -> Result<BoundServer, ProxyError> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(addr = %self.config.listen, cluster = %self.cluster.name, "listening for kafka clients");
        let opts = ConnectionOptions {
            cluster: Arc::clone(&self.cluster),
            net_filter: Arc::clone(&self.net_filter),
            api_versions: Arc::new(api::canned_api_versions()),
            filter_timeout: self.config.filter_timeout(),
            connect_timeout: self.config.connect_timeout(),
            max_frame_bytes: self.config.max_frame_bytes,
            intercept_api_versions: self.config.intercept_api_versions,
            observe_sasl: self.config.observe_sasl,
        };
        Ok(BoundServer { listener, opts })
    }

    /// Bind and serve until the process exits.
    pub async fn listen(self) -> Result<(), ProxyError> {
        self.bind().await?.serve().await
    }
}

/// A proxy with its listener bound.
pub struct BoundServer {
    listener: TcpListener,
    opts: ConnectionOptions,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), ProxyError> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            let conn_id = Uuid::new_v4();
            if self.opts.cluster.log_network {
                info!(%conn_id, %addr, "accepted connection");
            }
            let opts = self.opts.clone();
            tokio::spawn(
                async move {
                    match handle_connection(conn_id, opts, socket).await {
                        Ok(_) => info!("connection exited"),
                        Err(err) => warn!(%err, "connection exited with error"),
                    }
                }
                .instrument(info_span!("proxy", %conn_id)),
            );
        }
    }
}
