//! A transparent, protocol-aware proxy for the Kafka wire protocol.
//!
//! Clients connect to the proxy instead of the real broker; the proxy
//! terminates the client connection, lazily parses request and response
//! frames, runs an ordered chain of interception [`filter::Filter`]s over
//! the decoded ones, and forwards the (possibly mutated, possibly
//! short-circuited) traffic to an upstream broker chosen by a
//! [`cluster::NetFilter`]. Neither side is aware of the proxy: correlation
//! ids are rewritten on the way up and restored on the way back, and frames
//! nobody subscribed to pass through byte-for-byte.

pub mod api;
pub mod backend;
pub mod chain;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod filter;
pub mod frame;
pub mod frontend;
pub mod haproxy;
pub mod server;
pub mod util;

pub use error::ProxyError;
pub use server::Server;
