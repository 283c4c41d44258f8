//! Error types for the dnsgate DNS forwarder.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Main error type for dnsgate operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors. These are fatal to [`Forwarder::init`](crate::forwarder::Forwarder::init).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("invalid upstream address {address:?}: {reason}")]
    InvalidUpstream { address: String, reason: String },

    #[error("upstream scheme {0:?} is not built in")]
    UnsupportedScheme(String),

    #[error("invalid custom blocking IPv4 address: {0}")]
    InvalidBlockingIpv4(#[source] AddrParseError),

    #[error("invalid custom blocking IPv6 address: {0}")]
    InvalidBlockingIpv6(#[source] AddrParseError),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Filter-load errors. Non-fatal: a partial load degrades to a warning.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to read rule list {path:?}")]
    ReadSource {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("memory limit reached while loading filter {0}")]
    MemLimitReached(i32),

    #[error("filter {0} is outdated")]
    Outdated(i32),
}

/// Per-query upstream errors. These trigger fallback; if every fallback
/// fails too, the forwarder synthesizes SERVFAIL.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[source] io::Error),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),
}

impl From<io::Error> for UpstreamError {
    fn from(err: io::Error) -> Self {
        Self::Network(err)
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
