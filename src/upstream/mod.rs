//! Upstream DNS servers.
//!
//! [`Upstream`] is the exchange capability the forwarder consumes: send one
//! request message, get one response message. Plain UDP (with a TCP retry on
//! truncation) and plain TCP are built in; encrypted transports are parsed
//! and validated at configuration time but live outside this crate.

mod tcp;
mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;

use crate::error::{ConfigError, UpstreamError};

pub use tcp::TcpUpstream;
pub use udp::UdpUpstream;

/// Default exchange timeout when the configuration does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default DNS port.
pub const DEFAULT_PORT: u16 = 53;

/// A server capable of answering DNS queries.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a request and await the response.
    async fn exchange(&self, request: &Message) -> Result<Message, UpstreamError>;

    /// User-assigned id, reported in events.
    fn id(&self) -> i32;

    /// The configured address, for logs.
    fn address(&self) -> &str;

    /// Smoothed round-trip time of recent exchanges.
    fn rtt(&self) -> Duration;

    /// Feed back the time one exchange took.
    fn adjust_rtt(&self, elapsed: Duration);
}

/// RTT accumulator shared by the transport implementations: a `(old + new) / 2`
/// running average behind a mutex.
#[derive(Debug, Default)]
pub(crate) struct RttEstimate(Mutex<Duration>);

impl RttEstimate {
    pub(crate) fn get(&self) -> Duration {
        *self.0.lock()
    }

    pub(crate) fn adjust(&self, elapsed: Duration) {
        let mut rtt = self.0.lock();
        *rtt = (*rtt + elapsed) / 2;
    }
}

/// Configuration of one upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub address: String,
    pub id: i32,
    pub timeout: Duration,
}

/// An upstream address in one of the recognized syntaxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddress {
    /// `ip` or `ip:port`: plain DNS over UDP with TCP retry on truncation.
    Udp(SocketAddr),
    /// `tcp://ip[:port]`: plain DNS over TCP.
    Tcp(SocketAddr),
    /// `tls://host[:port]`: DNS-over-TLS.
    Tls(String),
    /// `https://host/path`: DNS-over-HTTPS.
    Https(String),
    /// `quic://host[:port]`: DNS-over-QUIC.
    Quic(String),
    /// `sdns://...`: a DNS stamp.
    DnsStamp(String),
}

impl UpstreamAddress {
    /// Parse an upstream address string.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = address.strip_prefix("tcp://") {
            return parse_socket_addr(rest)
                .map(Self::Tcp)
                .ok_or_else(|| invalid("expected ip[:port] after tcp://"));
        }
        if let Some(rest) = address.strip_prefix("tls://") {
            if rest.is_empty() {
                return Err(invalid("empty tls:// address"));
            }
            return Ok(Self::Tls(rest.to_string()));
        }
        if address.starts_with("https://") {
            return Ok(Self::Https(address.to_string()));
        }
        if let Some(rest) = address.strip_prefix("quic://") {
            if rest.is_empty() {
                return Err(invalid("empty quic:// address"));
            }
            return Ok(Self::Quic(rest.to_string()));
        }
        if let Some(rest) = address.strip_prefix("sdns://") {
            if rest.is_empty() {
                return Err(invalid("empty DNS stamp"));
            }
            return Ok(Self::DnsStamp(address.to_string()));
        }

        parse_socket_addr(address)
            .map(Self::Udp)
            .ok_or_else(|| invalid("expected ip[:port]"))
    }
}

/// `ip`, `ip:port` or `[ipv6]:port` into a socket address, defaulting the
/// port to 53.
fn parse_socket_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DEFAULT_PORT));
    }
    None
}

/// Build an upstream from its options. Addresses with schemes this crate
/// does not implement are rejected with [`ConfigError::UnsupportedScheme`].
pub fn make_upstream(options: UpstreamOptions) -> Result<Arc<dyn Upstream>, ConfigError> {
    match UpstreamAddress::parse(&options.address)? {
        UpstreamAddress::Udp(addr) => Ok(Arc::new(UdpUpstream::new(addr, options))),
        UpstreamAddress::Tcp(addr) => Ok(Arc::new(TcpUpstream::new(addr, options))),
        UpstreamAddress::Tls(_) => Err(ConfigError::UnsupportedScheme("tls".to_string())),
        UpstreamAddress::Https(_) => Err(ConfigError::UnsupportedScheme("https".to_string())),
        UpstreamAddress::Quic(_) => Err(ConfigError::UnsupportedScheme("quic".to_string())),
        UpstreamAddress::DnsStamp(_) => Err(ConfigError::UnsupportedScheme("sdns".to_string())),
    }
}

/// Reject a response that does not belong to the request.
pub(crate) fn validate_response(
    request: &Message,
    response: &Message,
) -> Result<(), UpstreamError> {
    if response.id() != request.id() {
        return Err(UpstreamError::BadResponse(format!(
            "response id {} does not match request id {}",
            response.id(),
            request.id()
        )));
    }
    Ok(())
}
