//! Plain DNS over UDP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tracing::debug;

use super::{validate_response, RttEstimate, Upstream, UpstreamError, UpstreamOptions};
use crate::upstream::TcpUpstream;

/// Large enough for any EDNS-advertised UDP payload.
const RESPONSE_BUFFER_SIZE: usize = 65535;

/// Plain UDP upstream. A truncated answer is retried over TCP, per
/// RFC 1035 §4.2.1.
pub struct UdpUpstream {
    addr: SocketAddr,
    options: UpstreamOptions,
    rtt: RttEstimate,
}

impl UdpUpstream {
    #[must_use]
    pub fn new(addr: SocketAddr, options: UpstreamOptions) -> Self {
        Self {
            addr,
            options,
            rtt: RttEstimate::default(),
        }
    }

    async fn exchange_udp(&self, request: &Message) -> Result<Message, UpstreamError> {
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;

        socket.send(&request.to_bytes()?).await?;

        let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];
        loop {
            let len = socket.recv(&mut buffer).await?;
            match Message::from_bytes(&buffer[..len]) {
                Ok(response) if response.id() == request.id() => return Ok(response),
                Ok(_) => debug!("dropping response with mismatched id from {}", self.addr),
                Err(err) => {
                    return Err(UpstreamError::BadResponse(format!(
                        "malformed response: {err}"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, UpstreamError> {
        let exchange = async {
            let response = self.exchange_udp(request).await?;
            if response.truncated() {
                debug!("truncated response from {}, retrying over TCP", self.addr);
                let tcp = TcpUpstream::new(self.addr, self.options.clone());
                return tcp.exchange_raw(request).await;
            }
            Ok(response)
        };

        let response = tokio::time::timeout(self.options.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        validate_response(request, &response)?;
        Ok(response)
    }

    fn id(&self) -> i32 {
        self.options.id
    }

    fn address(&self) -> &str {
        &self.options.address
    }

    fn rtt(&self) -> Duration {
        self.rtt.get()
    }

    fn adjust_rtt(&self, elapsed: Duration) {
        self.rtt.adjust(elapsed);
    }
}
