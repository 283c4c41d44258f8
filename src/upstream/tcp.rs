//! Plain DNS over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{validate_response, RttEstimate, Upstream, UpstreamError, UpstreamOptions};

/// Plain TCP upstream. Messages are framed with the two-byte length prefix
/// of RFC 1035 §4.2.2.
pub struct TcpUpstream {
    addr: SocketAddr,
    options: UpstreamOptions,
    rtt: RttEstimate,
}

impl TcpUpstream {
    #[must_use]
    pub fn new(addr: SocketAddr, options: UpstreamOptions) -> Self {
        Self {
            addr,
            options,
            rtt: RttEstimate::default(),
        }
    }

    /// One exchange without the timeout wrapper; the UDP upstream reuses
    /// this for its truncation retry inside its own deadline.
    pub(crate) async fn exchange_raw(&self, request: &Message) -> Result<Message, UpstreamError> {
        let mut stream = TcpStream::connect(self.addr).await?;

        let payload = request.to_bytes()?;
        let mut framed = Vec::with_capacity(payload.len() + 2);
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(&payload);
        stream.write_all(&framed).await?;

        let mut length = [0u8; 2];
        stream.read_exact(&mut length).await?;
        let mut buffer = vec![0u8; usize::from(u16::from_be_bytes(length))];
        stream.read_exact(&mut buffer).await?;

        Message::from_bytes(&buffer)
            .map_err(|err| UpstreamError::BadResponse(format!("malformed response: {err}")))
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, UpstreamError> {
        let response = tokio::time::timeout(self.options.timeout, self.exchange_raw(request))
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
