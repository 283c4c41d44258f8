//! Server orchestration.
//!
//! Binds the UDP and TCP listeners, feeds incoming wire messages to the
//! forwarder, runs the periodic filter update task and, when enabled,
//! exposes the query counters to Prometheus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::forwarder::{Forwarder, MessageInfo, Transport};

/// Largest DNS message we accept from a client.
const MAX_MESSAGE_SIZE: usize = 65535;

/// Start the Prometheus scrape endpoint. With metrics disabled nothing is
/// installed; the `metrics` facade then swallows the query counters, so the
/// forwarder emits them unconditionally either way.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()?;
    info!("metrics exporter listening on {}", config.listen);
    Ok(())
}

/// Run the UDP and TCP listeners plus the filter update task until `running`
/// clears.
pub async fn run_server(forwarder: Arc<Forwarder>, running: Arc<AtomicBool>) -> Result<()> {
    let bind = forwarder.config().bind;
    let udp = Arc::new(UdpSocket::bind(bind).await?);
    let tcp = TcpListener::bind(bind).await?;
    info!("listening on {bind} (udp and tcp)");

    let update_interval = Duration::from_secs(forwarder.config().filter_update_interval_secs);
    let engine = forwarder.engine();
    let updater_running = Arc::clone(&running);
    let _updater = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !updater_running.load(Ordering::SeqCst) {
                break;
            }
            let engine = Arc::clone(&engine);
            let _ = tokio::task::spawn_blocking(move || engine.refresh_outdated()).await;
        }
    });

    let tcp_forwarder = Arc::clone(&forwarder);
    let tcp_running = Arc::clone(&running);
    let _acceptor = tokio::spawn(async move {
        loop {
            let (stream, peer) = match tcp.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("tcp accept failed: {err}");
                    continue;
                }
            };
            if !tcp_running.load(Ordering::SeqCst) {
                break;
            }
            let forwarder = Arc::clone(&tcp_forwarder);
            let _ = tokio::spawn(async move {
                if let Err(err) = serve_tcp_client(forwarder, stream, peer).await {
                    debug!("tcp client {peer}: {err}");
                }
            });
        }
    });

    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    while running.load(Ordering::SeqCst) {
        let (len, peer) = match udp.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                warn!("udp receive failed: {err}");
                continue;
            }
        };

        let message = buffer[..len].to_vec();
        let forwarder = Arc::clone(&forwarder);
        let socket = Arc::clone(&udp);
        let _ = tokio::spawn(async move {
            let info = MessageInfo {
                peer,
                transport: Transport::Udp,
            };
            if let Some(response) = forwarder.handle_message(&message, Some(info)).await {
                if let Err(err) = socket.send_to(&response, peer).await {
                    warn!("failed to send response to {peer}: {err}");
                }
            }
        });
    }

    Ok(())
}

/// Serve one TCP client: length-prefixed requests in, length-prefixed
/// responses out, until the peer closes.
async fn serve_tcp_client(
    forwarder: Arc<Forwarder>,
    mut stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> std::io::Result<()> {
    loop {
        let mut length = [0u8; 2];
        if stream.read_exact(&mut length).await.is_err() {
            return Ok(()); // peer closed
        }
        let mut message = vec![0u8; usize::from(u16::from_be_bytes(length))];
        stream.read_exact(&mut message).await?;

        let info = MessageInfo {
            peer,
            transport: Transport::Tcp,
        };
        let Some(response) = forwarder.handle_message(&message, Some(info)).await else {
            continue;
        };

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        stream.write_all(&framed).await?;
    }
}
