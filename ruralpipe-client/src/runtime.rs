use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use ruralpipe_core::control::ClientConfig;
use ruralpipe_core::proto::SessionId;
use ruralpipe_core::socket::SocketProducerConsumer;
use ruralpipe_core::tun::TunDevice;
use ruralpipe_core::tunnel::TunnelProducerConsumer;
use tokio::net::TcpSocket;

const CONNECT_RETRY: Duration = Duration::from_secs(5);

fn decode_signing_key(config: &ClientConfig) -> Result<Option<Vec<u8>>> {
    let Some(ref encoded) = config.signing_key_b64 else {
        return Ok(None);
    };
    let key = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("failed to decode signing_key_b64 as base64")?;
    if key.is_empty() {
        anyhow::bail!("signing_key_b64 decodes to an empty key");
    }
    Ok(Some(key))
}

async fn resolve_server(config: &ClientConfig) -> Result<SocketAddr> {
    let target = format!("{}:{}", config.server_host, config.server_port);
    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?;

    let addr = addrs
        .find(|addr| addr.is_ipv4())
        .with_context(|| format!("{target} did not resolve to an IPv4 address"))?;
    tracing::info!(server = %target, %addr, "server resolved");
    Ok(addr)
}

/// Connects to the server, optionally binding the socket to one uplink
/// interface. Connection refusal means the server is not up yet and is
/// retried indefinitely.
async fn connect_to_server(addr: SocketAddr, interface: Option<&str>) -> Result<OwnedFd> {
    loop {
        let socket = TcpSocket::new_v4().context("failed to create socket")?;
        if let Some(interface) = interface {
            socket
                .bind_device(Some(interface.as_bytes()))
                .with_context(|| format!("failed to bind socket to interface {interface}"))?;
        }

        match socket.connect(addr).await {
            Ok(stream) => {
                tracing::info!(
                    %addr,
                    interface = interface.unwrap_or("default route"),
                    "connected to server"
                );
                let stream = stream.into_std().context("failed to unwrap stream")?;
                return Ok(stream.into());
            }
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::info!(%addr, error = %err, "server not ready yet; retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to connect to {addr}"));
            }
        }
    }
}

fn log_stats(tunnel: &TunnelProducerConsumer, socket: &SocketProducerConsumer) {
    for (queue, stats) in tunnel.stats().queues.iter().enumerate() {
        tracing::info!(
            queue,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "tunnel queue stats"
        );
    }
    for session in socket.stats().sessions {
        for (index, stream) in session.streams.iter().enumerate() {
            tracing::info!(
                session = %session.session_id,
                stream = index,
                bytes_sent = stream.bytes_sent,
                "stream stats"
            );
        }
    }
}

pub async fn run_client(config: ClientConfig) -> Result<()> {
    let signing_key = decode_signing_key(&config)?;
    let addr = resolve_server(&config).await?;

    let session_id = SessionId::generate();
    tracing::info!(session = %session_id, "client session generated");

    let device = TunDevice::open(&config.tun_name, config.num_queues)
        .with_context(|| format!("failed to create tunnel device '{}'", config.tun_name))?;
    let mtu = device.mtu;

    let tunnel = TunnelProducerConsumer::new(device.queues, mtu);
    let socket = match signing_key {
        Some(ref key) => {
            SocketProducerConsumer::with_signing_key(Some(session_id), tunnel.pipe(), key)
        }
        None => SocketProducerConsumer::new(Some(session_id), tunnel.pipe()),
    };

    if config.interfaces.is_empty() {
        tracing::warn!("no uplink interfaces configured; using a single default-route connection");
        socket.add_socket(connect_to_server(addr, None).await?)?;
    } else {
        for interface in &config.interfaces {
            socket.add_socket(connect_to_server(addr, Some(interface)).await?)?;
        }
    }

    tracing::info!("client running");

    let mut tick = tokio::time::interval(Duration::from_secs(config.stats_interval_secs.max(1)));
    tick.tick().await; // the first tick is immediate
    loop {
        tokio::select! {
            _ = tick.tick() => log_stats(&tunnel, &socket),
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    socket.shutdown();
    tunnel.shutdown();
    Ok(())
}
