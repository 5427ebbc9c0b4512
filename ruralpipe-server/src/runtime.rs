use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use ruralpipe_core::control::ServerConfig;
use ruralpipe_core::socket::SocketProducerConsumer;
use ruralpipe_core::tun::TunDevice;
use ruralpipe_core::tunnel::TunnelProducerConsumer;
use tokio::net::TcpListener;

fn decode_signing_key(config: &ServerConfig) -> Result<Option<Vec<u8>>> {
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

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let signing_key = decode_signing_key(&config)?;

    let device = TunDevice::open(&config.tun_name, config.num_queues)
        .with_context(|| format!("failed to create tunnel device '{}'", config.tun_name))?;
    let mtu = device.mtu;

    let tunnel = TunnelProducerConsumer::new(device.queues, mtu);
    let socket = match signing_key {
        Some(ref key) => SocketProducerConsumer::with_signing_key(None, tunnel.pipe(), key),
        None => SocketProducerConsumer::new(None, tunnel.pipe()),
    };

    let listener = TcpListener::bind((config.listen_addr.as_str(), config.listen_port))
        .await
        .with_context(|| {
            format!(
                "failed to listen on {}:{}",
                config.listen_addr, config.listen_port
            )
        })?;
    tracing::info!(addr = %listener.local_addr()?, "listening for client connections");
    tracing::info!("server running");

    let mut tick = tokio::time::interval(Duration::from_secs(config.stats_interval_secs.max(1)));
    tick.tick().await; // the first tick is immediate
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "accepted connection");
                        let stream = stream.into_std().context("failed to unwrap stream")?;
                        if let Err(err) = socket.add_socket(stream.into()) {
                            tracing::warn!(%peer, error = %err, "failed to register connection");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
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
