//! Two tunnel endpoints talking over loopback UDP.
//!
//! The client negotiates keys with the server, then a burst of packets is
//! pushed through each in-memory interface and counted on the other side.
//! Set `RUST_LOG=tunnel_engine=debug` to watch the pipeline.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_engine::prelude::*;
use tunnel_engine::session::Carryover;

const PACKETS: usize = 64;
const PACKET_SIZE: usize = 1200;

#[tokio::main]
async fn main() -> Result<(), TunnelError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let client_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let server_addr = server_socket.local_addr()?;
    let client_addr = client_socket.local_addr()?;

    let server_key = StaticKeypair::generate();
    let client_key = StaticKeypair::generate();

    let server_config = endpoint(server_addr, None)
        .handshake(Role::Server, &server_key, client_key.public_key())
        .build()?;
    let client_config = endpoint(client_addr, Some(server_addr))
        .handshake(Role::Client, &client_key, server_key.public_key())
        .build()?;

    let (server_iface, server_host) = MemoryInterface::new("tun-server");
    let (client_iface, client_host) = MemoryInterface::new("tun-client");
    let server = Session::start(server_config, server_iface, carry(server_socket)).await?;
    let client = Session::start(client_config, client_iface, carry(client_socket)).await?;

    let (server_signals, mut server_rx) = signal_channel();
    let (client_signals, mut client_rx) = signal_channel();
    forward_os_signals(server_signals.clone())?;
    forward_os_signals(client_signals.clone())?;

    let server_task = tokio::spawn(async move { server.run(&mut server_rx).await });
    let client_task = tokio::spawn(async move { client.run(&mut client_rx).await });

    // Data is dropped until the first key is in place
    tokio::time::sleep(Duration::from_millis(500)).await;

    for i in 0..PACKETS {
        client_host.inject(vec![i as u8; PACKET_SIZE]);
        server_host.inject(vec![!(i as u8); PACKET_SIZE]);
    }

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    let (mut at_server, mut at_client) = (0, 0);
    while at_server < PACKETS || at_client < PACKETS {
        tokio::select! {
            _ = server_host.recv() => at_server += 1,
            _ = client_host.recv() => at_client += 1,
            _ = &mut deadline => {
                warn!(at_server, at_client, "timed out waiting for packets");
                break;
            }
        }
    }
    info!(at_server, at_client, "packets delivered");

    server_signals.raise(SignalKind::UserStats);
    client_signals.raise(SignalKind::UserStats);
    server_signals.raise(SignalKind::Terminate);
    client_signals.raise(SignalKind::Terminate);

    for task in [server_task, client_task] {
        match task.await {
            Ok(Ok(exit)) => info!(reason = %exit.reason, "endpoint stopped"),
            Ok(Err(e)) => return Err(e),
            Err(e) => warn!(error = %e, "endpoint task failed"),
        }
    }
    Ok(())
}

fn endpoint(local: SocketAddr, remote: Option<SocketAddr>) -> SessionConfigBuilder {
    let builder = SessionConfig::builder()
        .local(local)
        .tun_mtu(1400)
        .fragment(600)
        .compression(CompressionMode::Zstd { level: 3 })
        .ping(Duration::from_secs(2))
        .ping_restart(Duration::from_secs(10));
    match remote {
        Some(remote) => builder.remote(remote),
        None => builder,
    }
}

fn carry(socket: UdpSocket) -> Carryover {
    Carryover {
        socket: Some(socket.into()),
        ..Default::default()
    }
}
