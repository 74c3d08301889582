//! End-to-end sessions over loopback UDP with in-memory interfaces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tunnel_engine::crypto::PacketIdStore;
use tunnel_engine::prelude::*;
use tunnel_engine::session::{Carryover, SignalReceiver};

struct Endpoint {
    host: InterfaceHandle,
    signals: SignalHandle,
    task: JoinHandle<Result<SessionExit<MemoryInterface>, TunnelError>>,
}

impl Endpoint {
    async fn stop(self) -> SessionExit<MemoryInterface> {
        self.signals.raise(SignalKind::Terminate);
        self.task.await.unwrap().unwrap()
    }
}

async fn bind() -> (Arc<UdpSocket>, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Arc::new(socket), addr)
}

async fn start(config: SessionConfig, socket: Arc<UdpSocket>) -> (Session<MemoryInterface>, InterfaceHandle) {
    let (iface, host) = MemoryInterface::new("tun-test");
    let carry = Carryover {
        socket: Some(socket),
        ..Default::default()
    };
    (Session::start(config, iface, carry).await.unwrap(), host)
}

async fn spawn(config: SessionConfig, socket: Arc<UdpSocket>) -> Endpoint {
    let (session, host) = start(config, socket).await;
    run(session, host)
}

fn run(session: Session<MemoryInterface>, host: InterfaceHandle) -> Endpoint {
    let (signals, mut rx): (SignalHandle, SignalReceiver) = signal_channel();
    let task = tokio::spawn(async move { session.run(&mut rx).await });
    Endpoint { host, signals, task }
}

async fn static_pair(customize: impl Fn(SessionConfigBuilder) -> SessionConfigBuilder) -> (Endpoint, Endpoint) {
    let key = StaticKey::generate();
    let (sock_a, addr_a) = bind().await;
    let (sock_b, addr_b) = bind().await;
    let a = customize(
        SessionConfig::builder()
            .local(addr_a)
            .remote(addr_b)
            .static_key(&key, KeyDirection::Normal),
    )
    .build()
    .unwrap();
    let b = customize(
        SessionConfig::builder()
            .local(addr_b)
            .remote(addr_a)
            .static_key(&key, KeyDirection::Inverse),
    )
    .build()
    .unwrap();
    (spawn(a, sock_a).await, spawn(b, sock_b).await)
}

async fn handshake_pair(concurrent: bool) -> (Endpoint, Endpoint) {
    let (sock_c, addr_c) = bind().await;
    let (sock_s, addr_s) = bind().await;
    handshake_endpoints(concurrent, (sock_c, addr_c, addr_s), (sock_s, addr_s)).await
}

/// Client bound at `client.1` sending to `client.2`; server bound at `server.1`.
async fn handshake_endpoints(
    concurrent: bool,
    client: (Arc<UdpSocket>, SocketAddr, SocketAddr),
    server: (Arc<UdpSocket>, SocketAddr),
) -> (Endpoint, Endpoint) {
    let client_key = StaticKeypair::generate();
    let server_key = StaticKeypair::generate();
    let (sock_c, addr_c, remote) = client;
    let (sock_s, addr_s) = server;

    let crypto = |role, local: &StaticKeypair, peer: &StaticKeypair| CryptoConfig::Handshake {
        role,
        private_key: hex::encode(local.private_key()),
        peer_public_key: hex::encode(peer.public_key()),
        renegotiate: Duration::from_secs(3600),
        handshake_window: Duration::from_secs(60),
        transition_window: Duration::from_secs(60),
        packet_timeout: Duration::from_secs(1),
        concurrent,
    };
    let client = SessionConfig::builder()
        .local(addr_c)
        .remote(remote)
        .crypto(crypto(Role::Client, &client_key, &server_key))
        .build()
        .unwrap();
    let server = SessionConfig::builder()
        .local(addr_s)
        .crypto(crypto(Role::Server, &server_key, &client_key))
        .build()
        .unwrap();
    (spawn(client, sock_c).await, spawn(server, sock_s).await)
}

/// UDP relay from a client to a server that can switch its server-facing
/// socket, so the server sees the client move.
struct Relay {
    front: SocketAddr,
    use_second: Arc<AtomicBool>,
    second_replies: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Relay {
    async fn start(client: SocketAddr, server: SocketAddr) -> Self {
        let front = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let use_second = Arc::new(AtomicBool::new(false));
        let second_replies = Arc::new(AtomicUsize::new(0));
        let (switch, replies) = (Arc::clone(&use_second), Arc::clone(&second_replies));

        let task = tokio::spawn(async move {
            let (mut up, mut down_first, mut down_second) = ([0u8; 2048], [0u8; 2048], [0u8; 2048]);
            loop {
                tokio::select! {
                    Ok((n, _)) = front.recv_from(&mut up) => {
                        let out = if switch.load(Ordering::SeqCst) { &second } else { &first };
                        let _ = out.send_to(&up[..n], server).await;
                    }
                    Ok((n, _)) = first.recv_from(&mut down_first) => {
                        let _ = front.send_to(&down_first[..n], client).await;
                    }
                    Ok((n, _)) = second.recv_from(&mut down_second) => {
                        replies.fetch_add(1, Ordering::SeqCst);
                        let _ = front.send_to(&down_second[..n], client).await;
                    }
                    else => break,
                }
            }
        });
        Self {
            front: front_addr,
            use_second,
            second_replies,
            task,
        }
    }
}

fn payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

async fn recv(host: &InterfaceHandle) -> Vec<u8> {
    timeout(Duration::from_secs(5), host.recv())
        .await
        .expect("packet was not delivered")
}

/// Resend a marker packet until the tunnel carries it, then drain duplicates.
async fn wait_until_up(from: &InterfaceHandle, to: &InterfaceHandle) {
    let marker = b"marker".to_vec();
    timeout(Duration::from_secs(10), async {
        loop {
            from.inject(marker.clone());
            if let Ok(packet) = timeout(Duration::from_millis(100), to.recv()).await {
                assert_eq!(packet, marker);
                return;
            }
        }
    })
    .await
    .expect("tunnel never came up");
    tokio::time::sleep(Duration::from_millis(200)).await;
    while to.try_recv().is_some() {}
}

#[tokio::test]
async fn test_static_key_round_trip_1200_bytes() {
    let (a, b) = static_pair(|c| c.tun_mtu(1400)).await;

    let data = payload(1200);
    a.host.inject(data.clone());
    assert_eq!(recv(&b.host).await, data);

    let reply = payload(1400);
    b.host.inject(reply.clone());
    assert_eq!(recv(&a.host).await, reply);

    let exit_a = a.stop().await;
    let exit_b = b.stop().await;
    assert_eq!(exit_a.reason, ExitReason::Terminate);
    assert_eq!(exit_b.stats.drops.total(), 0);
    assert_eq!(exit_b.stats.tun_write_bytes, 1200);
}

#[tokio::test]
async fn test_fragmented_round_trip() {
    let (a, b) = static_pair(|c| c.tun_mtu(1400).fragment(500)).await;

    let data = payload(1300);
    a.host.inject(data.clone());
    assert_eq!(recv(&b.host).await, data);

    let exit_a = a.stop().await;
    b.stop().await;
    // Three sealed fragments went out
    assert!(exit_a.stats.link_write_bytes > 1300 + 3 * 4);
}

#[tokio::test]
async fn test_all_layers_preserve_order() {
    let (a, b) = static_pair(|c| {
        c.tun_mtu(1400)
            .fragment(700)
            .compression(CompressionMode::Zstd { level: 3 })
            .cipher(CipherKind::XChaCha20Poly1305)
    })
    .await;

    let packets: Vec<Vec<u8>> = (1..=20).map(|i| payload(i * 60)).collect();
    for p in &packets {
        a.host.inject(p.clone());
    }
    for p in &packets {
        assert_eq!(&recv(&b.host).await, p);
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_cleartext_round_trip() {
    let (sock_a, addr_a) = bind().await;
    let (sock_b, addr_b) = bind().await;
    let a = SessionConfig::builder().local(addr_a).remote(addr_b).build().unwrap();
    let b = SessionConfig::builder().local(addr_b).build().unwrap();
    let a = spawn(a, sock_a).await;
    let b = spawn(b, sock_b).await;

    a.host.inject(b"plain".to_vec());
    assert_eq!(recv(&b.host).await, b"plain");

    // b learned a's address from the first packet
    b.host.inject(b"back".to_vec());
    assert_eq!(recv(&a.host).await, b"back");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_negotiated_keys_cooperative() {
    let (client, server) = handshake_pair(false).await;
    wait_until_up(&client.host, &server.host).await;

    let data = payload(1000);
    server.host.inject(data.clone());
    assert_eq!(recv(&client.host).await, data);

    let data = payload(1000);
    client.host.inject(data.clone());
    assert_eq!(recv(&server.host).await, data);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_negotiated_keys_concurrent() {
    let (client, server) = handshake_pair(true).await;
    wait_until_up(&client.host, &server.host).await;

    let data = payload(800);
    server.host.inject(data.clone());
    assert_eq!(recv(&client.host).await, data);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_negotiated_peer_set_by_handshake_only() {
    let (sock_c, addr_c) = bind().await;
    let (sock_s, addr_s) = bind().await;
    let relay = Relay::start(addr_c, addr_s).await;
    let (client, server) =
        handshake_endpoints(false, (sock_c, addr_c, relay.front), (sock_s, addr_s)).await;
    wait_until_up(&client.host, &server.host).await;

    // Data now reaches the server from a new address
    relay.use_second.store(true, Ordering::SeqCst);
    let data = payload(300);
    client.host.inject(data.clone());
    assert_eq!(recv(&server.host).await, data);

    // Replies still go to the address the handshake came from
    let reply = payload(300);
    server.host.inject(reply.clone());
    assert_eq!(recv(&client.host).await, reply);
    assert_eq!(relay.second_replies.load(Ordering::SeqCst), 0);

    client.stop().await;
    server.stop().await;
    relay.task.abort();
}

#[tokio::test]
async fn test_backpressure_holds_burst_until_drained() {
    const BURST: u8 = 16;
    let key = StaticKey::generate();
    let (sock_a, addr_a) = bind().await;
    let (sock_b, addr_b) = bind().await;
    let a = SessionConfig::builder()
        .local(addr_a)
        .remote(addr_b)
        .static_key(&key, KeyDirection::Normal)
        .build()
        .unwrap();
    let b = SessionConfig::builder()
        .local(addr_b)
        .remote(addr_a)
        .static_key(&key, KeyDirection::Inverse)
        .build()
        .unwrap();
    let a = spawn(a, sock_a).await;
    let (iface, host) = MemoryInterface::with_depth("tun-slow", 1);
    let carry = Carryover {
        socket: Some(sock_b),
        ..Default::default()
    };
    let b = run(Session::start(b, iface, carry).await.unwrap(), host);

    let packets: Vec<Vec<u8>> = (0..BURST).map(|i| vec![i; 200]).collect();
    for p in &packets {
        a.host.inject(p.clone());
    }
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.host.pending_outbound() <= 1);
    }
    assert_eq!(b.host.pending_outbound(), 1);

    for p in &packets {
        assert_eq!(&recv(&b.host).await, p);
    }

    a.stop().await;
    let exit_b = b.stop().await;
    assert_eq!(exit_b.stats.drops.total(), 0);
    assert_eq!(exit_b.stats.tun_write_bytes, u64::from(BURST) * 200);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_timeout_requests_restart() {
    let (socket, addr) = bind().await;
    let (_, silent_peer) = bind().await;
    let config = SessionConfig::builder()
        .local(addr)
        .remote(silent_peer)
        .static_key(&StaticKey::generate(), KeyDirection::Normal)
        .ping_restart(Duration::from_secs(10))
        .build()
        .unwrap();
    let (session, _host) = start(config, socket).await;

    let started = Instant::now();
    let (_signals, mut rx) = signal_channel();
    let exit = session.run(&mut rx).await.unwrap();

    assert_eq!(exit.reason, ExitReason::PingRestart);
    assert!(exit.reason.is_restart());
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_timeout_can_exit() {
    let (socket, addr) = bind().await;
    let config = SessionConfig::builder()
        .local(addr)
        .ping_exit(Duration::from_secs(10))
        .build()
        .unwrap();
    let (session, _host) = start(config, socket).await;

    let (_signals, mut rx) = signal_channel();
    let exit = session.run(&mut rx).await.unwrap();
    assert_eq!(exit.reason, ExitReason::PingExit);
}

#[tokio::test]
async fn test_shaper_limits_rate() {
    const RATE: u32 = 20_000;
    const PACKETS: usize = 10;
    let (a, b) = static_pair(|c| c.tun_mtu(1400).shaper(RATE)).await;

    for _ in 0..PACKETS {
        a.host.inject(payload(1000));
    }
    recv(&b.host).await;
    let first = Instant::now();
    for _ in 1..PACKETS {
        recv(&b.host).await;
    }
    let elapsed = first.elapsed();

    let exit_a = a.stop().await;
    b.stop().await;

    // Every datagram after the first waits for the previous one's budget
    let per_datagram = exit_a.stats.link_write_bytes / PACKETS as u64;
    let floor = Duration::from_secs_f64(((PACKETS - 2) as u64 * per_datagram) as f64 / f64::from(RATE));
    assert!(elapsed >= floor, "{elapsed:?} < {floor:?}");
}

#[tokio::test]
async fn test_packet_id_persists_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("packet-id");
    let key = StaticKey::generate();

    for (round, sent) in [(1u64, 5usize), (2, 1)] {
        let (sock_a, addr_a) = bind().await;
        let (sock_b, addr_b) = bind().await;
        let a = SessionConfig::builder()
            .local(addr_a)
            .remote(addr_b)
            .static_key(&key, KeyDirection::Normal)
            .packet_id_file(&path)
            .build()
            .unwrap();
        let b = SessionConfig::builder()
            .local(addr_b)
            .remote(addr_a)
            .static_key(&key, KeyDirection::Inverse)
            .build()
            .unwrap();
        let a = spawn(a, sock_a).await;
        let b = spawn(b, sock_b).await;

        for _ in 0..sent {
            a.host.inject(payload(100));
            recv(&b.host).await;
        }
        a.stop().await;
        b.stop().await;

        let record = PacketIdStore::open(&path).unwrap().loaded().unwrap();
        let expected = if round == 1 { 5 } else { 6 };
        assert_eq!(record.issued, expected);
    }
}
