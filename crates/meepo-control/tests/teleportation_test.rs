//! End-to-end teleportation tests between two in-process nodes

use async_trait::async_trait;
use meepo_control::{Meepo, MeepoConfig, MeepoError, SearchOrder, TeleportationOptions};
use meepo_proto::{Addr, ControlMessage, MessageCodec, CONTROL_CHANNEL_LABEL};
use meepo_teleportation::{Phase, Teleportation};
use meepo_transport::{
    DataChannel, Handshake, MemoryHub, MemoryTransport, Transport, TransportConnector,
    TransportResult,
};
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn node(id: &str, hub: &Arc<MemoryHub>) -> Meepo {
    let config = MeepoConfig::builder()
        .id(id)
        .request_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    Meepo::new(config, Arc::new(hub.connector(id)))
}

/// alice dials through the hub, bob serves
fn hub_pair() -> (Meepo, Meepo) {
    let hub = MemoryHub::new();
    let alice = node("alice", &hub);
    let bob = node("bob", &hub);
    bob.serve(hub.listen("bob"));
    (alice, bob)
}

/// Nodes joined by a hand-made pair; returns alice's end of it as well
fn wired_pair() -> (Meepo, Meepo, Arc<MemoryTransport>) {
    let hub = MemoryHub::new();
    let alice = node("alice", &hub);
    let bob = node("bob", &hub);

    let (to_bob, to_alice) = MemoryTransport::pair("alice", "bob");
    alice.add_transport(to_bob.clone()).unwrap();
    bob.add_transport(to_alice).unwrap();
    to_bob.connect();
    (alice, bob, to_bob)
}

async fn echo_server() -> Addr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Addr::tcp(listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_new_teleportation_registers_both_halves() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (alice, bob, _) = wired_pair();
    let remote: Addr = "127.0.0.1:5432".parse().unwrap();

    let ts = alice
        .new_teleportation("bob", remote, TeleportationOptions::new().with_name("db"))
        .await
        .unwrap();
    assert_eq!(ts.name(), "db");
    assert_eq!(ts.sink(), remote);
    assert_eq!(ts.phase(), Phase::Active);

    let source = alice.get_teleportation("db", SearchOrder::SourceFirst).unwrap();
    assert_eq!(source.source(), ts.source());
    let sink = bob.get_teleportation("db", SearchOrder::SinkFirst).unwrap();
    assert_eq!(sink.source(), ts.source());
    assert_eq!(sink.sink(), remote);
    assert_eq!(sink.transport().peer_id(), "alice");
}

#[tokio::test]
async fn test_default_name_is_network_and_address() {
    let (alice, _bob, _) = wired_pair();
    let ts = alice
        .new_teleportation("bob", "127.0.0.1:6379".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap();
    assert_eq!(ts.name(), "tcp:127.0.0.1:6379");
}

#[tokio::test]
async fn test_teleport_connects_and_allocates_ephemeral_port() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (alice, bob) = hub_pair();
    let remote: Addr = "tcp://10.0.0.5:9000".parse().unwrap();

    let local = alice
        .teleport("bob", remote, TeleportationOptions::new())
        .await
        .unwrap();

    assert_eq!(local.network(), remote.network());
    assert_ne!(local.socket_addr().port(), 0);
    assert!(local.socket_addr().ip().is_loopback());
    assert_eq!(alice.list_transports().len(), 1);
    assert_eq!(bob.list_teleportations().len(), 1);
}

#[tokio::test]
async fn test_teleport_reuses_existing_tunnel() {
    let (alice, bob) = hub_pair();
    let remote: Addr = "127.0.0.1:9000".parse().unwrap();

    let first = alice
        .teleport("bob", remote, TeleportationOptions::new())
        .await
        .unwrap();
    let second = alice
        .teleport("bob", remote, TeleportationOptions::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(alice.list_teleportations().len(), 1);
    assert_eq!(bob.list_teleportations().len(), 1);

    // A different remote is a different tunnel
    let other = alice
        .teleport("bob", "127.0.0.1:9001".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap();
    assert_ne!(other, first);
    assert_eq!(bob.list_teleportations().len(), 2);
}

#[tokio::test]
async fn test_teleport_relays_bytes() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (alice, _bob) = hub_pair();
    let target = echo_server().await;

    let local = alice
        .teleport("bob", target, TeleportationOptions::new())
        .await
        .unwrap();

    for round in 0..3u8 {
        let mut client = TcpStream::connect(local.socket_addr()).await.unwrap();
        let payload = [round; 16];
        client.write_all(&payload).await.unwrap();
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, payload);
    }
}

#[tokio::test]
async fn test_close_teleportation_removes_both_halves() {
    let (alice, bob, _) = wired_pair();
    let ts = alice
        .new_teleportation(
            "bob",
            "127.0.0.1:5432".parse().unwrap(),
            TeleportationOptions::new().with_name("db"),
        )
        .await
        .unwrap();
    let local = ts.source();
    drop(ts);

    alice.close_teleportation("db").await.unwrap();

    wait_until(|| alice.list_teleportations().is_empty() && bob.list_teleportations().is_empty()).await;
    assert!(matches!(
        alice.get_teleportation("db", SearchOrder::SourceFirst),
        Err(MeepoError::TeleportationNotExist)
    ));
    assert!(matches!(
        bob.get_teleportation("db", SearchOrder::SinkFirst),
        Err(MeepoError::TeleportationNotExist)
    ));

    // The listen address is released with the source
    tokio::time::timeout(Duration::from_secs(2), async {
        while TcpListener::bind(local.socket_addr()).await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_name_reuse_rejected_while_registered() {
    let (alice, _bob, _) = wired_pair();
    let opts = || TeleportationOptions::new().with_name("db");
    alice
        .new_teleportation("bob", "127.0.0.1:5432".parse().unwrap(), opts())
        .await
        .unwrap();

    let err = alice
        .new_teleportation("bob", "127.0.0.1:5433".parse().unwrap(), opts())
        .await
        .unwrap_err();
    assert!(matches!(err, MeepoError::TeleportationAlreadyExist(ref name) if name == "db"));
    assert_eq!(alice.list_teleportations().len(), 1);
}

#[tokio::test]
async fn test_failed_transport_and_close_tear_down_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (alice, _bob, to_bob) = wired_pair();
    let ts = alice
        .new_teleportation("bob", "127.0.0.1:5432".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap();

    let closer = {
        let ts = ts.clone();
        tokio::spawn(async move { ts.close().await })
    };
    to_bob.fail();
    closer.await.unwrap().unwrap();

    assert_eq!(ts.phase(), Phase::Closed);
    assert!(alice.list_teleportations().is_empty());
    assert!(alice.get_transport("bob").is_err());
    // A second explicit close is a no-op
    ts.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_sink_stops_stream_before_relay() {
    let (alice, bob, _) = wired_pair();
    let target = echo_server().await;
    let local = alice
        .teleport("bob", target, TeleportationOptions::new())
        .await
        .unwrap();

    // Drop bob's half behind alice's back
    let name = format!("tcp:{}", target);
    let sink = bob.get_teleportation(&name, SearchOrder::SinkFirst).unwrap();
    sink.close().await.unwrap();
    assert!(bob.list_teleportations().is_empty());

    let mut client = TcpStream::connect(local.socket_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(read.is_err() || buf.is_empty());

    // The source itself stays up
    let source = alice.get_teleportation(&name, SearchOrder::SourceFirst).unwrap();
    assert_eq!(source.phase(), Phase::Active);
    wait_until(|| source.active_streams() == 0).await;
}

#[tokio::test]
async fn test_teleport_fails_when_handshake_fails() {
    let hub = MemoryHub::new();
    let _bob_listener = hub.listen("bob");
    let config = MeepoConfig::builder().id("alice").build().unwrap();
    let alice = Meepo::new(
        config,
        Arc::new(hub.connector("alice").with_handshake(Handshake::Fail)),
    );

    let err = alice
        .teleport("bob", "127.0.0.1:9000".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeepoError::TransportNotConnected(_)));
    assert!(alice.list_transports().is_empty());
    assert!(alice.list_teleportations().is_empty());
}

#[tokio::test]
async fn test_teleport_to_unknown_peer() {
    let hub = MemoryHub::new();
    let alice = node("alice", &hub);

    let err = alice
        .teleport("nobody", "127.0.0.1:9000".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeepoError::Transport(_)));
}

#[tokio::test]
async fn test_request_times_out_without_peer_dispatch() {
    let hub = MemoryHub::new();
    let config = MeepoConfig::builder()
        .id("alice")
        .request_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let alice = Meepo::new(config, Arc::new(hub.connector("alice")));

    // Nobody reads the other end
    let (to_bob, _silent) = MemoryTransport::pair("alice", "bob");
    alice.add_transport(to_bob.clone()).unwrap();
    to_bob.connect();

    let err = alice
        .new_teleportation("bob", "127.0.0.1:9000".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeepoError::Timeout));
    assert!(alice.list_teleportations().is_empty());
}

#[tokio::test]
async fn test_meepo_close_releases_everything() {
    let (alice, bob) = hub_pair();
    alice
        .teleport("bob", "127.0.0.1:9000".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap();

    alice.close().await;

    assert!(alice.list_teleportations().is_empty());
    wait_until(|| bob.list_transports().is_empty()).await;
    wait_until(|| bob.list_teleportations().is_empty()).await;
    assert!(alice.list_transports().is_empty());
}

#[tokio::test]
async fn test_peer_drops_sinks_when_transport_closes() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (alice, bob, to_bob) = wired_pair();
    let ts = alice
        .new_teleportation("bob", "127.0.0.1:5432".parse().unwrap(), TeleportationOptions::new())
        .await
        .unwrap();
    assert_eq!(bob.list_teleportations().len(), 1);

    to_bob.close().await.unwrap();

    wait_until(|| bob.list_teleportations().is_empty()).await;
    wait_until(|| alice.list_teleportations().is_empty()).await;
    assert_eq!(ts.phase(), Phase::Closed);
}

#[tokio::test]
async fn test_reconnected_peer_can_teleport_again() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hub = MemoryHub::new();
    let bob = node("bob", &hub);
    bob.serve(hub.listen("bob"));
    let remote: Addr = "127.0.0.1:9000".parse().unwrap();

    let alice = node("alice", &hub);
    alice.teleport("bob", remote, TeleportationOptions::new()).await.unwrap();
    alice.close().await;

    // Same peer id, fresh transport
    let alice = node("alice", &hub);
    let local = alice
        .teleport("bob", remote, TeleportationOptions::new())
        .await
        .unwrap();
    assert_eq!(alice.list_teleportations().len(), 1);

    wait_until(|| bob.list_teleportations().len() == 1 && bob.list_transports().len() == 1).await;
    let sink = bob
        .get_teleportation(&format!("tcp:{}", remote), SearchOrder::SinkFirst)
        .unwrap();
    assert_eq!(sink.source(), local);
    assert_eq!(sink.phase(), Phase::Active);
}

async fn next_request(dc: &dyn DataChannel, buf: &mut bytes::BytesMut) -> ControlMessage {
    let codec = MessageCodec::default();
    loop {
        if let Some(message) = codec.decode(buf).unwrap() {
            return message;
        }
        let data = dc.recv().await.unwrap().unwrap();
        buf.extend_from_slice(&data);
    }
}

#[tokio::test]
async fn test_timed_out_create_sends_compensating_close() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hub = MemoryHub::new();
    let config = MeepoConfig::builder()
        .id("alice")
        .request_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let alice = Meepo::new(config, Arc::new(hub.connector("alice")));

    let (to_bob, silent) = MemoryTransport::pair("alice", "bob");
    alice.add_transport(to_bob.clone()).unwrap();
    to_bob.connect();
    let dc = silent.data_channel(CONTROL_CHANNEL_LABEL).unwrap();
    let mut buf = bytes::BytesMut::new();

    let err = alice
        .new_teleportation(
            "bob",
            "127.0.0.1:9000".parse().unwrap(),
            TeleportationOptions::new().with_name("db"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeepoError::Timeout));

    let ControlMessage::NewTeleportationRequest(create) = next_request(dc.as_ref(), &mut buf).await else {
        panic!("expected newTeleportation first");
    };
    assert_eq!(create.name, "db");
    let message = tokio::time::timeout(Duration::from_secs(2), next_request(dc.as_ref(), &mut buf))
        .await
        .unwrap();
    let ControlMessage::CloseTeleportationRequest(close) = message else {
        panic!("expected closeTeleportation after the timeout");
    };
    assert_eq!(close.name, "db");
    assert!(alice.list_teleportations().is_empty());
}

mock! {
    pub Connector {}

    #[async_trait]
    impl TransportConnector for Connector {
        async fn connect(&self, peer_id: &str) -> TransportResult<Arc<dyn Transport>>;
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector").finish()
    }
}

#[tokio::test]
async fn test_teleport_connects_once_per_peer() {
    let hub = MemoryHub::new();
    let bob = node("bob", &hub);
    let (to_bob, to_alice) = MemoryTransport::pair("alice", "bob");
    bob.add_transport(to_alice).unwrap();
    to_bob.connect();

    let mut connector = MockConnector::new();
    connector
        .expect_connect()
        .withf(|peer_id: &str| peer_id == "bob")
        .times(1)
        .returning(move |_: &str| Ok(to_bob.clone() as Arc<dyn Transport>));

    let config = MeepoConfig::builder().id("alice").build().unwrap();
    let alice = Meepo::new(config, Arc::new(connector));

    let remote: Addr = "127.0.0.1:9000".parse().unwrap();
    let first = alice.teleport("bob", remote, TeleportationOptions::new()).await.unwrap();
    let second = alice.teleport("bob", remote, TeleportationOptions::new()).await.unwrap();
    assert_eq!(first, second);
}
