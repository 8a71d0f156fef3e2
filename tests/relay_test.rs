//! End-to-end tests of the relay listener against a local echo server

use std::net::SocketAddr;
use std::sync::Arc;

use proxylog::config::{Config, DestinationMode};
use proxylog::connection::{ActiveSessions, Observers};
use proxylog::counter::ByteCounter;
use proxylog::protocol::UserIdMode;
use proxylog::telemetry::{RelayMetrics, SessionStage};
use proxylog::ConnectionManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Echo server that answers every connection until its peer closes
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Address nothing listens on
async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn create_test_config(destination: DestinationMode) -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.connect_timeout = Duration::from_secs(2);
    config.server.handshake_timeout = Duration::from_secs(2);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.destination = destination;
    config
}

struct TestRelay {
    addr: SocketAddr,
    counter: Arc<ByteCounter>,
    metrics: Arc<RelayMetrics>,
    sessions: ActiveSessions,
    shutdown: CancellationToken,
    handle: JoinHandle<proxylog::Result<()>>,
}

async fn start_relay(config: Config) -> TestRelay {
    let counter = Arc::new(ByteCounter::new());
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let shutdown = CancellationToken::new();

    let manager = ConnectionManager::bind(
        &config,
        Observers::both(counter.clone()),
        metrics.clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();
    let addr = manager.local_addr().unwrap();
    let sessions = manager.active_sessions();
    let handle = tokio::spawn(manager.run());

    TestRelay {
        addr,
        counter,
        metrics,
        sessions,
        shutdown,
        handle,
    }
}

async fn wait_until_idle(sessions: &ActiveSessions) {
    timeout(Duration::from_secs(5), async {
        while sessions.count() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not finish");
}

fn socks4_connect(dest: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(dest) = dest else {
        panic!("IPv4 destination expected");
    };
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&dest.port().to_be_bytes());
    request.extend_from_slice(&dest.ip().octets());
    request.push(0x00);
    request
}

/// Send `payload`, half-close, and read the echo to end-of-stream
async fn echo_round_trip(mut stream: TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_static_destination_counts_both_directions() {
    let echo = start_echo_server().await;
    let relay = start_relay(create_test_config(DestinationMode::Static {
        addr: echo.to_string(),
    }))
    .await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let echoed = echo_round_trip(client, b"Hello, relay!").await;
    assert_eq!(echoed, b"Hello, relay!");

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.counter.drain(), 26);
    assert_eq!(relay.counter.drain(), 0);
    assert_eq!(relay.metrics.active_sessions(), 0);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_socks4_handshake_then_relay() {
    let echo = start_echo_server().await;
    let relay = start_relay(create_test_config(DestinationMode::Socks4 {
        user_id: UserIdMode::Fixed,
    }))
    .await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(&socks4_connect(echo)).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x00, 0x5A, 0, 0, 0, 0, 0, 0]);

    let echoed = echo_round_trip(client, &[7u8; 1000]).await;
    assert_eq!(echoed.len(), 1000);

    wait_until_idle(&relay.sessions).await;
    // Handshake bytes are not relayed and not counted.
    assert_eq!(relay.counter.drain(), 2000);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_handshake_gets_no_reply() {
    let relay = start_relay(create_test_config(DestinationMode::default())).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(&[0x05, 0x01, 0x00, 0x50, 127, 0, 0, 1, 0x00])
        .await
        .unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_empty());

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.metrics.session_errors(SessionStage::Handshake), 1);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dial_failure_keeps_listener_serving() {
    let echo = start_echo_server().await;
    let dead = unused_addr().await;
    let relay = start_relay(create_test_config(DestinationMode::default())).await;

    // Granted before the dial, then closed once the dial fails.
    let mut failing = TcpStream::connect(relay.addr).await.unwrap();
    failing.write_all(&socks4_connect(dead)).await.unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), failing.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, [0x00, 0x5A, 0, 0, 0, 0, 0, 0]);

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.metrics.session_errors(SessionStage::Dial), 1);

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(&socks4_connect(echo)).await.unwrap();
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    let echoed = echo_round_trip(client, b"still serving").await;
    assert_eq!(echoed, b"still serving");

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.counter.drain(), 26);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_sessions_sum_into_one_counter() {
    let echo = start_echo_server().await;
    let relay = start_relay(create_test_config(DestinationMode::Static {
        addr: echo.to_string(),
    }))
    .await;

    let first = TcpStream::connect(relay.addr).await.unwrap();
    let second = TcpStream::connect(relay.addr).await.unwrap();

    let (a, b) = tokio::join!(
        echo_round_trip(first, &[1u8; 4096]),
        echo_round_trip(second, &[2u8; 10_000]),
    );
    assert_eq!(a.len(), 4096);
    assert_eq!(b.len(), 10_000);

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.counter.drain(), 2 * (4096 + 10_000));

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

/// Sink that reads slowly and reports how many bytes it received
async fn start_slow_sink() -> (SocketAddr, tokio::sync::oneshot::Receiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done, received) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
            sleep(Duration::from_millis(2)).await;
        }
        let _ = done.send(total);
    });

    (addr, received)
}

#[tokio::test]
async fn test_large_transfer_to_slow_reader_is_fully_counted() {
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let (sink, received) = start_slow_sink().await;
    let relay = start_relay(create_test_config(DestinationMode::Static {
        addr: sink.to_string(),
    }))
    .await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let payload = vec![0x5Au8; PAYLOAD];
    timeout(Duration::from_secs(30), client.write_all(&payload))
        .await
        .expect("relay stalled under backpressure")
        .unwrap();
    client.shutdown().await.unwrap();

    let received = timeout(Duration::from_secs(30), received).await.unwrap().unwrap();
    assert_eq!(received, PAYLOAD);

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();

    wait_until_idle(&relay.sessions).await;
    assert_eq!(relay.counter.drain(), PAYLOAD as u64);
    assert_eq!(relay.metrics.session_errors(SessionStage::Relay), 0);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_listener_and_bounds_drain() {
    let echo = start_echo_server().await;
    let mut config = create_test_config(DestinationMode::Static {
        addr: echo.to_string(),
    });
    config.server.shutdown_timeout = Duration::from_millis(200);
    let relay = start_relay(config).await;

    // An idle session stays open across the shutdown signal.
    let _idle = TcpStream::connect(relay.addr).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while relay.sessions.count() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    relay.shutdown.cancel();
    timeout(Duration::from_secs(5), relay.handle)
        .await
        .expect("listener did not stop")
        .unwrap()
        .unwrap();

    assert!(TcpStream::connect(relay.addr).await.is_err());
}
