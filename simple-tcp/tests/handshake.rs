//! Integration tests for the 3-way handshake.
//!
//! Each test binds real UDP sockets on loopback, runs the server half in a
//! background task, and verifies that both sides reach
//! `ConnectionState::Established` (or fail the way they should).

use std::net::SocketAddr;
use std::time::Duration;

use simple_tcp::{Config, Connection, ConnectionState, Error, FaultConfig, Listener, Socket};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();
    "127.0.0.1:0".parse().unwrap()
}

/// Loopback RTTs are microseconds; start the estimator near that.
fn fast() -> Config {
    Config {
        syn_retries: 30,
        time_wait: Duration::from_millis(200),
        ..Config::default().with_initial_rtt(Duration::from_millis(20))
    }
}

async fn listener(config: Config) -> Listener {
    Listener::bind(loopback(), config)
        .await
        .expect("bind listener")
}

async fn connect(server: SocketAddr, config: Config) -> Result<Connection, Error> {
    let socket = Socket::bind(loopback()).await.expect("bind client socket");
    tokio::time::timeout(
        Duration::from_secs(5),
        Connection::connect(socket, server, config),
    )
    .await
    .expect("client connect timed out")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake on loopback.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let mut listener = listener(Config::default()).await;
    let server_addr = listener.local_addr();

    // Server blocks on `accept` until the handshake completes.
    let server_task = tokio::spawn(async move { listener.accept().await });

    let client = connect(server_addr, Config::default())
        .await
        .expect("client connect failed");

    let server = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server accept timed out")
        .expect("server task panicked")
        .expect("server accept failed");

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(server.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), server_addr);

    // SYN and SYN+ACK are both acknowledged; nothing is left in flight.
    assert_eq!(client.stats().bytes_in_flight, 0);
    assert_eq!(server.stats().bytes_in_flight, 0);
    assert_eq!(client.stats().retransmissions, 0);
}

/// The peer's receive window arrives on the SYN / SYN+ACK.
#[tokio::test]
async fn handshake_exchanges_windows() {
    let mut listener = listener(Config::default().with_recv_window(3000)).await;
    let server_addr = listener.local_addr();
    let server_task = tokio::spawn(async move { listener.accept().await });

    let client = connect(server_addr, Config::default().with_recv_window(5000))
        .await
        .unwrap();
    let server = server_task.await.unwrap().unwrap();

    assert_eq!(client.stats().peer_window, 3000);
    assert_eq!(server.stats().peer_window, 5000);
}

/// Initial sequence numbers are chosen per session.
#[tokio::test]
async fn initial_sequence_numbers_differ_between_sessions() {
    let mut listener = listener(Config::default()).await;
    let server_addr = listener.local_addr();
    let server_task = tokio::spawn(async move {
        let a = listener.accept().await.unwrap();
        let b = listener.accept().await.unwrap();
        (a, b)
    });

    let c1 = connect(server_addr, Config::default()).await.unwrap();
    let c2 = connect(server_addr, Config::default()).await.unwrap();
    let (s1, s2) = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();

    let isns = [
        c1.initial_sequence(),
        c2.initial_sequence(),
        s1.initial_sequence(),
        s2.initial_sequence(),
    ];
    for i in 0..isns.len() {
        for j in i + 1..isns.len() {
            assert_ne!(isns[i], isns[j], "ISNs must not repeat: {isns:?}");
        }
    }
}

/// One listener serves several peers at once.
#[tokio::test]
async fn listener_demultiplexes_peers() {
    let mut listener = listener(Config::default()).await;
    let server_addr = listener.local_addr();

    let server_task = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..3 {
            let conn = listener.accept().await.unwrap();
            got.push(conn.recv(100).await.unwrap());
        }
        got.sort();
        got
    });

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let c = connect(server_addr, Config::default()).await.unwrap();
        c.send(&[b'a' + i]).await.unwrap();
        clients.push(c);
    }

    let got = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

/// A lost SYN is retransmitted and the handshake still completes.
#[tokio::test]
async fn handshake_survives_lost_syns() {
    let mut listener = listener(fast()).await;
    let server_addr = listener.local_addr();
    let server_task = tokio::spawn(async move { listener.accept().await });

    let socket = Socket::bind_with_faults(loopback(), FaultConfig::lossy(0.5).with_seed(11))
        .await
        .unwrap();
    let client = tokio::time::timeout(
        Duration::from_secs(10),
        Connection::connect(socket, server_addr, fast()),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    let server = tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
}

/// Connecting to an address where nobody is listening should eventually fail
/// rather than hang forever.
#[tokio::test]
async fn connect_to_silent_peer_fails_after_syn_retries() {
    // Bind and immediately drop a socket so the port is unbound; any SYN sent
    // there gets no reply.
    let silent_addr: SocketAddr = {
        let tmp = Socket::bind(loopback()).await.unwrap();
        tmp.local_addr
    };

    let config = Config {
        syn_retries: 3,
        ..fast()
    };
    let result = connect(silent_addr, config).await;

    assert!(
        matches!(result, Err(Error::ConnectionFailed)),
        "expected ConnectionFailed, got: {result:?}"
    );
}

/// Dropping the listener resets a connection nobody accepted: the peer's data
/// is never acknowledged, and the listening port is released once that child
/// is gone.
#[tokio::test]
async fn dropping_listener_resets_unaccepted_connections() {
    let listener = listener(fast()).await;
    let server_addr = listener.local_addr();

    let client = connect(server_addr, fast().with_max_retransmissions(Some(2)))
        .await
        .expect("client connect failed");
    drop(listener);

    client.send(b"nobody will read this").await.unwrap();
    let flushed = tokio::time::timeout(Duration::from_secs(10), client.flush())
        .await
        .expect("flush hung");
    assert!(
        matches!(flushed, Err(Error::ConnectionTimedOut)),
        "expected ConnectionTimedOut, got: {flushed:?}"
    );
    assert!(client.close().await.is_err());
    assert_eq!(client.state(), ConnectionState::Closed);

    let rebind = async {
        loop {
            match Socket::bind(server_addr).await {
                Ok(socket) => return socket,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), rebind)
        .await
        .expect("listener socket was never released");
}

/// A bad configuration is rejected before anything is sent.
#[tokio::test]
async fn invalid_config_is_rejected() {
    let socket = Socket::bind(loopback()).await.unwrap();
    let result = Connection::connect(socket, loopback(), Config::default().with_mss(0)).await;
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
