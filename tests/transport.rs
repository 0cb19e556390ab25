//! Integration tests for the reliable UDP transport.
//!
//! Real loopback sockets throughout; lossy and reordering paths are
//! simulated with a small forwarding proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use netioudp::error::CloseReason;
use netioudp::protocol::{ConnOkPacket, ConnPacket, PacketHeader, PacketKind};
use netioudp::transport::{dial, dial_with_config, MAX_DATA_SIZE};
use netioudp::{Error, Listener, TransportConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Tight timings so loss-recovery scenarios finish quickly.
fn fast_config() -> TransportConfig {
    TransportConfig {
        check_interval: Duration::from_millis(25),
        connection_timeout: Duration::from_secs(10),
        ..TransportConfig::default()
    }
}

/// What the forwarding proxy does to client→server Data datagrams.
#[derive(Clone, Copy)]
enum Impairment {
    /// Drop every nth Data datagram.
    DropNthData(u64),
    /// Swap consecutive pairs of Data datagrams.
    SwapDataPairs,
}

/// Bidirectional UDP forwarder between one client and `server`.
async fn run_proxy(socket: UdpSocket, server: SocketAddr, impairment: Impairment) {
    let mut client: Option<SocketAddr> = None;
    let mut data_seen = 0u64;
    let mut held: Option<Vec<u8>> = None;
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let to = if from == server {
            match client {
                Some(addr) => addr,
                None => continue,
            }
        } else {
            client = Some(from);
            server
        };
        let is_data = n > 0 && buf[0] & 0x7f == PacketKind::Data as u8;
        if from != server && is_data {
            match impairment {
                Impairment::DropNthData(nth) => {
                    data_seen += 1;
                    if data_seen % nth == 0 {
                        continue;
                    }
                }
                Impairment::SwapDataPairs => {
                    if let Some(first) = held.take() {
                        let _ = socket.send_to(&buf[..n], to).await;
                        let _ = socket.send_to(&first, to).await;
                        continue;
                    }
                    held = Some(buf[..n].to_vec());
                    continue;
                }
            }
        }
        let _ = socket.send_to(&buf[..n], to).await;
    }
}

async fn spawn_proxy(server: SocketAddr, impairment: Impairment) -> SocketAddr {
    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(run_proxy(socket, server, impairment));
    addr
}

#[tokio::test]
async fn test_handshake_then_close() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = dial(None, raddr).await.unwrap();
    let server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_conn.remote_addr(), client.local_addr().unwrap());

    client.close().await.unwrap();

    let mut buf = [0u8; 16];
    let err = timeout(Duration::from_secs(5), server_conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed {
            reason: CloseReason::Peer
        }
    ));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_sequential_reconnect() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let (closed_tx, mut closed_rx) = mpsc::channel(1);
    let listener = Arc::new(listener);
    let server = Arc::clone(&listener);
    tokio::spawn(async move {
        let c1 = server.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let _ = c1.read(&mut buf).await;
        closed_tx.send(()).await.unwrap();
        let _ = server.accept().await;
    });

    let c1 = dial(None, raddr).await.unwrap();
    let laddr = c1.local_addr().unwrap();
    c1.close().await.unwrap();
    drop(c1);

    // Make sure the first connection is fully torn down before rebinding
    // the same local port.
    timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let c2 = timeout(Duration::from_secs(5), dial(Some(laddr), raddr))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(c2.local_addr().unwrap(), laddr);
    c2.close().await.unwrap();

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_over_dead_peer() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    // Handshake by hand so the "client" can vanish without a Close packet.
    let raw = UdpSocket::bind(loopback()).await.unwrap();
    raw.connect(raddr).await.unwrap();
    let laddr = raw.local_addr().unwrap();
    raw.send(&ConnPacket::new(raddr).encode()).await.unwrap();
    let mut buf = [0u8; 128];
    let n = timeout(Duration::from_secs(5), raw.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = ConnPacket::decode(&buf[..n]).unwrap();
    assert_eq!(reply.addr, laddr);
    raw.send(&ConnOkPacket::new(raddr).encode()).await.unwrap();

    let c1 = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    // Simulate a crash: socket released, no Close packet sent.
    drop(raw);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A new dial from the same port supersedes the stale connection.
    let c2 = timeout(Duration::from_secs(5), dial(Some(laddr), raddr))
        .await
        .unwrap()
        .unwrap();
    let server_c2 = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 16];
    let err = timeout(Duration::from_secs(5), c1.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed {
            reason: CloseReason::Reconnection
        }
    ));

    c2.close().await.unwrap();
    drop(server_c2);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_large_message_with_loss() {
    init_tracing();
    let listener = Listener::bind_with_config(loopback(), fast_config()).unwrap();
    let raddr = listener.local_addr().unwrap();
    let proxy = spawn_proxy(raddr, Impairment::DropNthData(5)).await;

    let message: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = message.clone();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 2 * 1024 * 1024];
        let n = conn.read(&mut buf).await.unwrap();
        (listener, conn, buf[..n.min(buf.len())].to_vec(), n)
    });

    let client = dial_with_config(None, proxy, fast_config()).await.unwrap();
    let written = client.write(&message).await.unwrap();
    assert_eq!(written, message.len());

    let (listener, server_conn, received, n) = timeout(Duration::from_secs(30), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(received, expected);

    client.close().await.unwrap();
    drop(server_conn);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_reorder_tolerance() {
    init_tracing();
    let listener = Listener::bind_with_config(loopback(), fast_config()).unwrap();
    let raddr = listener.local_addr().unwrap();
    let proxy = spawn_proxy(raddr, Impairment::SwapDataPairs).await;

    // Four fragments, so the proxy swaps both pairs.
    let message: Vec<u8> = (0..3 * MAX_DATA_SIZE + 17).map(|i| (i % 257) as u8).collect();

    let client = dial_with_config(None, proxy, fast_config()).await.unwrap();
    let server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    client.write(&message).await.unwrap();
    let mut buf = vec![0u8; 4 * MAX_DATA_SIZE];
    let n = timeout(Duration::from_secs(10), server_conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &message[..]);

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_bidirectional_sustained_traffic() {
    init_tracing();
    const COUNT: usize = 1000;

    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = Arc::new(dial(None, raddr).await.unwrap());
    let server_conn = Arc::new(
        timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap(),
    );

    async fn pump_out(conn: Arc<netioudp::Connection>, tag: &'static str) {
        for i in 0..COUNT {
            let msg = format!("{tag}-{i}");
            conn.write(msg.as_bytes()).await.unwrap();
        }
    }

    async fn pump_in(conn: Arc<netioudp::Connection>, tag: &'static str) {
        let mut buf = [0u8; 64];
        for i in 0..COUNT {
            let n = conn.read(&mut buf).await.unwrap();
            let expect = format!("{tag}-{i}");
            assert_eq!(&buf[..n], expect.as_bytes());
        }
    }

    let tasks = tokio::join!(
        tokio::spawn(pump_out(Arc::clone(&client), "c")),
        tokio::spawn(pump_out(Arc::clone(&server_conn), "s")),
        tokio::spawn(timeout(
            Duration::from_secs(30),
            pump_in(Arc::clone(&server_conn), "c")
        )),
        tokio::spawn(timeout(
            Duration::from_secs(30),
            pump_in(Arc::clone(&client), "s")
        )),
    );
    tasks.0.unwrap();
    tasks.1.unwrap();
    tasks.2.unwrap().unwrap();
    tasks.3.unwrap().unwrap();

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_message_boundaries() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = dial(None, raddr).await.unwrap();
    let server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    let sizes = [
        0,
        1,
        MAX_DATA_SIZE,
        MAX_DATA_SIZE + 1,
        5 * MAX_DATA_SIZE,
    ];
    let mut buf = vec![0u8; 6 * MAX_DATA_SIZE];
    for size in sizes {
        let msg: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        client.write(&msg).await.unwrap();
        let n = timeout(Duration::from_secs(10), server_conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, size);
        assert_eq!(&buf[..n], &msg[..]);
    }

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_close_idempotent() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = dial(None, raddr).await.unwrap();
    let _server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    client.close().await.unwrap();
    let err = client.close().await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed {
            reason: CloseReason::Local
        }
    ));

    // Reads and writes after close report the recorded reason.
    let mut buf = [0u8; 8];
    assert!(matches!(
        client.read(&mut buf).await,
        Err(Error::ConnectionClosed {
            reason: CloseReason::Local
        })
    ));
    assert!(matches!(
        client.write(b"late").await,
        Err(Error::ConnectionClosed {
            reason: CloseReason::Local
        })
    ));

    listener.close().await.unwrap();
    assert!(matches!(
        listener.close().await,
        Err(Error::ListenerClosed)
    ));
}

#[tokio::test]
async fn test_inactivity_timeout() {
    init_tracing();
    // A hand-rolled server that completes the handshake and then goes
    // silent: the client must close itself after the inactivity window.
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let raddr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        loop {
            let Ok((n, from)) = silent.recv_from(&mut buf).await else {
                return;
            };
            let Ok(hdr) = PacketHeader::decode(&buf[..n]) else {
                continue;
            };
            if hdr.kind() == Some(PacketKind::Conn) {
                let _ = silent.send_to(&ConnPacket::new(from).encode(), from).await;
            }
            // Everything after the handshake is ignored.
        }
    });

    let config = TransportConfig {
        check_interval: Duration::from_millis(100),
        connection_timeout: Duration::from_millis(400),
        ..TransportConfig::default()
    };
    let client = dial_with_config(None, raddr, config).await.unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 16];
    let err = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed {
            reason: CloseReason::Timeout
        }
    ));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_dial_timeout_without_server() {
    init_tracing();
    // A bound socket that never answers; the handshake must give up.
    let blackhole = UdpSocket::bind(loopback()).await.unwrap();
    let raddr = blackhole.local_addr().unwrap();

    let config = TransportConfig {
        handshake_timeout: Duration::from_millis(300),
        handshake_retransmit: Duration::from_millis(100),
        ..TransportConfig::default()
    };
    let err = dial_with_config(None, raddr, config).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionTimeout));
}

#[tokio::test]
async fn test_punch_then_dial() {
    init_tracing();
    let a = Arc::new(Listener::bind(loopback()).unwrap());
    let b = Arc::new(Listener::bind(loopback()).unwrap());
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    // Both sides punch towards each other; each one's pings are the
    // datagrams that complete the other's punch.
    let (pa, pb) = tokio::join!(
        a.punch(b_addr, Duration::from_secs(5), Duration::from_millis(50)),
        b.punch(a_addr, Duration::from_secs(5), Duration::from_millis(50)),
    );
    pa.unwrap();
    pb.unwrap();

    // With the path open, a regular dial over the shared socket works.
    let conn = timeout(Duration::from_secs(5), a.dial(b_addr))
        .await
        .unwrap()
        .unwrap();
    let accepted = timeout(Duration::from_secs(5), b.accept())
        .await
        .unwrap()
        .unwrap();

    conn.write(b"punched").await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), accepted.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"punched");

    conn.close().await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_read_deadline() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = dial(None, raddr).await.unwrap();
    let _server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    client.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 8];
    let err = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));

    // Clearing the deadline restores blocking reads.
    client.set_read_deadline(None);
    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_truncating_read_reports_full_length() {
    init_tracing();
    let listener = Listener::bind(loopback()).unwrap();
    let raddr = listener.local_addr().unwrap();

    let client = dial(None, raddr).await.unwrap();
    let server_conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    client.write(b"hello world").await.unwrap();
    let mut buf = [0u8; 5];
    let n = timeout(Duration::from_secs(5), server_conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 11);
    assert_eq!(&buf, b"hello");

    client.close().await.unwrap();
    listener.close().await.unwrap();
}
