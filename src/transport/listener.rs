//! Listener: one UDP socket multiplexed across many connections.
//!
//! A single reader task feeds raw datagrams into the event loop, which
//! routes them by source address: registered outbound dials first, then the
//! handshake tables (Conn creates an in-progress entry, ConnOK promotes
//! it), then established connections. Children notify the event loop on
//! close so their address can be reused; the listener's socket outlives
//! every child because they all write through it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{CloseReason, Error, Result, TransportError};
use crate::protocol::{
    ConnPacket, PacketHeader, PacketKind, CONN_OK_PACKET_SIZE, CONN_PACKET_SIZE,
};
use crate::MAX_MTU;

use super::conn::{
    build_conn, connect_handshake, run_engine, ConnParts, ConnShared, Connection,
};
use super::socket::bind_udp;
use super::{PacketWriter, RawPacket, TransportConfig};

/// An outbound connection (dial or punch) registered for packet forwarding.
struct Registration {
    raddr: SocketAddr,
    id: u64,
    rfu_tx: mpsc::Sender<io::Result<RawPacket>>,
}

/// An established child connection as the event loop sees it.
struct ConnEntry {
    rfu_tx: mpsc::Sender<io::Result<RawPacket>>,
    shared: Arc<ConnShared>,
}

/// Listener for inbound transport connections over a shared UDP socket.
pub struct Listener {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    quit: CancellationToken,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,
    reg_tx: mpsc::Sender<Registration>,
    close_tx: mpsc::Sender<(SocketAddr, u64)>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Listener {
    /// Bind a listener to `addr` with default configuration.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, TransportConfig::default())
    }

    /// Bind a listener with explicit transport configuration.
    ///
    /// Must be called from within a tokio runtime: the listener spawns its
    /// reader and event-loop tasks immediately.
    pub fn bind_with_config(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let socket = Arc::new(bind_udp(addr, &config)?);
        let quit = CancellationToken::new();

        let (raw_tx, raw_rx) = mpsc::channel(config.raw_queue);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (err_tx, err_rx) = mpsc::channel(16);
        let (reg_tx, reg_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = mpsc::channel(config.accept_backlog);
        let (timeout_tx, timeout_rx) = mpsc::channel(config.accept_backlog);

        tokio::spawn(read_datagrams(
            Arc::clone(&socket),
            raw_tx,
            quit.clone(),
        ));
        let event_loop = EventLoop {
            socket: Arc::clone(&socket),
            config: config.clone(),
            quit: quit.clone(),
            raw_rx,
            reg_rx,
            close_rx,
            close_tx: close_tx.clone(),
            accept_tx,
            err_tx,
            timeout_tx,
            timeout_rx,
            conns: HashMap::new(),
            pending: HashMap::new(),
            dials: HashMap::new(),
        };
        let handle = tokio::spawn(event_loop.run());

        info!(%addr, "transport listener up");
        Ok(Self {
            socket,
            config,
            quit,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            err_rx: tokio::sync::Mutex::new(err_rx),
            reg_tx,
            close_tx,
            event_loop: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next established inbound connection.
    ///
    /// Socket errors observed by the listener's reader surface here.
    pub async fn accept(&self) -> Result<Connection> {
        let mut accept_rx = self.accept_rx.lock().await;
        let mut err_rx = self.err_rx.lock().await;
        tokio::select! {
            conn = accept_rx.recv() => conn.ok_or(Error::ListenerClosed),
            err = err_rx.recv() => Err(err.unwrap_or(Error::ListenerClosed)),
            () = self.quit.cancelled() => Err(Error::ListenerClosed),
        }
    }

    /// Dial an outbound connection over the shared socket.
    pub async fn dial(&self, remote: SocketAddr) -> Result<Connection> {
        if self.quit.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        let writer = PacketWriter::new(Arc::clone(&self.socket), remote);
        let mut parts = build_conn(
            writer,
            self.config.clone(),
            Some(self.close_tx.clone()),
            false,
        );
        self.reg_tx
            .send(Registration {
                raddr: remote,
                id: parts.shared.id(),
                rfu_tx: parts.rfu_tx.clone(),
            })
            .await
            .map_err(|_| Error::ListenerClosed)?;
        match connect_handshake(&parts.shared, &mut parts.engine.rfu_rx).await {
            Ok(_) => {
                tokio::spawn(run_engine(parts.engine));
                Ok(parts.conn)
            }
            Err(e) => {
                // Deregister through the normal close path; the handshake
                // never completed, so no Close packet goes out.
                parts.shared.set_suppress_close();
                let _ = parts.shared.shutdown(CloseReason::Local).await;
                Err(e)
            }
        }
    }

    /// Punch a hole towards `remote`: send a Ping every `interval` until
    /// any datagram arrives from that address or `timeout` elapses. On
    /// success one final Ping confirms the path.
    pub async fn punch(
        &self,
        remote: SocketAddr,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        if self.quit.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        let writer = PacketWriter::new(Arc::clone(&self.socket), remote);
        let mut parts = build_conn(
            writer,
            self.config.clone(),
            Some(self.close_tx.clone()),
            true,
        );
        self.reg_tx
            .send(Registration {
                raddr: remote,
                id: parts.shared.id(),
                rfu_tx: parts.rfu_tx.clone(),
            })
            .await
            .map_err(|_| Error::ListenerClosed)?;

        let ping = PacketHeader::new(PacketKind::Ping, 0).encode();
        let deadline = Instant::now() + timeout;
        let mut tick = time::interval(interval);
        let result = loop {
            tokio::select! {
                () = time::sleep_until(deadline) => break Err(Error::PunchTimeout),
                _ = tick.tick() => {
                    parts.shared.send_packet(&ping).await;
                }
                raw = parts.engine.rfu_rx.recv() => {
                    match raw {
                        None => break Err(Error::ListenerClosed),
                        Some(Err(_)) => {}
                        Some(Ok(_)) => {
                            trace!(peer = %remote, "punch reply observed");
                            parts.shared.send_packet(&ping).await;
                            break Ok(());
                        }
                    }
                }
            }
        };
        let _ = parts.shared.shutdown(CloseReason::Local).await;
        result
    }

    /// Close the listener: every established child connection is closed
    /// first, then the socket goes away. Further calls return an error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::ListenerClosed);
        }
        self.quit.cancel();
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("transport listener down");
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // The event loop observes the cancellation and closes every child
        // before it exits; `close` does the same but waits for it.
        self.quit.cancel();
    }
}

/// Reader task: pulls raw datagrams off the shared socket.
async fn read_datagrams(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<io::Result<(Vec<u8>, SocketAddr)>>,
    quit: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_MTU];
    loop {
        let res = tokio::select! {
            () = quit.cancelled() => return,
            res = socket.recv_from(&mut buf) => res,
        };
        let item = res.map(|(n, addr)| (buf[..n].to_vec(), addr));
        tokio::select! {
            () = quit.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

struct EventLoop {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    quit: CancellationToken,
    raw_rx: mpsc::Receiver<io::Result<(Vec<u8>, SocketAddr)>>,
    reg_rx: mpsc::Receiver<Registration>,
    close_rx: mpsc::Receiver<(SocketAddr, u64)>,
    close_tx: mpsc::Sender<(SocketAddr, u64)>,
    accept_tx: mpsc::Sender<Connection>,
    err_tx: mpsc::Sender<Error>,
    timeout_tx: mpsc::Sender<SocketAddr>,
    timeout_rx: mpsc::Receiver<SocketAddr>,
    /// Established connections by remote address.
    conns: HashMap<SocketAddr, ConnEntry>,
    /// Inbound handshakes awaiting ConnOK.
    pending: HashMap<SocketAddr, ConnParts>,
    /// Outbound dials and punches, managed by their callers.
    dials: HashMap<SocketAddr, Registration>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                // Table maintenance before datagram dispatch, so a stale
                // dial registration can never shadow a fresh handshake
                // from the same address.
                biased;
                () = self.quit.cancelled() => {
                    self.shutdown_children().await;
                    return;
                }
                Some((addr, id)) = self.close_rx.recv() => {
                    // The id guards against a stale notification evicting a
                    // newer connection that reuses the same remote address.
                    if self.conns.get(&addr).is_some_and(|e| e.shared.id() == id) {
                        self.conns.remove(&addr);
                    }
                    if self.dials.get(&addr).is_some_and(|r| r.id == id) {
                        self.dials.remove(&addr);
                    }
                }
                Some(reg) = self.reg_rx.recv() => {
                    self.dials.insert(reg.raddr, reg);
                }
                Some(key) = self.timeout_rx.recv() => {
                    if self.pending.remove(&key).is_some() {
                        debug!(peer = %key, "inbound handshake timed out");
                    }
                }
                raw = self.raw_rx.recv() => {
                    match raw {
                        None => return,
                        Some(Err(e)) => {
                            let _ = self.err_tx.try_send(
                                TransportError::ReceiveFailed(e.to_string()).into(),
                            );
                        }
                        Some(Ok((buf, addr))) => self.handle_datagram(buf, addr).await,
                    }
                }
            }
        }
    }

    async fn handle_datagram(&mut self, buf: Vec<u8>, addr: SocketAddr) {
        // Dials are always managed externally.
        if let Some(reg) = self.dials.get(&addr) {
            if reg.rfu_tx.try_send(Ok(RawPacket { buf })).is_err() {
                warn!(peer = %addr, "dial raw queue full, dropping datagram");
            }
            return;
        }

        let Ok(hdr) = PacketHeader::decode(&buf) else {
            return;
        };
        match hdr.kind() {
            Some(PacketKind::Conn) => {
                if buf.len() < CONN_PACKET_SIZE {
                    return;
                }
                if let Some(old) = self.conns.remove(&addr) {
                    // Re-connection: supersede without telling the peer,
                    // since the peer is the one reconnecting.
                    debug!(peer = %addr, "superseding established connection");
                    old.shared.set_suppress_close();
                    let _ = old.shared.shutdown(CloseReason::Reconnection).await;
                }
                let writer = PacketWriter::new(Arc::clone(&self.socket), addr);
                let parts = build_conn(
                    writer,
                    self.config.clone(),
                    Some(self.close_tx.clone()),
                    false,
                );
                // The client does the version check; our reply tells it
                // which address it appears as.
                let reply = ConnPacket::new(addr).encode();
                if let Err(e) = self.socket.send_to(&reply, addr).await {
                    debug!(peer = %addr, error = %e, "conn reply send failed");
                }
                self.pending.insert(addr, parts);
                let timeout_tx = self.timeout_tx.clone();
                let handshake_timeout = self.config.handshake_timeout;
                tokio::spawn(async move {
                    time::sleep(handshake_timeout).await;
                    let _ = timeout_tx.send(addr).await;
                });
            }
            Some(PacketKind::ConnOk) => {
                if buf.len() < CONN_OK_PACKET_SIZE {
                    return;
                }
                // Nothing of interest in the packet itself: multicast is
                // disabled, so only the arrival matters.
                let Some(parts) = self.pending.remove(&addr) else {
                    return;
                };
                let ConnParts {
                    conn,
                    engine,
                    rfu_tx,
                    shared,
                } = parts;
                self.conns.insert(addr, ConnEntry { rfu_tx, shared });
                tokio::spawn(run_engine(engine));
                tokio::select! {
                    () = self.quit.cancelled() => {}
                    _ = self.accept_tx.send(conn) => {}
                }
            }
            _ => {
                if let Some(entry) = self.conns.get(&addr) {
                    if entry.rfu_tx.try_send(Ok(RawPacket { buf })).is_err() {
                        warn!(peer = %addr, "raw queue full, dropping datagram");
                    }
                }
            }
        }
    }

    /// Close every established child before the socket can go away. The
    /// close-notification queue is drained throughout so that no child's
    /// shutdown can find it full.
    async fn shutdown_children(&mut self) {
        for (_, entry) in self.conns.drain() {
            while self.close_rx.try_recv().is_ok() {}
            let _ = entry.shared.shutdown(CloseReason::Local).await;
        }
    }
}
