//! Per-connection state machine.
//!
//! Every connection runs one engine task, the sole owner of its reassembly
//! and in-flight buffers. The engine selects over the raw-packet queue, the
//! send-submission queue, the periodic Check tick, the keep-alive timer and
//! the quit token. A connection created by [`dial`] also owns its socket and
//! a reader task; connections created through a [`super::Listener`] receive
//! raw packets from the listener's demultiplexer instead.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{CloseReason, Error, ProtocolError, Result, TransportError};
use crate::protocol::{
    CheckPacket, ClosePacket, ConnOkPacket, ConnPacket, DataHeader, PacketHeader, PacketKind,
    CONN_PACKET_SIZE, DATA_HDR_SIZE,
};
use crate::{MAX_MTU, PROTOCOL_VERSION};

use super::buffer::{FlightBuffer, ReassemblyBuffer, SendRecord};
use super::socket::{bind_udp, unspecified_for};
use super::{fragment_count, PacketWriter, RawPacket, TransportConfig, MAX_ASKS, MAX_DATA_SIZE};

#[derive(Debug, Default)]
struct CloseState {
    closed: bool,
    reason: Option<CloseReason>,
}

/// State shared between the connection handle, its engine task and (for
/// listener-owned connections) the listener's event loop.
pub(crate) struct ConnShared {
    /// Process-unique id, distinguishing reincarnations of the same
    /// remote address in the listener's tables.
    id: u64,
    writer: PacketWriter,
    quit: CancellationToken,
    close_state: Mutex<CloseState>,
    out_counter: AtomicU32,
    observed_addr: Mutex<Option<SocketAddr>>,
    suppress_close: AtomicBool,
    close_tx: Option<mpsc::Sender<(SocketAddr, u64)>>,
    pub(crate) config: TransportConfig,
}

impl ConnShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn quit(&self) -> &CancellationToken {
        &self.quit
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.writer.dest()
    }

    /// Suppress the outbound Close packet on the next shutdown.
    pub(crate) fn set_suppress_close(&self) {
        self.suppress_close.store(true, Ordering::Release);
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_state
            .lock()
            .reason
            .unwrap_or(CloseReason::Local);
        Error::ConnectionClosed { reason }
    }

    /// Send a raw packet, ignoring transient UDP errors; loss is repaired
    /// by Check-driven retransmission.
    pub(crate) async fn send_packet(&self, buf: &[u8]) {
        if let Err(e) = self.writer.send(buf).await {
            debug!(peer = %self.writer.dest(), error = %e, "packet send failed");
        }
    }

    async fn write_fragment(&self, payload: &[u8], nr: u32, fnr: u32, size: u32) {
        let mut buf = Vec::with_capacity(DATA_HDR_SIZE + payload.len());
        DataHeader::new(nr, fnr, size).encode_into(&mut buf);
        buf.extend_from_slice(payload);
        self.send_packet(&buf).await;
    }

    /// Tear the connection down. Idempotent: the first caller records the
    /// reason and signals quit; later callers get the closed error back.
    pub(crate) async fn shutdown(&self, reason: CloseReason) -> Result<()> {
        {
            let mut state = self.close_state.lock();
            if state.closed {
                let reason = state.reason.unwrap_or(CloseReason::Local);
                return Err(Error::ConnectionClosed { reason });
            }
            state.closed = true;
            if state.reason.is_none() {
                state.reason = Some(reason);
            }
        }
        self.quit.cancel();
        if !self.suppress_close.load(Ordering::Acquire) {
            let pkt = ClosePacket::new(self.writer.dest());
            if let Err(e) = self.writer.send(&pkt.encode()).await {
                debug!(peer = %self.writer.dest(), error = %e, "close packet send failed");
            }
        }
        // The listener must learn that this address is free again; the
        // notification never blocks the close itself.
        if let Some(tx) = &self.close_tx {
            if tx.try_send((self.writer.dest(), self.id)).is_err() {
                warn!(peer = %self.writer.dest(), "close notification queue full");
            }
        }
        Ok(())
    }
}

/// Everything the engine task owns.
pub(crate) struct EngineParts {
    pub shared: Arc<ConnShared>,
    pub rfu_rx: mpsc::Receiver<io::Result<RawPacket>>,
    pub send_rx: mpsc::Receiver<SendRecord>,
    pub data_tx: mpsc::Sender<Vec<u8>>,
    pub err_tx: mpsc::Sender<Error>,
}

/// A freshly built connection: the public handle, the engine half (to be
/// spawned once the handshake settles) and the raw-packet feed.
pub(crate) struct ConnParts {
    pub conn: Connection,
    pub engine: EngineParts,
    pub rfu_tx: mpsc::Sender<io::Result<RawPacket>>,
    pub shared: Arc<ConnShared>,
}

pub(crate) fn build_conn(
    writer: PacketWriter,
    config: TransportConfig,
    close_tx: Option<mpsc::Sender<(SocketAddr, u64)>>,
    suppress_close: bool,
) -> ConnParts {
    static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

    let (rfu_tx, rfu_rx) = mpsc::channel(config.raw_queue);
    let (data_tx, data_rx) = mpsc::channel(config.message_queue);
    let (err_tx, err_rx) = mpsc::channel(1);
    let (send_tx, send_rx) = mpsc::channel(config.send_queue);

    let shared = Arc::new(ConnShared {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        writer,
        quit: CancellationToken::new(),
        close_state: Mutex::new(CloseState::default()),
        out_counter: AtomicU32::new(0),
        observed_addr: Mutex::new(None),
        suppress_close: AtomicBool::new(suppress_close),
        close_tx,
        config,
    });

    let conn = Connection {
        shared: Arc::clone(&shared),
        data_rx: tokio::sync::Mutex::new(data_rx),
        err_rx: tokio::sync::Mutex::new(err_rx),
        send_tx,
        deadlines: Mutex::new(Deadlines::default()),
    };

    ConnParts {
        conn,
        engine: EngineParts {
            shared: Arc::clone(&shared),
            rfu_rx,
            send_rx,
            data_tx,
            err_tx,
        },
        rfu_tx,
        shared,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

/// A reliable, message-oriented connection.
///
/// `write` submits whole messages; `read` yields them whole on the other
/// side, in submission order, exactly once.
pub struct Connection {
    shared: Arc<ConnShared>,
    data_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,
    send_tx: mpsc::Sender<SendRecord>,
    deadlines: Mutex<Deadlines>,
}

impl Connection {
    /// Read one reassembled message.
    ///
    /// Returns the full message length; if `buf` is shorter, the copy is
    /// truncated to fit while the return value still reports the message
    /// size.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = self.deadlines.lock().read;
        let recv = async {
            let mut data_rx = self.data_rx.lock().await;
            let mut err_rx = self.err_rx.lock().await;
            tokio::select! {
                msg = data_rx.recv() => match msg {
                    Some(data) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        Ok(data.len())
                    }
                    None => Err(self.shared.closed_error()),
                },
                err = err_rx.recv() => match err {
                    Some(e) => Err(e),
                    None => Err(self.shared.closed_error()),
                },
                () = self.shared.quit.cancelled() => Err(self.shared.closed_error()),
            }
        };
        match deadline {
            Some(at) => time::timeout_at(at, recv)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => recv.await,
        }
    }

    /// Write one message atomically.
    ///
    /// The message is fragmented, every fragment is sent immediately, and a
    /// copy is retained for retransmission until the peer acknowledges it.
    pub async fn write(&self, msg: &[u8]) -> Result<usize> {
        let deadline = self.deadlines.lock().write;
        let send = async {
            if self.shared.quit.is_cancelled() {
                return Err(self.shared.closed_error());
            }
            let count = fragment_count(msg.len());
            // Zero-based block reservation: the first fragment gets the
            // counter value before the add.
            let fnr = self
                .shared
                .out_counter
                .fetch_add(count as u32, Ordering::SeqCst);
            let size = msg.len() as u32;
            let mut fragments = Vec::with_capacity(count);
            for i in 0..count {
                let lo = i * MAX_DATA_SIZE;
                let hi = msg.len().min(lo + MAX_DATA_SIZE);
                let frag = msg[lo..hi].to_vec();
                self.shared
                    .write_fragment(&frag, fnr + i as u32, fnr, size)
                    .await;
                fragments.push(frag);
            }
            self.send_tx
                .send(SendRecord {
                    fnr,
                    size,
                    fragments,
                })
                .await
                .map_err(|_| self.shared.closed_error())?;
            Ok(msg.len())
        };
        match deadline {
            Some(at) => time::timeout_at(at, send)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => send.await,
        }
    }

    /// Close the connection. The first close sends a Close packet to the
    /// peer (unless suppressed) and wakes every pending read/write; any
    /// later close returns the recorded close reason as an error.
    pub async fn close(&self) -> Result<()> {
        self.shared.shutdown(CloseReason::Local).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared
            .writer
            .socket()
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.writer.dest()
    }

    /// Our address as observed by the peer during the handshake, if this
    /// side dialed.
    pub fn peer_observed_addr(&self) -> Option<SocketAddr> {
        *self.shared.observed_addr.lock()
    }

    /// Set both read and write deadlines; `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut d = self.deadlines.lock();
        d.read = deadline;
        d.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().write = deadline;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    /// Dropping the handle without `close` tears the connection down
    /// abruptly: the tasks stop and the listener forgets the address, but
    /// no Close packet is sent (the peer discovers the loss via its
    /// inactivity timeout).
    fn drop(&mut self) {
        let first = {
            let mut state = self.shared.close_state.lock();
            if state.closed {
                false
            } else {
                state.closed = true;
                if state.reason.is_none() {
                    state.reason = Some(CloseReason::Local);
                }
                true
            }
        };
        if first {
            self.shared.quit.cancel();
            if let Some(tx) = &self.shared.close_tx {
                let _ = tx.try_send((self.shared.writer.dest(), self.shared.id));
            }
        }
    }
}

/// Dial a remote transport endpoint over a dedicated UDP socket.
pub async fn dial(local: Option<SocketAddr>, remote: SocketAddr) -> Result<Connection> {
    dial_with_config(local, remote, TransportConfig::default()).await
}

/// [`dial`] with explicit transport configuration.
pub async fn dial_with_config(
    local: Option<SocketAddr>,
    remote: SocketAddr,
    config: TransportConfig,
) -> Result<Connection> {
    let bind = local.unwrap_or_else(|| unspecified_for(remote));
    let socket = bind_udp(bind, &config)?;
    socket
        .connect(remote)
        .await
        .map_err(|e| Error::ConnectionFailed {
            addr: remote,
            reason: e.to_string(),
        })?;
    let socket = Arc::new(socket);
    let writer = PacketWriter::new_connected(Arc::clone(&socket), remote);
    let mut parts = build_conn(writer, config, None, false);

    tokio::spawn(read_connected(
        socket,
        parts.rfu_tx.clone(),
        parts.shared.quit.clone(),
    ));

    if let Err(e) = connect_handshake(&parts.shared, &mut parts.engine.rfu_rx).await {
        parts.shared.quit.cancel();
        return Err(e);
    }
    tokio::spawn(run_engine(parts.engine));
    Ok(parts.conn)
}

/// Client side of the three-way handshake.
///
/// Sends Conn, retransmits it on an interval, and waits for the server's
/// Conn reply carrying our address as the server sees it. Unexpected or
/// short packets are dropped and the wait continues; the reply's protocol
/// version must match ours. Finishes by sending ConnOK (not acknowledged,
/// not retransmitted).
pub(crate) async fn connect_handshake(
    shared: &ConnShared,
    rfu_rx: &mut mpsc::Receiver<io::Result<RawPacket>>,
) -> Result<SocketAddr> {
    let encoded = ConnPacket::new(shared.writer.dest()).encode();
    shared
        .writer
        .send(&encoded)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    let deadline = Instant::now() + shared.config.handshake_timeout;
    let mut resend = time::interval_at(
        Instant::now() + shared.config.handshake_retransmit,
        shared.config.handshake_retransmit,
    );
    loop {
        tokio::select! {
            () = time::sleep_until(deadline) => return Err(Error::ConnectionTimeout),
            _ = resend.tick() => {
                shared.send_packet(&encoded).await;
            }
            raw = rfu_rx.recv() => {
                let raw = match raw {
                    None => return Err(shared.closed_error()),
                    Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string()).into()),
                    Some(Ok(raw)) => raw,
                };
                if raw.buf.len() < CONN_PACKET_SIZE {
                    continue;
                }
                let Ok(hdr) = PacketHeader::decode(&raw.buf) else {
                    continue;
                };
                if hdr.kind() != Some(PacketKind::Conn) {
                    trace!(kind = hdr.status, "ignoring packet during handshake");
                    continue;
                }
                let reply = ConnPacket::decode(&raw.buf)?;
                if reply.protocol_ver != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(reply.protocol_ver).into());
                }
                *shared.observed_addr.lock() = Some(reply.addr);
                let ok = ConnOkPacket::new(shared.writer.dest());
                shared
                    .writer
                    .send(&ok.encode())
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                return Ok(reply.addr);
            }
        }
    }
}

/// The engine task: sole mutator of the connection's buffers and counters.
pub(crate) async fn run_engine(parts: EngineParts) {
    let EngineParts {
        shared,
        mut rfu_rx,
        mut send_rx,
        data_tx,
        err_tx,
    } = parts;

    let mut reasm = ReassemblyBuffer::new();
    let mut flight = FlightBuffer::new();
    let mut check = time::interval_at(
        Instant::now() + shared.config.check_interval,
        shared.config.check_interval,
    );
    check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let keepalive = time::sleep(shared.config.connection_timeout);
    tokio::pin!(keepalive);

    loop {
        tokio::select! {
            () = shared.quit.cancelled() => return,
            _ = check.tick() => {
                let pkt = CheckPacket::new(
                    reasm.asks(MAX_ASKS),
                    reasm.next_expected(),
                    shared.out_counter.load(Ordering::SeqCst),
                );
                shared.send_packet(&pkt.encode()).await;
            }
            () = &mut keepalive => {
                debug!(peer = %shared.writer.dest(), "inactivity timeout");
                let _ = shared.shutdown(CloseReason::Timeout).await;
                return;
            }
            raw = rfu_rx.recv() => {
                match raw {
                    None => return,
                    Some(Err(e)) => {
                        let _ = err_tx.try_send(
                            TransportError::ReceiveFailed(e.to_string()).into(),
                        );
                    }
                    Some(Ok(raw)) => {
                        let handled =
                            handle_packet(&shared, &raw.buf, &mut reasm, &mut flight, &data_tx)
                                .await;
                        if shared.quit.is_cancelled() {
                            return;
                        }
                        if handled {
                            keepalive
                                .as_mut()
                                .reset(Instant::now() + shared.config.connection_timeout);
                        }
                    }
                }
            }
            record = send_rx.recv() => {
                if let Some(record) = record {
                    flight.insert(record);
                }
            }
        }
    }
}

/// React to one raw packet. Returns whether the packet was valid for this
/// connection (and therefore resets the keep-alive timer).
async fn handle_packet(
    shared: &ConnShared,
    buf: &[u8],
    reasm: &mut ReassemblyBuffer,
    flight: &mut FlightBuffer,
    data_tx: &mpsc::Sender<Vec<u8>>,
) -> bool {
    let Ok(hdr) = PacketHeader::decode(buf) else {
        return false;
    };
    // Track the peer's counter from every header, Check packets included:
    // that is how trailing losses surface in the ask list.
    reasm.observe(hdr.nr);

    match hdr.kind() {
        Some(PacketKind::Ping) => {
            shared
                .send_packet(&PacketHeader::new(PacketKind::Ping, 0).encode())
                .await;
            true
        }
        Some(PacketKind::Data) => {
            let Ok(data) = DataHeader::decode(buf) else {
                return false;
            };
            if reasm.is_duplicate(data.nr) {
                trace!(nr = data.nr, "duplicate fragment");
                return false;
            }
            let payload = buf[DATA_HDR_SIZE..].to_vec();
            for msg in reasm.insert(data.nr, data.fnr, data.size, payload) {
                // Delivery into the bounded queue must stay cancel-safe: a
                // connection closing under a slow reader may never drain it.
                tokio::select! {
                    () = shared.quit.cancelled() => return true,
                    sent = data_tx.send(msg) => {
                        if sent.is_err() {
                            return true;
                        }
                    }
                }
            }
            true
        }
        Some(PacketKind::Check) => {
            let Ok(check) = CheckPacket::decode(buf) else {
                return false;
            };
            flight.ack(check.ack_nr);
            for rt in flight.retransmits(&check.asks) {
                shared
                    .write_fragment(rt.payload, rt.nr, rt.fnr, rt.size)
                    .await;
            }
            true
        }
        Some(PacketKind::Close) => {
            shared.set_suppress_close();
            let _ = shared.shutdown(CloseReason::Peer).await;
            true
        }
        // Test and AddAddr are silently discarded; unknown kinds and stray
        // handshake packets are dropped. None of them reset the keep-alive.
        Some(
            PacketKind::Test | PacketKind::AddAddr | PacketKind::Conn | PacketKind::ConnOk,
        )
        | None => false,
    }
}

/// Reader task for a connection that owns its (connected) socket.
pub(crate) async fn read_connected(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<io::Result<RawPacket>>,
    quit: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_MTU];
    loop {
        let res = tokio::select! {
            () = quit.cancelled() => return,
            res = socket.recv(&mut buf) => res,
        };
        let item = res.map(|n| RawPacket {
            buf: buf[..n].to_vec(),
        });
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
