//! The rendezvous server.
//!
//! A thin state machine over the transport: hosts register and get a
//! random connection ID, clients name that ID, and the server tells both
//! sides the other's address so they can punch towards each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, PuncherError, Result};
use crate::transport::{Connection, Listener, TransportConfig};

use super::message::{PuncherMessage, MAX_PUNCHER_MESSAGE_SIZE};

enum Event {
    /// A client asks to be punched through to the host with this ID.
    Punch { cid: u32, client: Arc<Connection> },
    /// A registered connection went away.
    Gone { cid: u32 },
}

/// Rendezvous server over a transport [`Listener`].
pub struct PuncherServer {
    listener: Arc<Listener>,
    quit: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PuncherServer {
    /// Bind the server and start serving.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, TransportConfig::default())
    }

    pub fn bind_with_config(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let listener = Arc::new(Listener::bind_with_config(addr, config)?);
        let quit = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&listener), quit.clone()));
        info!(%addr, "puncher server up");
        Ok(Self {
            listener,
            quit,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stop serving and close the underlying listener.
    pub async fn close(&self) -> Result<()> {
        self.quit.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.listener.close().await
    }
}

async fn run(listener: Arc<Listener>, quit: CancellationToken) {
    let (event_tx, mut event_rx) = mpsc::channel(32);
    let mut hosts: HashMap<u32, Arc<Connection>> = HashMap::new();

    loop {
        tokio::select! {
            () = quit.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok(conn) => {
                        let cid = rand::random::<u32>();
                        let conn = Arc::new(conn);
                        debug!(cid, peer = %conn.remote_addr(), "puncher connection accepted");
                        hosts.insert(cid, Arc::clone(&conn));
                        tokio::spawn(serve_conn(cid, conn, event_tx.clone(), quit.clone()));
                    }
                    Err(e) if e.is_closed() => return,
                    Err(e) => debug!(error = %e, "accept failed"),
                }
            }
            Some(event) = event_rx.recv() => match event {
                Event::Punch { cid, client } => {
                    let Some(host) = hosts.get(&cid) else {
                        debug!(cid, "punch request for unknown id");
                        continue;
                    };
                    let host_addr = host.remote_addr();
                    let client_addr = client.remote_addr();
                    debug!(cid, %host_addr, %client_addr, "relaying punch request");
                    if let Err(e) = host
                        .write(&PuncherMessage::CReq { addr: client_addr }.encode())
                        .await
                    {
                        debug!(cid, error = %e, "CReq to host failed");
                        continue;
                    }
                    if let Err(e) = client
                        .write(&PuncherMessage::CReq { addr: host_addr }.encode())
                        .await
                    {
                        debug!(cid, error = %e, "CReq to client failed");
                    }
                }
                Event::Gone { cid } => {
                    hosts.remove(&cid);
                }
            }
        }
    }
}

/// Per-connection message loop.
async fn serve_conn(
    cid: u32,
    conn: Arc<Connection>,
    events: mpsc::Sender<Event>,
    quit: CancellationToken,
) {
    let mut buf = [0u8; MAX_PUNCHER_MESSAGE_SIZE];
    loop {
        let read = tokio::select! {
            () = quit.cancelled() => return,
            read = conn.read(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n.min(buf.len()),
            Err(Error::ConnectionClosed { reason }) => {
                debug!(cid, %reason, "puncher connection closed");
                let _ = events.send(Event::Gone { cid }).await;
                return;
            }
            Err(e) => {
                debug!(cid, error = %e, "puncher read failed");
                let _ = events.send(Event::Gone { cid }).await;
                let _ = conn.close().await;
                return;
            }
        };
        match PuncherMessage::decode(&buf[..n]) {
            Ok(PuncherMessage::IdReq) => {
                if let Err(e) = conn.write(&PuncherMessage::AssId { cid }.encode()).await {
                    debug!(cid, error = %e, "AssId reply failed");
                }
            }
            Ok(PuncherMessage::SReq { cid: host_cid }) => {
                let _ = events
                    .send(Event::Punch {
                        cid: host_cid,
                        client: Arc::clone(&conn),
                    })
                    .await;
            }
            // AssId and CReq only ever travel server-to-client.
            Ok(msg) => debug!(cid, msg_type = msg.message_type(), "unexpected message"),
            Err(PuncherError::UnsupportedVersion(version)) => {
                warn!(cid, version, "unsupported rendezvous version, closing");
                let _ = events.send(Event::Gone { cid }).await;
                let _ = conn.close().await;
                return;
            }
            Err(e) => debug!(cid, error = %e, "invalid rendezvous message"),
        }
    }
}
