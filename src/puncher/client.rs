//! Client-side rendezvous helpers.

use std::net::SocketAddr;

use tracing::debug;

use crate::error::{PuncherError, Result};
use crate::transport::Connection;

use super::message::{PuncherMessage, MAX_PUNCHER_MESSAGE_SIZE};

/// A rendezvous session over an established transport connection.
///
/// A host calls [`register`](Self::register) once and then waits for punch
/// targets; a client calls [`request_punch`](Self::request_punch) with the
/// host's announced ID.
pub struct PuncherClient {
    conn: Connection,
}

impl PuncherClient {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }

    /// Register as a host: request an ID and wait for the assignment.
    pub async fn register(&self) -> Result<u32> {
        self.conn.write(&PuncherMessage::IdReq.encode()).await?;
        loop {
            match self.next_message().await? {
                PuncherMessage::AssId { cid } => return Ok(cid),
                msg => debug!(msg_type = msg.message_type(), "ignoring while registering"),
            }
        }
    }

    /// Client role: ask to be served with punching for `cid` and wait for
    /// the host's address.
    pub async fn request_punch(&self, cid: u32) -> Result<SocketAddr> {
        self.conn
            .write(&PuncherMessage::SReq { cid }.encode())
            .await?;
        self.await_punch_target().await
    }

    /// Host role: wait for the next address the puncher asks us to punch
    /// towards.
    pub async fn await_punch_target(&self) -> Result<SocketAddr> {
        loop {
            match self.next_message().await? {
                PuncherMessage::CReq { addr } => return Ok(addr),
                msg => debug!(msg_type = msg.message_type(), "ignoring while awaiting punch"),
            }
        }
    }

    async fn next_message(&self) -> Result<PuncherMessage> {
        let mut buf = [0u8; MAX_PUNCHER_MESSAGE_SIZE];
        loop {
            let n = self.conn.read(&mut buf).await?;
            match PuncherMessage::decode(&buf[..n.min(buf.len())]) {
                Ok(msg) => return Ok(msg),
                // Malformed frames don't poison the session, but a version
                // mismatch does.
                Err(PuncherError::UnsupportedVersion(v)) => {
                    return Err(PuncherError::UnsupportedVersion(v).into())
                }
                Err(e) => debug!(error = %e, "invalid rendezvous message"),
            }
        }
    }
}
