//! Rendezvous service for NAT hole punching.
//!
//! Hosts behind NAT register with the puncher and receive a connection ID
//! they can announce out of band. A client that knows the ID asks the
//! puncher to be served, and the puncher tells both sides the other's
//! public address so they can punch towards each other:
//!
//! ```text
//!   Host                        Puncher                        Client
//!    │  ── transport connect ──►  │                              │
//!    │  ── IdReq ──────────────►  │                              │
//!    │  ◄────────────── AssId[id] │                              │
//!    │        (announce id)       │  ◄── transport connect ────  │
//!    │                            │  ◄── SReq[id] ─────────────  │
//!    │  ◄── CReq[client addr] ──  │  ── CReq[host addr] ──────►  │
//!    │                                                           │
//!    │  ◄═══════════════ UDP hole punching ═══════════════════►  │
//! ```
//!
//! Every rendezvous message travels as one message over the reliable
//! transport and fits in 20 bytes.

mod client;
mod message;
mod server;

pub use client::PuncherClient;
pub use message::{PuncherMessage, MAX_PUNCHER_MESSAGE_SIZE, PUNCHER_VERSION};
pub use server::PuncherServer;
