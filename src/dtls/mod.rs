//! Secure listeners over datagram transports.
//!
//! <br/>
//!
//! This module exposes [`DtlsListener`], which completes a handshake before returning each
//! connection, [`PassiveDtlsListener`], which leaves the handshake to the caller, and the
//! [`accept_handshake`] predicate both of them install on the UDP transport so that only
//! datagrams opening a handshake ever allocate a connection.
//!

pub(crate) mod config;
pub(crate) mod conn;
pub(crate) mod filter;
pub mod handshake;
pub(crate) mod listener;

pub use config::*;
pub use conn::{DtlsConn, MAX_PAYLOAD_SIZE};
pub use filter::*;
pub use handshake::HandshakeError;
pub use listener::*;
