//! UDP transport listener and per-peer connection implementations.
//!
//! <br/>
//!
//! This module exposes [`UdpListener`], which demultiplexes the datagrams arriving on one bound
//! socket into independent [`UdpConn`]s keyed by remote address, and [`ListenConfig`], which
//! decides which unknown peers are allowed to create such a connection.
//!

pub(crate) mod conn;
pub(crate) mod listener;

pub use conn::*;
pub use listener::*;

/// Largest datagram the receive loop reads in one call.
pub const RECEIVE_MTU: usize = 8192;
