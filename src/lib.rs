//! This crate provides a connection-oriented listener for secure sessions over connectionless
//! datagram sockets.
//!
//! # Why?
//! A UDP socket has no notion of "accepting" a peer. Every datagram from any address lands on the
//! same socket, so a server that wants per-peer secure connections has to decide for itself when a
//! remote address deserves connection state. Doing that carelessly lets anyone on the network fill
//! the connection table with junk packets before a single handshake byte has been verified.
//!
//! The listeners in this crate make that decision from the first record of each datagram: only a
//! datagram that opens with a handshake record ever produces a connection. Everything else is
//! dropped silently on the receive path.
//!
//! # Layers
//! - [`udp`] demultiplexes one socket into per-peer [`udp::UdpConn`]s behind an accept filter.
//! - [`dtls`] validates configuration, classifies datagrams and upgrades raw connections into
//!   [`dtls::DtlsConn`]s.
//! - [`protocol`] holds the record header codec shared by both.
//!
//! # Examples
//! Please use the demo programs under `demos/` to help understand crate usage.

pub mod dtls;
pub mod protocol;
pub mod udp;

use async_std::net::{SocketAddr, UdpSocket};
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::*;
use std::error::Error;
use std::io;

pub use crate::dtls::{DtlsConn, DtlsListener, PassiveDtlsListener};
pub use futures::StreamExt;

/// Returned by [`Listener::accept`] once the listener has been closed.
///
#[derive(Debug, Clone)]
pub struct ListenerClosedError;

impl Error for ListenerClosedError {}

impl std::fmt::Display for ListenerClosedError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "listener is closed")
    }
}

/// A bidirectional, message-preserving connection with a single remote peer.
///
/// Every `send` writes exactly one datagram and every `recv` returns exactly one datagram (or one
/// decrypted record, for secure connections), truncated to the size of `buf`.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Close the connection. Closing an already closed connection is a no-op.
    async fn close(&self) -> io::Result<()>;
}

/// The generic accept-loop shape shared by every listener in this crate.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let listener = DtlsListener::bind("127.0.0.1:4444", config).await?;
///
/// loop {
///     let conn = listener.accept().await?;
///     // do something with connection
/// }
/// ```
#[async_trait]
pub trait Listener: Send + Sync {
    type Conn: Send;

    /// Waits for and returns the next connection.
    ///
    /// Returns a [`ListenerClosedError`] once the listener has been closed, including for calls
    /// that were already waiting when [`Listener::close`] was invoked.
    async fn accept(&self) -> anyhow::Result<Self::Conn>;

    /// Closes the listener without waiting. Connections already returned by `accept` stay open.
    fn close(&self) -> anyhow::Result<()>;

    fn local_addr(&self) -> SocketAddr;

    /// Turns the accept loop into a [`Stream`](futures::Stream) of connections.
    ///
    /// Failed connection attempts are logged and skipped. The stream ends when the listener is
    /// closed.
    ///
    /// # Example
    ///
    /// Basic usage:
    ///
    /// ```ignore
    /// let listener = DtlsListener::bind("127.0.0.1:4444", config).await?;
    /// let mut incoming = listener.incoming();
    ///
    /// while let Some(conn) = incoming.next().await {
    ///     // do something with connection
    /// }
    /// ```
    fn incoming(&self) -> BoxStream<'_, Self::Conn>
    where
        Self: Sized,
    {
        Box::pin(stream! {
            loop {
                match self.accept().await {
                    Ok(conn) => yield conn,

                    Err(err) if err.is::<ListenerClosedError>() => {
                        debug!("Listener at {} closed, ending incoming stream", self.local_addr());
                        break;
                    }

                    Err(err) => warn!("Could not accept connection: {:#}", err),
                }
            }
        })
    }
}

/// A connected socket acts as the client side of a datagram connection.
#[async_trait]
impl DatagramConn for UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
