use crate::udp::listener::Shared;
use crate::DatagramConn;
use async_std::channel::Receiver;
use async_std::net::SocketAddr;
use async_trait::async_trait;
use log::*;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A per-peer connection carved out of a [`UdpListener`](crate::udp::UdpListener)'s socket.
///
/// Reads return the datagrams the listener routed to this peer, in arrival order. Writes go out
/// through the shared socket. Dropping the connection closes it.
pub struct UdpConn {
    shared: Arc<Shared>,
    pub(crate) peer_addr: SocketAddr,
    inbound: Receiver<Vec<u8>>,
    closed: AtomicBool,
}

impl UdpConn {
    pub(crate) fn new(shared: Arc<Shared>, peer_addr: SocketAddr, inbound: Receiver<Vec<u8>>) -> Self {
        Self {
            shared,
            peer_addr,
            inbound,
            closed: AtomicBool::new(false),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        trace!("Closing the connection with {}", self.peer_addr);
        self.inbound.close();
        self.shared.deregister(self.peer_addr);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

#[async_trait]
impl DatagramConn for UdpConn {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        match self.inbound.recv().await {
            Ok(datagram) => {
                let bytes_read = datagram.len().min(buf.len());
                buf[..bytes_read].copy_from_slice(&datagram[..bytes_read]);
                Ok(bytes_read)
            }

            Err(_) => Err(closed_error()),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        self.shared.send_to(buf, self.peer_addr).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.shared.local_addr())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }

    async fn close(&self) -> io::Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.shutdown();
    }
}
