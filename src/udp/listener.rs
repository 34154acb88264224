use crate::udp::{UdpConn, RECEIVE_MTU};
use crate::{Listener, ListenerClosedError};
use async_std::channel::{self, Receiver, Sender};
use async_std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use async_std::task;
use async_trait::async_trait;
use futures_lite::future;
use log::*;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of connections that may wait in the accept queue when none is configured.
pub const DEFAULT_BACKLOG: usize = 128;

/// Number of datagrams buffered per connection before further datagrams are dropped.
const INBOUND_QUEUE_SIZE: usize = 64;

/// Decides whether a datagram from a peer without a connection may create one.
///
/// The filter runs on the receive loop for every datagram from an unknown address, so it must not
/// block or perform I/O.
pub type AcceptFilter = fn(&[u8]) -> bool;

/// Options used to bind a [`UdpListener`].
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let config = ListenConfig {
///     accept_filter: Some(|datagram| datagram.first() == Some(&22)),
///     ..ListenConfig::default()
/// };
/// let listener = config.listen("127.0.0.1:4444").await?;
/// ```
#[derive(Clone, Copy)]
pub struct ListenConfig {
    /// Maximum number of connections waiting to be accepted. Attempts beyond it are dropped.
    pub backlog: usize,
    /// Without a filter, any datagram from an unknown peer creates a connection.
    pub accept_filter: Option<AcceptFilter>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            accept_filter: None,
        }
    }
}

impl std::fmt::Debug for ListenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ListenConfig")
            .field("backlog", &self.backlog)
            .field("accept_filter", &self.accept_filter.is_some())
            .finish()
    }
}

impl ListenConfig {
    /// Binds a socket to an IP address and port and starts demultiplexing its datagrams.
    pub async fn listen<A: ToSocketAddrs + std::fmt::Display>(
        &self,
        ip_addrs: A,
    ) -> anyhow::Result<UdpListener> {
        let socket = UdpSocket::bind(&ip_addrs).await?;
        let local_addr = socket.local_addr()?;
        info!("Started UDP listener at {}", local_addr);

        let backlog = if self.backlog > 0 {
            self.backlog
        } else {
            DEFAULT_BACKLOG
        };

        let (accept_tx, accept_rx) = channel::bounded(backlog);
        let (done_tx, done_rx) = channel::bounded(1);

        let shared = Arc::new(Shared {
            socket,
            local_addr,
            accept_filter: self.accept_filter,
            conns: Mutex::new(HashMap::new()),
            accept_tx,
            done_tx,
            closed: AtomicBool::new(false),
        });

        task::spawn(read_loop(shared.clone(), done_rx));

        Ok(UdpListener { shared, accept_rx })
    }
}

/// State shared between the listener, its receive loop and every connection it created.
pub(crate) struct Shared {
    socket: UdpSocket,
    local_addr: SocketAddr,
    accept_filter: Option<AcceptFilter>,
    conns: Mutex<HashMap<SocketAddr, Sender<Vec<u8>>>>,
    accept_tx: Sender<UdpConn>,
    done_tx: Sender<()>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) async fn send_to(&self, buf: &[u8], peer_addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, peer_addr).await
    }

    /// Forget the connection with `peer_addr`. Once the listener is closed, the last connection
    /// to go away stops the receive loop.
    pub(crate) fn deregister(&self, peer_addr: SocketAddr) {
        let idle = {
            let mut conns = self.conns();
            conns.remove(&peer_addr);
            conns.is_empty()
        };

        if idle && self.closed.load(Ordering::SeqCst) {
            self.done_tx.close();
        }
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<SocketAddr, Sender<Vec<u8>>>> {
        self.conns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_if_idle(&self) {
        if self.conns().is_empty() {
            self.done_tx.close();
        }
    }

    fn dispatch(self: &Arc<Self>, datagram: &[u8], peer_addr: SocketAddr) {
        let conn = {
            let mut conns = self.conns();

            if let Some(inbound) = conns.get(&peer_addr) {
                if inbound.try_send(datagram.to_vec()).is_err() {
                    trace!("Dropping datagram from {}, receive queue is full", peer_addr);
                }
                return;
            }

            if self.closed.load(Ordering::SeqCst) {
                trace!("Ignoring datagram from {}, listener is closed", peer_addr);
                return;
            }

            if let Some(accept_filter) = self.accept_filter {
                if !accept_filter(datagram) {
                    trace!(
                        "Rejected {} byte datagram from unknown peer {}",
                        datagram.len(),
                        peer_addr
                    );
                    return;
                }
            }

            if self.accept_tx.is_full() {
                debug!(
                    "Accept backlog is full, dropping connection attempt from {}",
                    peer_addr
                );
                return;
            }

            let (inbound_tx, inbound_rx) = channel::bounded(INBOUND_QUEUE_SIZE);
            if inbound_tx.try_send(datagram.to_vec()).is_err() {
                return;
            }

            conns.insert(peer_addr, inbound_tx);
            UdpConn::new(self.clone(), peer_addr, inbound_rx)
        };

        debug!("Received connection attempt from {}", peer_addr);

        // dropping a rejected conn deregisters it, so this must run without the lock held
        if self.accept_tx.try_send(conn).is_err() {
            debug!("Could not queue connection from {}, listener closed", peer_addr);
        }
    }
}

async fn read_loop(shared: Arc<Shared>, done: Receiver<()>) {
    let mut buffer = vec![0; RECEIVE_MTU];

    loop {
        let received = future::or(
            async { Some(shared.socket.recv_from(&mut buffer).await) },
            async {
                let _ = done.recv().await;
                None
            },
        )
        .await;

        match received {
            Some(Ok((bytes_read, peer_addr))) => shared.dispatch(&buffer[..bytes_read], peer_addr),

            Some(Err(e)) => {
                error!(
                    "Encountered error when reading from UDP socket at {}: {}",
                    shared.local_addr, e
                );
                break;
            }

            None => break,
        }
    }

    debug!("Stopped receive loop at {}", shared.local_addr);
    shared.closed.store(true, Ordering::SeqCst);
    shared.accept_tx.close();

    for (_, inbound) in shared.conns().drain() {
        inbound.close();
    }
}

/// Listens on a bound UDP socket and hands out one [`UdpConn`] per remote address.
///
/// Datagrams from a peer that already has a connection are queued on that connection. Datagrams
/// from unknown peers create a new connection only when the configured accept filter allows it.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let listener = UdpListener::bind("127.0.0.1:4444").await?;
///
/// let conn = listener.accept().await?;
/// let bytes_read = conn.recv(&mut buf).await?;
/// ```
pub struct UdpListener {
    shared: Arc<Shared>,
    accept_rx: Receiver<UdpConn>,
}

impl UdpListener {
    /// Creates a [`UdpListener`] with the default [`ListenConfig`], which accepts every peer.
    pub async fn bind<A: ToSocketAddrs + std::fmt::Display>(ip_addrs: A) -> anyhow::Result<Self> {
        ListenConfig::default().listen(ip_addrs).await
    }

    /// Waits for the next peer to be admitted by the accept filter.
    pub async fn accept(&self) -> anyhow::Result<UdpConn> {
        let conn = self
            .accept_rx
            .recv()
            .await
            .map_err(|_| ListenerClosedError)?;
        debug!("Accepted connection from {}", conn.peer_addr);

        Ok(conn)
    }

    /// Stops admitting new peers and unblocks pending `accept` calls.
    ///
    /// Connections that were queued but never accepted are closed. Accepted connections keep
    /// working; the socket is released once the last of them is closed.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(ListenerClosedError.into());
        }

        info!("Closing UDP listener at {}", self.shared.local_addr);
        self.accept_rx.close();
        while let Ok(pending) = self.accept_rx.try_recv() {
            drop(pending);
        }

        self.shared.shutdown_if_idle();
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[async_trait]
impl Listener for UdpListener {
    type Conn = UdpConn;

    async fn accept(&self) -> anyhow::Result<UdpConn> {
        UdpListener::accept(self).await
    }

    fn close(&self) -> anyhow::Result<()> {
        UdpListener::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        UdpListener::local_addr(self)
    }
}
