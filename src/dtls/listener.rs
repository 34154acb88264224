use crate::dtls::config::{validate_config, Config};
use crate::dtls::{accept_handshake, handshake, DtlsConn};
use crate::udp::{ListenConfig, UdpListener};
use crate::{DatagramConn, Listener};
use async_std::net::{SocketAddr, ToSocketAddrs};
use async_trait::async_trait;
use log::*;
use std::sync::Arc;

/// The validated configuration and transport listener shared by both listener flavours.
struct ListenerCore<L> {
    config: Arc<Config>,
    parent: Arc<L>,
}

impl<L: Listener> ListenerCore<L> {
    fn new(parent: Arc<L>, config: Arc<Config>) -> anyhow::Result<Self> {
        validate_config(&config)?;
        Ok(Self { config, parent })
    }

    fn close(&self) -> anyhow::Result<()> {
        self.parent.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.parent.local_addr()
    }
}

impl ListenerCore<UdpListener> {
    /// Validates `config` and only then binds a UDP listener that admits handshake datagrams.
    async fn bind<A: ToSocketAddrs + std::fmt::Display>(
        ip_addrs: A,
        config: Arc<Config>,
    ) -> anyhow::Result<Self> {
        validate_config(&config)?;

        let listen_config = ListenConfig {
            accept_filter: Some(accept_handshake),
            ..ListenConfig::default()
        };
        let parent = listen_config.listen(ip_addrs).await?;

        Ok(Self {
            config,
            parent: Arc::new(parent),
        })
    }
}

/// Listens for datagrams that open a handshake and returns each peer as an established
/// [`DtlsConn`].
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let listener = DtlsListener::bind("127.0.0.1:4444", config).await?;
///
/// // wait for a connection to come in and finish its handshake
/// while let Some(conn) = listener.incoming().next().await {
///     // do something with connection
/// }
/// ```
pub struct DtlsListener<L = UdpListener> {
    core: ListenerCore<L>,
}

impl DtlsListener<UdpListener> {
    /// Creates a [`DtlsListener`] by binding to an IP address and port.
    ///
    /// The configuration is validated before the socket is bound, so an invalid configuration
    /// fails with a [`ConfigError`](crate::dtls::ConfigError) without touching the network.
    ///
    /// # Example
    ///
    /// Basic usage:
    ///
    /// ```ignore
    /// let listener = DtlsListener::bind("127.0.0.1:4444", config).await?;
    /// ```
    pub async fn bind<A, C>(ip_addrs: A, config: C) -> anyhow::Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
        C: Into<Arc<Config>>,
    {
        let core = ListenerCore::<UdpListener>::bind(ip_addrs, config.into()).await?;
        info!("Started DTLS listener at {}", core.local_addr());

        Ok(Self { core })
    }
}

impl<L> DtlsListener<L>
where
    L: Listener,
    L::Conn: DatagramConn,
{
    /// Creates a [`DtlsListener`] that accepts connections from an existing transport listener.
    ///
    /// The caller keeps its own handle on `parent`. No accept filter is installed; whatever
    /// `parent` hands out is put through a handshake.
    pub fn new<C: Into<Arc<Config>>>(parent: Arc<L>, config: C) -> anyhow::Result<Self> {
        Ok(Self {
            core: ListenerCore::new(parent, config.into())?,
        })
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

#[async_trait]
impl<L> Listener for DtlsListener<L>
where
    L: Listener,
    L::Conn: DatagramConn,
{
    type Conn = DtlsConn<L::Conn>;

    /// Waits for the next peer and completes the server handshake with it.
    ///
    /// The handshake is bounded by the configuration's deadline. A failed handshake is returned
    /// as an error and the half-open connection is closed.
    async fn accept(&self) -> anyhow::Result<DtlsConn<L::Conn>> {
        let conn = self.core.parent.accept().await?;
        handshake::server(conn, &self.core.config).await
    }

    /// Closes the transport listener. Any blocked `accept` calls return errors; connections that
    /// were already accepted are not closed.
    fn close(&self) -> anyhow::Result<()> {
        self.core.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }
}

/// A [`DtlsListener`] that leaves the handshake to the caller.
///
/// `accept` returns the raw connection as soon as a peer opens a handshake. Pass it to
/// [`handshake::server`](crate::dtls::handshake::server) together with [`PassiveDtlsListener::config`]
/// before exchanging application data, for example from a pool of worker tasks.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let listener = PassiveDtlsListener::bind("127.0.0.1:4444", config).await?;
///
/// loop {
///     let raw = listener.accept().await?;
///     let config = listener.config();
///
///     task::spawn(async move {
///         let conn = handshake::server(raw, &config).await?;
///         // do something with connection
///     });
/// }
/// ```
pub struct PassiveDtlsListener<L = UdpListener> {
    core: ListenerCore<L>,
}

impl PassiveDtlsListener<UdpListener> {
    /// Creates a [`PassiveDtlsListener`] by binding to an IP address and port, validating the
    /// configuration first.
    pub async fn bind<A, C>(ip_addrs: A, config: C) -> anyhow::Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
        C: Into<Arc<Config>>,
    {
        let core = ListenerCore::<UdpListener>::bind(ip_addrs, config.into()).await?;
        info!("Started passive DTLS listener at {}", core.local_addr());

        Ok(Self { core })
    }
}

impl<L: Listener> PassiveDtlsListener<L> {
    /// Creates a [`PassiveDtlsListener`] over an existing transport listener.
    pub fn new<C: Into<Arc<Config>>>(parent: Arc<L>, config: C) -> anyhow::Result<Self> {
        Ok(Self {
            core: ListenerCore::new(parent, config.into())?,
        })
    }

    /// The configuration accepted connections must be upgraded with.
    pub fn config(&self) -> Arc<Config> {
        self.core.config.clone()
    }
}

#[async_trait]
impl<L: Listener> Listener for PassiveDtlsListener<L> {
    type Conn = L::Conn;

    /// Waits for the next peer that opened a handshake, without answering it.
    async fn accept(&self) -> anyhow::Result<L::Conn> {
        self.core.parent.accept().await
    }

    fn close(&self) -> anyhow::Result<()> {
        self.core.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use crate::dtls::{
        accept_handshake, handshake, Config, ConfigError, DtlsListener, HandshakeError,
        PassiveDtlsListener, MAX_PAYLOAD_SIZE,
    };
    use crate::udp::UdpListener;
    use crate::{DatagramConn, Listener, ListenerClosedError, StreamExt};
    use async_std::future::timeout;
    use async_std::net::{SocketAddr, UdpSocket};
    use async_std::task;
    use async_trait::async_trait;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A client socket that records how many bytes it has received.
    struct CountingSocket {
        socket: UdpSocket,
        received: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatagramConn for CountingSocket {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let bytes_read = self.socket.recv(buf).await?;
            self.received.fetch_add(bytes_read, Ordering::SeqCst);
            Ok(bytes_read)
        }

        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.socket.send(buf).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.socket.peer_addr()
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn connect(server_addr: SocketAddr) -> anyhow::Result<UdpSocket> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(server_addr).await?;
        Ok(socket)
    }

    fn spawn_client(
        server_addr: SocketAddr,
        config: Config,
    ) -> task::JoinHandle<anyhow::Result<crate::DtlsConn<UdpSocket>>> {
        task::spawn(async move {
            let socket = connect(server_addr).await?;
            handshake::client(socket, &config).await
        })
    }

    fn config() -> Config {
        Config {
            handshake_timeout: Some(Duration::from_secs(5)),
            ..Config::with_static_psk("listener-test", b"listener secret".to_vec())
        }
    }

    async fn free_addr() -> anyhow::Result<std::net::SocketAddr> {
        let probe = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(probe.local_addr()?)
    }

    #[async_std::test]
    async fn invalid_config_binds_nothing() -> anyhow::Result<()> {
        let addr = free_addr().await?;

        let err = DtlsListener::bind(addr, Config::default())
            .await
            .err()
            .expect("invalid config must be rejected");
        assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::NoIdentity));

        let err = PassiveDtlsListener::bind(addr, Config::default())
            .await
            .err()
            .expect("invalid config must be rejected");
        assert!(err.is::<ConfigError>());

        // the port is still free
        UdpSocket::bind(addr).await?;

        Ok(())
    }

    #[async_std::test]
    async fn wrap_rejects_invalid_config() -> anyhow::Result<()> {
        let parent = Arc::new(UdpListener::bind("127.0.0.1:0").await?);

        let config = Config {
            psk: None,
            ..config()
        };
        let err = DtlsListener::new(parent.clone(), config)
            .err()
            .expect("invalid config must be rejected");
        assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::IdentityNoPsk));

        assert!(PassiveDtlsListener::new(parent, Config::default()).is_err());

        Ok(())
    }

    #[async_std::test]
    async fn wrapped_listener_shares_parent() -> anyhow::Result<()> {
        let parent = Arc::new(UdpListener::bind("127.0.0.1:0").await?);
        let listener = DtlsListener::new(parent.clone(), config())?;

        assert_eq!(listener.local_addr(), parent.local_addr());

        let client_config = config();
        let server_addr = listener.local_addr();
        let client = async_std::task::spawn(async move {
            let socket = UdpSocket::bind("127.0.0.1:0").await?;
            socket.connect(server_addr).await?;
            handshake::client(socket, &client_config).await
        });

        let conn = timeout(Duration::from_secs(5), listener.accept()).await??;
        let client = client.await?;
        assert_eq!(conn.peer_addr()?, client.local_addr()?);

        Ok(())
    }

    #[async_std::test]
    async fn local_addr_survives_close() -> anyhow::Result<()> {
        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;
        let addr = listener.local_addr();

        listener.close()?;
        assert_eq!(listener.local_addr(), addr);
        assert!(listener.accept().await.is_err());

        Ok(())
    }

    #[async_std::test]
    async fn passive_listener_hands_out_config() -> anyhow::Result<()> {
        let config = Arc::new(config());
        let listener = PassiveDtlsListener::bind("127.0.0.1:0", config.clone()).await?;

        assert!(Arc::ptr_eq(&listener.config(), &config));
        Ok(())
    }

    #[async_std::test]
    async fn accepted_conn_exchanges_records() -> anyhow::Result<()> {
        let _ = env_logger::try_init();

        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;
        let client = spawn_client(listener.local_addr(), config());

        let server = timeout(Duration::from_secs(5), listener.accept()).await??;
        let client = client.await?;

        client.send(b"hello server").await?;
        let mut buf = [0; 64];
        let bytes_read = timeout(Duration::from_secs(2), server.recv(&mut buf)).await??;
        assert_eq!(&buf[..bytes_read], b"hello server");

        server.send(&buf[..bytes_read]).await?;
        let bytes_read = timeout(Duration::from_secs(2), client.recv(&mut buf)).await??;
        assert_eq!(&buf[..bytes_read], b"hello server");

        server.close().await?;
        let bytes_read = timeout(Duration::from_secs(2), client.recv(&mut buf)).await??;
        assert_eq!(bytes_read, 0);

        Ok(())
    }

    #[async_std::test]
    async fn largest_payload_crosses_the_socket() -> anyhow::Result<()> {
        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;
        let client = spawn_client(listener.local_addr(), config());

        let server = timeout(Duration::from_secs(5), listener.accept()).await??;
        let client = client.await?;

        let payload = vec![0x5a; MAX_PAYLOAD_SIZE];
        client.send(&payload).await?;
        assert!(client.send(&vec![0x5a; MAX_PAYLOAD_SIZE + 1]).await.is_err());

        let mut buf = vec![0; MAX_PAYLOAD_SIZE + 1];
        let bytes_read = timeout(Duration::from_secs(2), server.recv(&mut buf)).await??;
        assert_eq!(&buf[..bytes_read], &payload[..]);

        Ok(())
    }

    #[async_std::test]
    async fn noise_creates_no_connection() -> anyhow::Result<()> {
        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;

        let noisy = connect(listener.local_addr()).await?;
        let mut noise = [0u8; 40];
        OsRng.fill_bytes(&mut noise);
        assert!(!accept_handshake(&noise));
        noisy.send(&noise).await?;
        noisy.send(&[]).await?;

        let client = spawn_client(listener.local_addr(), config());

        let conn = timeout(Duration::from_secs(5), listener.accept()).await??;
        let client = client.await?;
        assert_eq!(conn.peer_addr()?, client.local_addr()?);

        assert!(timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err());

        Ok(())
    }

    #[async_std::test]
    async fn close_unblocks_every_accept() -> anyhow::Result<()> {
        let listener = Arc::new(DtlsListener::bind("127.0.0.1:0", config()).await?);

        let waiting: Vec<_> = (0..3)
            .map(|_| {
                let listener = listener.clone();
                task::spawn(async move { listener.accept().await })
            })
            .collect();

        task::sleep(Duration::from_millis(50)).await;
        listener.close()?;

        for handle in waiting {
            let result = timeout(Duration::from_secs(2), handle).await?;
            let err = result.err().expect("accept after close must fail");
            assert!(err.is::<ListenerClosedError>());
        }

        assert!(listener.close().is_err());
        Ok(())
    }

    #[async_std::test]
    async fn wrong_psk_fails_accept() -> anyhow::Result<()> {
        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;
        let client_config = Config::with_static_psk("listener-test", b"some other secret".to_vec());
        let client = spawn_client(listener.local_addr(), client_config);

        let err = timeout(Duration::from_secs(5), listener.accept())
            .await?
            .err()
            .expect("handshake with the wrong key must fail");
        assert!(matches!(
            err.downcast_ref::<HandshakeError>(),
            Some(HandshakeError::Alert(_))
        ));

        let err = client.await.err().expect("handshake with the wrong key must fail");
        assert_eq!(
            err.downcast_ref::<HandshakeError>(),
            Some(&HandshakeError::BadFinished)
        );

        Ok(())
    }

    #[async_std::test]
    async fn passive_accept_sends_nothing() -> anyhow::Result<()> {
        let listener = PassiveDtlsListener::bind("127.0.0.1:0", config()).await?;

        let received = Arc::new(AtomicUsize::new(0));
        let socket = CountingSocket {
            socket: connect(listener.local_addr()).await?,
            received: received.clone(),
        };
        let client_config = Config {
            retransmit_interval: Duration::from_millis(100),
            ..config()
        };
        let client = task::spawn(async move { handshake::client(socket, &client_config).await });

        let raw = timeout(Duration::from_secs(5), listener.accept()).await??;
        task::sleep(Duration::from_millis(300)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);

        let server = handshake::server(raw, &listener.config()).await?;
        let client = client.await?;
        assert!(received.load(Ordering::SeqCst) > 0);
        assert_eq!(server.peer_identity(), client.peer_identity());

        Ok(())
    }

    #[async_std::test]
    async fn incoming_skips_failures_and_ends_on_close() -> anyhow::Result<()> {
        let _ = env_logger::try_init();

        let listener = DtlsListener::bind("127.0.0.1:0", config()).await?;
        let server_addr = listener.local_addr();
        let mut incoming = listener.incoming();

        let impostor = spawn_client(
            server_addr,
            Config {
                handshake_timeout: Some(Duration::from_secs(5)),
                ..Config::with_static_psk("listener-test", b"guessed".to_vec())
            },
        );
        // the impostor is queued first and its failed handshake is skipped
        task::sleep(Duration::from_millis(200)).await;
        let client = spawn_client(server_addr, config());

        let conn = timeout(Duration::from_secs(10), incoming.next())
            .await?
            .expect("stream ended early");
        let client = client.await?;
        assert!(impostor.await.is_err());
        assert_eq!(conn.peer_addr()?, client.local_addr()?);

        listener.close()?;
        assert!(timeout(Duration::from_secs(2), incoming.next())
            .await?
            .is_none());

        Ok(())
    }
}
