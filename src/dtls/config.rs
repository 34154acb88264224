use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Handshake deadline applied when [`Config::handshake_timeout`] is unset.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a client waits for the server's flight before resending its hello.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves the pre-shared key for the identity announced by the peer.
pub type PskCallback = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Cipher suites understood by the handshake.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipherSuiteId {
    TlsPskWithChacha20Poly1305Sha256 = 0xccab,
}

impl TryFrom<u16> for CipherSuiteId {
    type Error = ConfigError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0xccab => Ok(CipherSuiteId::TlsPskWithChacha20Poly1305Sha256),
            other => Err(ConfigError::InvalidCipherSuite(other)),
        }
    }
}

/// Encountered when a [`Config`] cannot be used to run a handshake.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No identity material was configured.
    NoIdentity,
    /// An identity hint was set without a PSK callback to back it.
    IdentityNoPsk,
    /// A cipher suite id is not one of [`CipherSuiteId`].
    InvalidCipherSuite(u16),
    /// The handshake deadline is zero, so no handshake could ever complete.
    InvalidTimeout,
    /// The retransmission interval is zero.
    InvalidRetransmitInterval,
}

impl Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::NoIdentity => write!(f, "no identity material provided in config"),
            ConfigError::IdentityNoPsk => {
                write!(f, "psk identity hint provided but psk callback is missing")
            }
            ConfigError::InvalidCipherSuite(id) => write!(f, "invalid cipher suite {:#06x}", id),
            ConfigError::InvalidTimeout => write!(f, "handshake timeout must be non-zero"),
            ConfigError::InvalidRetransmitInterval => {
                write!(f, "retransmit interval must be non-zero")
            }
        }
    }
}

/// Parameters shared by every handshake run on behalf of a listener or client.
///
/// A `Config` is validated once by the listener constructors and then shared read-only, so clone
/// it before tweaking it for another listener.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let config = Config {
///     handshake_timeout: Some(Duration::from_secs(5)),
///     ..Config::with_static_psk("device-42", b"0123456789abcdef".to_vec())
/// };
/// ```
#[derive(Clone)]
pub struct Config {
    /// Returns the pre-shared key for the identity the peer announced. Servers receive the
    /// client's identity, clients receive the server's hint.
    pub psk: Option<PskCallback>,
    /// Identity announced to the peer during the handshake.
    pub psk_identity_hint: Option<Vec<u8>>,
    /// Raw cipher suite ids. Empty means every supported suite.
    pub cipher_suites: Vec<u16>,
    /// Upper bound on the whole handshake; [`DEFAULT_HANDSHAKE_TIMEOUT`] when `None`.
    pub handshake_timeout: Option<Duration>,
    pub retransmit_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            psk: None,
            psk_identity_hint: None,
            cipher_suites: Vec::new(),
            handshake_timeout: None,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("psk", &self.psk.as_ref().map(|_| "<callback>"))
            .field("psk_identity_hint", &self.psk_identity_hint)
            .field("cipher_suites", &self.cipher_suites)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("retransmit_interval", &self.retransmit_interval)
            .finish()
    }
}

impl Config {
    /// Creates a [`Config`] that announces `identity` and uses `key` whatever the peer announces.
    pub fn with_static_psk<I: Into<Vec<u8>>>(identity: I, key: Vec<u8>) -> Self {
        let psk: PskCallback = Arc::new(move |_: &[u8]| Ok::<_, anyhow::Error>(key.clone()));

        Self {
            psk: Some(psk),
            psk_identity_hint: Some(identity.into()),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Resolves the configured cipher suites, in preference order.
    pub fn cipher_suites(&self) -> Result<Vec<CipherSuiteId>, ConfigError> {
        if self.cipher_suites.is_empty() {
            return Ok(vec![CipherSuiteId::TlsPskWithChacha20Poly1305Sha256]);
        }

        self.cipher_suites
            .iter()
            .map(|id| CipherSuiteId::try_from(*id))
            .collect()
    }
}

/// Checks that `config` carries everything a handshake needs.
///
/// Runs without side effects, so listener constructors call it before opening any socket.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.psk.is_none() {
        return Err(if config.psk_identity_hint.is_some() {
            ConfigError::IdentityNoPsk
        } else {
            ConfigError::NoIdentity
        });
    }

    config.cipher_suites()?;

    if config.handshake_timeout == Some(Duration::ZERO) {
        return Err(ConfigError::InvalidTimeout);
    }

    if config.retransmit_interval == Duration::ZERO {
        return Err(ConfigError::InvalidRetransmitInterval);
    }

    Ok(())
}
