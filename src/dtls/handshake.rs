//! Establishes a [`DtlsConn`] over a raw [`DatagramConn`].
//!
//! The exchange is a pre-shared-key handshake framed as DTLS records on epoch 0:
//!
//! ```text
//! Client                                               Server
//!
//!       ClientHello                  -------->
//!       (random, identity, suites)
//!                                                      ServerHello
//!                                    <--------            Finished
//!       Finished                     -------->
//!       Application Data             <------->      Application Data
//! ```
//!
//! Both sides derive the record keys from the PSK and both randoms with HKDF-SHA256, and prove
//! possession of the PSK with an HMAC over the transcript. The client resends its hello until the
//! server's flight arrives; the server answers every repeated hello with its flight.

use crate::dtls::config::{validate_config, CipherSuiteId, Config};
use crate::dtls::conn::{DtlsConn, SessionKeys};
use crate::protocol::{encode_record, unpack_datagram, ContentType, RecordHeader, RECORD_HEADER_SIZE};
use crate::udp::RECEIVE_MTU;
use crate::DatagramConn;
use async_std::future::timeout;
use bytes::{Buf, BufMut, BytesMut};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::error::Error;

const RANDOM_SIZE: usize = 32;
const VERIFY_DATA_SIZE: usize = 32;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const FINISHED: u8 = 20;

pub(crate) const ALERT_LEVEL_WARNING: u8 = 1;
pub(crate) const ALERT_LEVEL_FATAL: u8 = 2;
pub(crate) const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_HANDSHAKE_FAILURE: u8 = 40;
const ALERT_DECRYPT_ERROR: u8 = 51;
const ALERT_UNKNOWN_PSK_IDENTITY: u8 = 115;

const KEY_EXPANSION_LABEL: &[u8] = b"connect-dtls key expansion";
const SERVER_FINISHED_LABEL: &[u8] = b"server finished";
const CLIENT_FINISHED_LABEL: &[u8] = b"client finished";

type HmacSha256 = Hmac<Sha256>;

/// Encountered when a handshake does not produce a secure connection.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The handshake did not finish within the configured deadline.
    Timeout,
    /// The peer sent a handshake message that cannot be parsed.
    Malformed,
    /// The peer announced an identity the PSK callback does not know.
    UnknownIdentity,
    /// The peer offered no cipher suite this side is configured for.
    NoCommonCipherSuite,
    /// The peer's Finished message does not match, so the two sides hold different keys.
    BadFinished,
    /// The peer aborted the handshake with a fatal alert.
    Alert(u8),
    /// The underlying connection failed or was closed mid-handshake.
    ConnectionClosed,
}

impl Error for HandshakeError {}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HandshakeError::Timeout => write!(f, "handshake timed out"),
            HandshakeError::Malformed => write!(f, "received a malformed handshake message"),
            HandshakeError::UnknownIdentity => write!(f, "peer presented an unknown psk identity"),
            HandshakeError::NoCommonCipherSuite => write!(f, "no cipher suite in common with peer"),
            HandshakeError::BadFinished => write!(f, "peer finished verification failed"),
            HandshakeError::Alert(description) => {
                write!(f, "peer aborted handshake with alert {}", description)
            }
            HandshakeError::ConnectionClosed => write!(f, "connection closed during handshake"),
        }
    }
}

/// Runs the server side of the handshake on a freshly accepted connection.
///
/// The first datagram on `conn` must carry the client's hello, otherwise the handshake fails with
/// [`HandshakeError::Malformed`] at once. The whole exchange is bounded by
/// [`Config::handshake_timeout`]. On failure the raw connection is closed and never handed back.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let listener = PassiveDtlsListener::bind("127.0.0.1:4444", config.clone()).await?;
/// let raw = listener.accept().await?;
///
/// task::spawn(async move {
///     let conn = handshake::server(raw, &config).await?;
///     // do something with connection
/// });
/// ```
pub async fn server<C: DatagramConn>(conn: C, config: &Config) -> anyhow::Result<DtlsConn<C>> {
    validate_config(config)?;

    let result = timeout(config.handshake_timeout(), server_flights(&conn, config)).await;

    match result {
        Ok(Ok(keys)) => {
            debug!("Completed handshake with {}", peer_name(&conn));
            Ok(DtlsConn::new(conn, keys))
        }

        Ok(Err(err)) => {
            warn!("Handshake with {} failed: {}", peer_name(&conn), err);
            let _ = conn.close().await;
            Err(err)
        }

        Err(_) => {
            warn!("Handshake with {} timed out", peer_name(&conn));
            let _ = conn.close().await;
            Err(HandshakeError::Timeout.into())
        }
    }
}

/// Runs the client side of the handshake on a connection to a listening server.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let socket = UdpSocket::bind("0.0.0.0:0").await?;
/// socket.connect("127.0.0.1:4444").await?;
///
/// let conn = handshake::client(socket, &config).await?;
/// ```
pub async fn client<C: DatagramConn>(conn: C, config: &Config) -> anyhow::Result<DtlsConn<C>> {
    validate_config(config)?;

    let result = timeout(config.handshake_timeout(), client_flights(&conn, config)).await;

    match result {
        Ok(Ok(keys)) => {
            debug!("Completed handshake with {}", peer_name(&conn));
            Ok(DtlsConn::new(conn, keys))
        }

        Ok(Err(err)) => {
            let _ = conn.close().await;
            Err(err)
        }

        Err(_) => {
            let _ = conn.close().await;
            Err(HandshakeError::Timeout.into())
        }
    }
}

async fn server_flights<C: DatagramConn>(conn: &C, config: &Config) -> anyhow::Result<SessionKeys> {
    let mut records = HandshakeRecords::default();
    let mut buffer = vec![0; RECEIVE_MTU];

    // the datagram that opened the connection must carry the hello
    let client_hello_msg = match read_flight(conn, &mut buffer).await?.message(CLIENT_HELLO) {
        Some(msg) => msg.to_vec(),
        None => return Err(HandshakeError::Malformed.into()),
    };
    let client_hello = ClientHello::decode(&client_hello_msg)?;

    let cipher_suite = match config
        .cipher_suites()?
        .into_iter()
        .find(|suite| client_hello.cipher_suites.contains(&(*suite as u16)))
    {
        Some(suite) => suite,
        None => {
            send_alert(conn, &mut records, ALERT_HANDSHAKE_FAILURE).await;
            return Err(HandshakeError::NoCommonCipherSuite.into());
        }
    };

    let psk = match config.psk.as_ref().map(|psk| psk(&client_hello.identity)) {
        Some(Ok(psk)) if !psk.is_empty() => psk,
        _ => {
            send_alert(conn, &mut records, ALERT_UNKNOWN_PSK_IDENTITY).await;
            return Err(HandshakeError::UnknownIdentity.into());
        }
    };

    let server_random = random();
    let server_hello_msg = ServerHello {
        random: server_random,
        cipher_suite: cipher_suite as u16,
        identity_hint: config.psk_identity_hint.clone().unwrap_or_default(),
    }
    .encode();

    let secrets = Secrets::derive(&psk, &client_hello.random, &server_random)?;
    let transcript = [client_hello_msg.as_slice(), server_hello_msg.as_slice()];
    let server_finished_msg = finished_message(&secrets.master, SERVER_FINISHED_LABEL, &transcript)?;

    let mut server_flight = records.encode(&server_hello_msg)?;
    server_flight.extend(records.encode(&server_finished_msg)?);
    conn.send(&server_flight).await?;

    let expected_transcript = [
        client_hello_msg.as_slice(),
        server_hello_msg.as_slice(),
        server_finished_msg.as_slice(),
    ];

    loop {
        let flight = read_flight(conn, &mut buffer).await?;

        if let Some(msg) = flight.message(FINISHED) {
            if verify_finished(&secrets.master, CLIENT_FINISHED_LABEL, &expected_transcript, msg)? {
                return Ok(SessionKeys {
                    local_write: secrets.server_write,
                    remote_write: secrets.client_write,
                    cipher_suite,
                    peer_identity: client_hello.identity,
                });
            }

            send_alert(conn, &mut records, ALERT_DECRYPT_ERROR).await;
            return Err(HandshakeError::BadFinished.into());
        }

        if flight.message(CLIENT_HELLO) == Some(client_hello_msg.as_slice()) {
            debug!("Client retransmitted its hello, resending server flight");
            let mut server_flight = records.encode(&server_hello_msg)?;
            server_flight.extend(records.encode(&server_finished_msg)?);
            conn.send(&server_flight).await?;
        }
    }
}

async fn client_flights<C: DatagramConn>(conn: &C, config: &Config) -> anyhow::Result<SessionKeys> {
    let mut records = HandshakeRecords::default();
    let mut buffer = vec![0; RECEIVE_MTU];

    let client_random = random();
    let client_hello_msg = ClientHello {
        random: client_random,
        identity: config.psk_identity_hint.clone().unwrap_or_default(),
        cipher_suites: config
            .cipher_suites()?
            .into_iter()
            .map(|suite| suite as u16)
            .collect(),
    }
    .encode();

    let (server_hello_msg, server_finished_msg) = 'retransmit: loop {
        conn.send(&records.encode(&client_hello_msg)?).await?;

        loop {
            let flight = match timeout(config.retransmit_interval, read_flight(conn, &mut buffer)).await {
                Ok(flight) => flight?,
                Err(_) => {
                    debug!("No reply from {}, retransmitting ClientHello", peer_name(conn));
                    continue 'retransmit;
                }
            };

            if let (Some(hello), Some(finished)) = (flight.message(SERVER_HELLO), flight.message(FINISHED)) {
                break 'retransmit (hello.to_vec(), finished.to_vec());
            }
        }
    };

    let server_hello = ServerHello::decode(&server_hello_msg)?;
    let cipher_suite = CipherSuiteId::try_from(server_hello.cipher_suite)
        .map_err(|_| HandshakeError::NoCommonCipherSuite)?;

    let psk = match config.psk.as_ref().map(|psk| psk(&server_hello.identity_hint)) {
        Some(Ok(psk)) if !psk.is_empty() => psk,
        _ => {
            send_alert(conn, &mut records, ALERT_UNKNOWN_PSK_IDENTITY).await;
            return Err(HandshakeError::UnknownIdentity.into());
        }
    };

    let secrets = Secrets::derive(&psk, &client_random, &server_hello.random)?;
    let transcript = [client_hello_msg.as_slice(), server_hello_msg.as_slice()];
    if !verify_finished(&secrets.master, SERVER_FINISHED_LABEL, &transcript, &server_finished_msg)? {
        send_alert(conn, &mut records, ALERT_DECRYPT_ERROR).await;
        return Err(HandshakeError::BadFinished.into());
    }

    let client_transcript = [
        client_hello_msg.as_slice(),
        server_hello_msg.as_slice(),
        server_finished_msg.as_slice(),
    ];
    let client_finished_msg = finished_message(&secrets.master, CLIENT_FINISHED_LABEL, &client_transcript)?;
    conn.send(&records.encode(&client_finished_msg)?).await?;

    Ok(SessionKeys {
        local_write: secrets.client_write,
        remote_write: secrets.server_write,
        cipher_suite,
        peer_identity: server_hello.identity_hint,
    })
}

fn peer_name<C: DatagramConn>(conn: &C) -> String {
    match conn.peer_addr() {
        Ok(peer_addr) => peer_addr.to_string(),
        Err(_) => String::from("unknown peer"),
    }
}

/// Handshake messages found in one datagram, in order.
struct Flight {
    messages: Vec<Vec<u8>>,
}

impl Flight {
    fn message(&self, msg_type: u8) -> Option<&[u8]> {
        self.messages
            .iter()
            .find(|msg| msg.first() == Some(&msg_type))
            .map(|msg| msg.as_slice())
    }
}

/// Reads the next datagram and collects its epoch 0 handshake messages.
///
/// A fatal alert from the peer ends the handshake. Unparseable datagrams yield an empty flight.
async fn read_flight<C: DatagramConn>(conn: &C, buffer: &mut [u8]) -> anyhow::Result<Flight> {
    let bytes_read = conn
        .recv(buffer)
        .await
        .map_err(|_| HandshakeError::ConnectionClosed)?;

    let mut messages = Vec::new();
    let records = match unpack_datagram(&buffer[..bytes_read]) {
        Ok(records) => records,
        Err(err) => {
            trace!("Dropping unparseable handshake datagram: {}", err);
            return Ok(Flight { messages });
        }
    };

    for record in records {
        let header = match RecordHeader::unmarshal(record) {
            Ok(header) if header.epoch == 0 => header,
            _ => continue,
        };
        let payload = &record[RECORD_HEADER_SIZE..];

        match header.content_type {
            ContentType::Handshake => messages.push(payload.to_vec()),

            ContentType::Alert if payload.len() == 2 && payload[0] == ALERT_LEVEL_FATAL => {
                return Err(HandshakeError::Alert(payload[1]).into());
            }

            _ => trace!("Ignoring {:?} record during handshake", header.content_type),
        }
    }

    Ok(Flight { messages })
}

async fn send_alert<C: DatagramConn>(conn: &C, records: &mut HandshakeRecords, description: u8) {
    match encode_record(
        ContentType::Alert,
        0,
        records.next_sequence(),
        &[ALERT_LEVEL_FATAL, description],
    ) {
        Ok(alert) => {
            if let Err(err) = conn.send(&alert).await {
                debug!("Could not send alert {}: {}", description, err);
            }
        }

        Err(err) => debug!("Could not encode alert {}: {}", description, err),
    }
}

/// Numbers the epoch 0 records sent by one side of the handshake.
#[derive(Default)]
struct HandshakeRecords {
    sequence_number: u64,
}

impl HandshakeRecords {
    fn next_sequence(&mut self) -> u64 {
        let sequence_number = self.sequence_number;
        self.sequence_number += 1;
        sequence_number
    }

    fn encode(&mut self, msg: &[u8]) -> anyhow::Result<Vec<u8>> {
        let sequence_number = self.next_sequence();
        Ok(encode_record(ContentType::Handshake, 0, sequence_number, msg)?)
    }
}

struct ClientHello {
    random: [u8; RANDOM_SIZE],
    identity: Vec<u8>,
    cipher_suites: Vec<u16>,
}

impl ClientHello {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        bytes.put_u8(CLIENT_HELLO);
        bytes.put_slice(&self.random);
        bytes.put_u16(self.identity.len() as u16);
        bytes.put_slice(&self.identity);
        bytes.put_u16(self.cipher_suites.len() as u16);
        for suite in &self.cipher_suites {
            bytes.put_u16(*suite);
        }

        bytes.to_vec()
    }

    fn decode(msg: &[u8]) -> Result<Self, HandshakeError> {
        let mut buf = Reader::new(msg, CLIENT_HELLO)?;
        let random = buf.array()?;
        let identity = buf.vector()?;

        let count = buf.u16()?;
        let mut cipher_suites = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            cipher_suites.push(buf.u16()?);
        }

        Ok(Self {
            random,
            identity,
            cipher_suites,
        })
    }
}

struct ServerHello {
    random: [u8; RANDOM_SIZE],
    cipher_suite: u16,
    identity_hint: Vec<u8>,
}

impl ServerHello {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        bytes.put_u8(SERVER_HELLO);
        bytes.put_slice(&self.random);
        bytes.put_u16(self.cipher_suite);
        bytes.put_u16(self.identity_hint.len() as u16);
        bytes.put_slice(&self.identity_hint);

        bytes.to_vec()
    }

    fn decode(msg: &[u8]) -> Result<Self, HandshakeError> {
        let mut buf = Reader::new(msg, SERVER_HELLO)?;
        let random = buf.array()?;
        let cipher_suite = buf.u16()?;
        let identity_hint = buf.vector()?;

        Ok(Self {
            random,
            cipher_suite,
            identity_hint,
        })
    }
}

/// Bounds-checked cursor over a handshake message body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(msg: &'a [u8], msg_type: u8) -> Result<Self, HandshakeError> {
        match msg.split_first() {
            Some((found, body)) if *found == msg_type => Ok(Self { buf: body }),
            _ => Err(HandshakeError::Malformed),
        }
    }

    fn u16(&mut self) -> Result<u16, HandshakeError> {
        if self.buf.remaining() < 2 {
            return Err(HandshakeError::Malformed);
        }
        Ok(self.buf.get_u16())
    }

    fn array(&mut self) -> Result<[u8; RANDOM_SIZE], HandshakeError> {
        if self.buf.remaining() < RANDOM_SIZE {
            return Err(HandshakeError::Malformed);
        }
        let mut array = [0u8; RANDOM_SIZE];
        self.buf.copy_to_slice(&mut array);
        Ok(array)
    }

    fn vector(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let len = self.u16()? as usize;
        if self.buf.remaining() < len {
            return Err(HandshakeError::Malformed);
        }
        let vector = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(vector)
    }
}

struct Secrets {
    master: [u8; 32],
    client_write: [u8; 32],
    server_write: [u8; 32],
}

impl Secrets {
    fn derive(
        psk: &[u8],
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
    ) -> anyhow::Result<Self> {
        let mut salt = [0u8; 2 * RANDOM_SIZE];
        salt[..RANDOM_SIZE].copy_from_slice(client_random);
        salt[RANDOM_SIZE..].copy_from_slice(server_random);

        let mut okm = [0u8; 96];
        Hkdf::<Sha256>::new(Some(&salt[..]), psk)
            .expand(KEY_EXPANSION_LABEL, &mut okm)
            .map_err(|_| anyhow::anyhow!("key expansion output length is invalid"))?;

        let mut secrets = Self {
            master: [0; 32],
            client_write: [0; 32],
            server_write: [0; 32],
        };
        secrets.master.copy_from_slice(&okm[..32]);
        secrets.client_write.copy_from_slice(&okm[32..64]);
        secrets.server_write.copy_from_slice(&okm[64..]);

        Ok(secrets)
    }
}

fn random() -> [u8; RANDOM_SIZE] {
    let mut random = [0u8; RANDOM_SIZE];
    OsRng.fill_bytes(&mut random);
    random
}

fn finished_mac(master: &[u8], label: &[u8], transcript: &[&[u8]]) -> anyhow::Result<HmacSha256> {
    let mut hasher = Sha256::new();
    for msg in transcript {
        hasher.update(msg);
    }

    let mut mac = HmacSha256::new_from_slice(master)
        .map_err(|_| anyhow::anyhow!("invalid finished key length"))?;
    mac.update(label);
    mac.update(&hasher.finalize());

    Ok(mac)
}

fn finished_message(master: &[u8], label: &[u8], transcript: &[&[u8]]) -> anyhow::Result<Vec<u8>> {
    let verify_data = finished_mac(master, label, transcript)?.finalize().into_bytes();

    let mut msg = Vec::with_capacity(1 + VERIFY_DATA_SIZE);
    msg.push(FINISHED);
    msg.extend_from_slice(&verify_data);
    Ok(msg)
}

fn verify_finished(
    master: &[u8],
    label: &[u8],
    transcript: &[&[u8]],
    msg: &[u8],
) -> anyhow::Result<bool> {
    match msg.split_first() {
        Some((&FINISHED, verify_data)) if verify_data.len() == VERIFY_DATA_SIZE => {
            Ok(finished_mac(master, label, transcript)?
                .verify_slice(verify_data)
                .is_ok())
        }
        _ => Ok(false),
    }
}
