use crate::dtls::config::CipherSuiteId;
use crate::dtls::handshake::{ALERT_CLOSE_NOTIFY, ALERT_LEVEL_WARNING};
use crate::protocol::{
    unpack_datagram, ContentType, RecordHeader, MAX_SEQUENCE_NUMBER, PROTOCOL_VERSION_1_2,
    RECORD_HEADER_SIZE,
};
use crate::udp::RECEIVE_MTU;
use crate::DatagramConn;
use async_std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::*;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Epoch used for every record protected with the negotiated keys.
const APPLICATION_EPOCH: u16 = 1;

const TAG_SIZE: usize = 16;

/// Largest payload a single `send` accepts, so the sealed record still fits in one receive
/// buffer of [`RECEIVE_MTU`] bytes on the peer.
pub const MAX_PAYLOAD_SIZE: usize = RECEIVE_MTU - RECORD_HEADER_SIZE - TAG_SIZE;

/// Key material and parameters agreed on by a successful handshake.
pub(crate) struct SessionKeys {
    pub(crate) local_write: [u8; 32],
    pub(crate) remote_write: [u8; 32],
    pub(crate) cipher_suite: CipherSuiteId,
    pub(crate) peer_identity: Vec<u8>,
}

/// A secure connection produced by a completed handshake.
///
/// Every `send` seals one application data record with ChaCha20-Poly1305; every `recv` returns the
/// plaintext of one record. Records that fail authentication are dropped without notice. A
/// `close_notify` from the peer ends the connection and `recv` returns `Ok(0)` from then on.
///
/// Both halves take `&self`, so a connection wrapped in an `Arc` can be read and written from
/// separate tasks.
///
/// # Example
///
/// Basic usage:
///
/// ```ignore
/// let conn = listener.accept().await?;
///
/// let bytes_read = conn.recv(&mut buf).await?;
/// conn.send(&buf[..bytes_read]).await?;
/// ```
pub struct DtlsConn<C> {
    conn: C,
    local_cipher: ChaCha20Poly1305,
    remote_cipher: ChaCha20Poly1305,
    cipher_suite: CipherSuiteId,
    peer_identity: Vec<u8>,
    send_sequence: AtomicU64,
    pending: Mutex<VecDeque<Vec<u8>>>,
    remote_closed: AtomicBool,
    local_closed: AtomicBool,
}

impl<C: DatagramConn> DtlsConn<C> {
    pub(crate) fn new(conn: C, keys: SessionKeys) -> Self {
        let local_key: Key = keys.local_write.into();
        let remote_key: Key = keys.remote_write.into();

        Self {
            conn,
            local_cipher: ChaCha20Poly1305::new(&local_key),
            remote_cipher: ChaCha20Poly1305::new(&remote_key),
            cipher_suite: keys.cipher_suite,
            peer_identity: keys.peer_identity,
            send_sequence: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            remote_closed: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
        }
    }

    pub fn cipher_suite(&self) -> CipherSuiteId {
        self.cipher_suite
    }

    /// The PSK identity the peer announced during the handshake.
    pub fn peer_identity(&self) -> &[u8] {
        &self.peer_identity
    }

    /// Get access to the underlying raw connection
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    fn seal(&self, content_type: ContentType, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        if plaintext.len() > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload too large for a single record",
            ));
        }

        let sequence_number = self.send_sequence.fetch_add(1, Ordering::SeqCst);
        if sequence_number > MAX_SEQUENCE_NUMBER {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "record sequence numbers exhausted",
            ));
        }

        let header = RecordHeader {
            content_type,
            version: PROTOCOL_VERSION_1_2,
            epoch: APPLICATION_EPOCH,
            sequence_number,
            length: (plaintext.len() + TAG_SIZE) as u16,
        };

        let mut record = BytesMut::with_capacity(RECORD_HEADER_SIZE + plaintext.len() + TAG_SIZE);
        header
            .marshal(&mut record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let ciphertext = self
            .local_cipher
            .encrypt(
                &nonce(&header),
                Payload {
                    msg: plaintext,
                    aad: &record[..],
                },
            )
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "could not seal record"))?;
        record.put_slice(&ciphertext);

        Ok(record.to_vec())
    }

    fn open(&self, header: &RecordHeader, record: &[u8]) -> Option<Vec<u8>> {
        self.remote_cipher
            .decrypt(
                &nonce(header),
                Payload {
                    msg: &record[RECORD_HEADER_SIZE..],
                    aad: &record[..RECORD_HEADER_SIZE],
                },
            )
            .ok()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens every record in `datagram`, queueing application data and noting a close_notify.
    fn process_datagram(&self, datagram: &[u8]) {
        let records = match unpack_datagram(datagram) {
            Ok(records) => records,
            Err(err) => {
                trace!("Dropping malformed datagram: {}", err);
                return;
            }
        };

        for record in records {
            let header = match RecordHeader::unmarshal(record) {
                Ok(header) if header.epoch == APPLICATION_EPOCH => header,
                // stray retransmissions from the handshake
                _ => continue,
            };

            let plaintext = match self.open(&header, record) {
                Some(plaintext) => plaintext,
                None => {
                    trace!("Dropping record {} that failed authentication", header.sequence_number);
                    continue;
                }
            };

            match header.content_type {
                ContentType::ApplicationData => self.pending().push_back(plaintext),

                ContentType::Alert if plaintext.get(1) == Some(&ALERT_CLOSE_NOTIFY) => {
                    debug!("Peer sent close_notify");
                    self.remote_closed.store(true, Ordering::SeqCst);
                }

                other => trace!("Ignoring {:?} record", other),
            }
        }
    }
}

fn nonce(header: &RecordHeader) -> Nonce {
    let mut nonce = [0u8; 12];
    let mut cursor = &mut nonce[4..];
    cursor.put_u16(header.epoch);
    cursor.put_uint(header.sequence_number, 6);

    nonce.into()
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

#[async_trait]
impl<C: DatagramConn> DatagramConn for DtlsConn<C> {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.local_closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        let mut datagram = vec![0; RECEIVE_MTU];

        loop {
            let next = self.pending().pop_front();
            if let Some(plaintext) = next {
                let bytes_read = plaintext.len().min(buf.len());
                buf[..bytes_read].copy_from_slice(&plaintext[..bytes_read]);
                return Ok(bytes_read);
            }

            if self.remote_closed.load(Ordering::SeqCst) {
                return Ok(0);
            }

            let bytes_read = self.conn.recv(&mut datagram).await?;
            self.process_datagram(&datagram[..bytes_read]);
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.local_closed.load(Ordering::SeqCst) || self.remote_closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        let record = self.seal(ContentType::ApplicationData, buf)?;
        self.conn.send(&record).await?;

        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Sends a close_notify to the peer and closes the underlying connection.
    async fn close(&self) -> io::Result<()> {
        if self.local_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.remote_closed.load(Ordering::SeqCst) {
            let alert = self.seal(ContentType::Alert, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY])?;
            if let Err(err) = self.conn.send(&alert).await {
                debug!("Could not send close_notify: {}", err);
            }
        }

        self.conn.close().await
    }
}
