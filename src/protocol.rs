use bytes::{Buf, BufMut, BytesMut};
use std::error::Error;

/// Size in bytes of the fixed header preceding every record.
pub const RECORD_HEADER_SIZE: usize = 13;

/// Largest value the 48-bit sequence number field can carry.
pub const MAX_SEQUENCE_NUMBER: u64 = 0x0000_ffff_ffff_ffff;

/// DTLS 1.0 version marker, still sent by some peers in their first flight.
pub const PROTOCOL_VERSION_1_0: ProtocolVersion = ProtocolVersion {
    major: 0xfe,
    minor: 0xff,
};

/// DTLS 1.2 version marker.
pub const PROTOCOL_VERSION_1_2: ProtocolVersion = ProtocolVersion {
    major: 0xfe,
    minor: 0xfd,
};

/// Encountered when bytes cannot be interpreted as one or more records.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Fewer bytes than a record header were provided.
    BufferTooSmall,
    /// The content-type byte is not one of the known record types.
    InvalidContentType(u8),
    /// The version field is neither DTLS 1.0 nor DTLS 1.2.
    UnsupportedVersion(ProtocolVersion),
    /// The sequence number does not fit into 48 bits.
    SequenceNumberOverflow,
    /// A declared record length runs past the end of the datagram, or a payload is too large
    /// to be described by the 16-bit length field.
    InvalidPacketLength,
}

impl Error for RecordError {}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RecordError::BufferTooSmall => write!(f, "buffer is too small to hold a record header"),
            RecordError::InvalidContentType(ct) => write!(f, "invalid record content type {}", ct),
            RecordError::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {:#04x}.{:#04x}", v.major, v.minor)
            }
            RecordError::SequenceNumberOverflow => {
                write!(f, "sequence number exceeds the 48-bit record field")
            }
            RecordError::InvalidPacketLength => write!(f, "record length is inconsistent with datagram"),
        }
    }
}

/// The kind of payload carried by a record.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            other => Err(RecordError::InvalidContentType(other)),
        }
    }
}

/// Two-byte protocol version as it appears on the wire.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// The fixed-size header at the start of every record.
///
/// Only the content type matters to a listener deciding whether to allocate a connection; the
/// remaining fields are consumed by the record protection of an established connection.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub length: u16,
}

impl RecordHeader {
    /// Parses the header found at the start of `data`.
    ///
    /// Trailing bytes beyond [`RECORD_HEADER_SIZE`] are ignored, so the full record can be
    /// passed in directly.
    ///
    pub fn unmarshal(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::BufferTooSmall);
        }

        let mut buf = &data[..RECORD_HEADER_SIZE];
        let content_type = ContentType::try_from(buf.get_u8())?;
        let version = ProtocolVersion {
            major: buf.get_u8(),
            minor: buf.get_u8(),
        };
        let epoch = buf.get_u16();
        let sequence_number = buf.get_uint(6);
        let length = buf.get_u16();

        if version != PROTOCOL_VERSION_1_0 && version != PROTOCOL_VERSION_1_2 {
            return Err(RecordError::UnsupportedVersion(version));
        }

        Ok(Self {
            content_type,
            version,
            epoch,
            sequence_number,
            length,
        })
    }

    /// Writes the serialized header into `out`.
    ///
    pub fn marshal<B: BufMut>(&self, out: &mut B) -> Result<(), RecordError> {
        if self.sequence_number > MAX_SEQUENCE_NUMBER {
            return Err(RecordError::SequenceNumberOverflow);
        }

        out.put_u8(self.content_type as u8);
        out.put_u8(self.version.major);
        out.put_u8(self.version.minor);
        out.put_u16(self.epoch);
        out.put_uint(self.sequence_number, 6);
        out.put_u16(self.length);

        Ok(())
    }
}

/// Frames `payload` as a single DTLS 1.2 record.
///
pub fn encode_record(
    content_type: ContentType,
    epoch: u16,
    sequence_number: u64,
    payload: &[u8],
) -> Result<Vec<u8>, RecordError> {
    let length = u16::try_from(payload.len()).map_err(|_| RecordError::InvalidPacketLength)?;
    let header = RecordHeader {
        content_type,
        version: PROTOCOL_VERSION_1_2,
        epoch,
        sequence_number,
        length,
    };

    let mut bytes = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    header.marshal(&mut bytes)?;
    bytes.extend_from_slice(payload);

    Ok(bytes.to_vec())
}

/// Splits a datagram into the records coalesced inside it, using each header's length field.
///
/// Every record must carry at least one payload byte and must end within the datagram. An empty
/// datagram yields no records.
///
pub fn unpack_datagram(datagram: &[u8]) -> Result<Vec<&[u8]>, RecordError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset != datagram.len() {
        if datagram.len() - offset <= RECORD_HEADER_SIZE {
            return Err(RecordError::InvalidPacketLength);
        }

        let mut length_field = &datagram[offset + RECORD_HEADER_SIZE - 2..];
        let record_len = RECORD_HEADER_SIZE + length_field.get_u16() as usize;
        if offset + record_len > datagram.len() {
            return Err(RecordError::InvalidPacketLength);
        }

        records.push(&datagram[offset..offset + record_len]);
        offset += record_len;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use crate::protocol::*;

    #[test]
    fn header_layout() -> anyhow::Result<()> {
        let record = encode_record(ContentType::Handshake, 1, 0x0102_0304_0506, &[9; 5])?;
        assert_eq!(RECORD_HEADER_SIZE + 5, record.len());
        assert_eq!(
            &record[..RECORD_HEADER_SIZE],
            &[22, 0xfe, 0xfd, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x05]
        );

        let header = RecordHeader::unmarshal(&record)?;
        assert_eq!(header.content_type, ContentType::Handshake);
        assert_eq!(header.version, PROTOCOL_VERSION_1_2);
        assert_eq!(header.epoch, 1);
        assert_eq!(header.sequence_number, 0x0102_0304_0506);
        assert_eq!(header.length, 5);

        Ok(())
    }

    #[test]
    fn header_rejects_short_input() {
        assert_eq!(
            RecordHeader::unmarshal(&[22, 0xfe, 0xfd]),
            Err(RecordError::BufferTooSmall)
        );
    }

    #[test]
    fn header_rejects_unknown_content_type() {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0] = 99;
        bytes[1] = 0xfe;
        bytes[2] = 0xfd;

        assert_eq!(
            RecordHeader::unmarshal(&bytes),
            Err(RecordError::InvalidContentType(99))
        );
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0] = 22;
        bytes[1] = 0x03;
        bytes[2] = 0x03;

        assert!(matches!(
            RecordHeader::unmarshal(&bytes),
            Err(RecordError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn header_accepts_dtls_1_0() -> anyhow::Result<()> {
        let mut record = encode_record(ContentType::Handshake, 0, 0, &[1])?;
        record[2] = 0xff;

        assert_eq!(RecordHeader::unmarshal(&record)?.version, PROTOCOL_VERSION_1_0);
        Ok(())
    }

    #[test]
    fn sequence_number_overflow() {
        let result = encode_record(ContentType::ApplicationData, 1, MAX_SEQUENCE_NUMBER + 1, &[1]);
        assert_eq!(result, Err(RecordError::SequenceNumberOverflow));
    }

    #[test]
    fn unpack_coalesced_records() -> anyhow::Result<()> {
        let mut datagram = encode_record(ContentType::Handshake, 0, 0, &[1, 2, 3])?;
        datagram.extend(encode_record(ContentType::Handshake, 0, 1, &[4])?);
        datagram.extend(encode_record(ContentType::ChangeCipherSpec, 0, 2, &[1])?);

        let records = unpack_datagram(&datagram)?;
        assert_eq!(3, records.len());
        assert_eq!(RECORD_HEADER_SIZE + 3, records[0].len());
        assert_eq!(RECORD_HEADER_SIZE + 1, records[1].len());
        assert_eq!(
            RecordHeader::unmarshal(records[2])?.content_type,
            ContentType::ChangeCipherSpec
        );

        Ok(())
    }

    #[test]
    fn unpack_empty_datagram() -> anyhow::Result<()> {
        assert!(unpack_datagram(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn unpack_rejects_truncated_payload() -> anyhow::Result<()> {
        let record = encode_record(ContentType::Handshake, 0, 0, &[1, 2, 3, 4])?;

        assert_eq!(
            unpack_datagram(&record[..record.len() - 1]),
            Err(RecordError::InvalidPacketLength)
        );
        Ok(())
    }

    #[test]
    fn unpack_rejects_header_only_record() {
        let header_only = [22, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            unpack_datagram(&header_only),
            Err(RecordError::InvalidPacketLength)
        );
    }
}
