use crate::protocol::{unpack_datagram, ContentType, RecordHeader};

/// Returns `true` when `datagram` opens a new handshake and deserves connection state.
///
/// Only the first record is inspected: it must be framed correctly, carry a parseable header and
/// have the handshake content type. Anything else, including well-formed application data or
/// alerts from peers the listener does not know, is rejected. Records after the first are left to
/// the handshake to validate. Never blocks and never allocates connection state.
pub fn accept_handshake(datagram: &[u8]) -> bool {
    let records = match unpack_datagram(datagram) {
        Ok(records) => records,
        Err(_) => return false,
    };

    let first = match records.first() {
        Some(first) => first,
        None => return false,
    };

    match RecordHeader::unmarshal(first) {
        Ok(header) => header.content_type == ContentType::Handshake,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::dtls::accept_handshake;
    use crate::protocol::{encode_record, ContentType, RECORD_HEADER_SIZE};
    use rand::RngCore;

    #[test]
    fn accepts_handshake_record() -> anyhow::Result<()> {
        let datagram = encode_record(ContentType::Handshake, 0, 0, &[1, 0, 0])?;
        assert!(accept_handshake(&datagram));
        Ok(())
    }

    #[test]
    fn rejects_other_content_types() -> anyhow::Result<()> {
        for content_type in &[
            ContentType::ApplicationData,
            ContentType::Alert,
            ContentType::ChangeCipherSpec,
        ] {
            let datagram = encode_record(*content_type, 1, 7, &[1, 2, 3, 4])?;
            assert!(!accept_handshake(&datagram), "{:?} accepted", content_type);
        }
        Ok(())
    }

    #[test]
    fn rejects_malformed_input() -> anyhow::Result<()> {
        assert!(!accept_handshake(&[]));
        assert!(!accept_handshake(&[22]));
        assert!(!accept_handshake(&[22; RECORD_HEADER_SIZE]));

        let record = encode_record(ContentType::Handshake, 0, 0, &[1; 8])?;
        assert!(!accept_handshake(&record[..record.len() - 1]));

        let mut bad_version = record.clone();
        bad_version[1] = 0x03;
        bad_version[2] = 0x03;
        assert!(!accept_handshake(&bad_version));

        Ok(())
    }

    #[test]
    fn rejects_random_noise() {
        let mut rng = rand::thread_rng();
        let mut datagram = [0u8; 40];

        for _ in 0..1000 {
            rng.fill_bytes(&mut datagram);
            assert!(!accept_handshake(&datagram), "accepted {:02x?}", datagram);
        }
    }

    #[test]
    fn ignores_well_framed_records_after_the_first() -> anyhow::Result<()> {
        let mut datagram = encode_record(ContentType::Handshake, 0, 0, &[1, 0, 0])?;
        datagram.extend(encode_record(ContentType::ApplicationData, 9, 1, &[0xff; 6])?);

        assert!(accept_handshake(&datagram));
        Ok(())
    }

    #[test]
    fn rejects_when_a_later_record_is_truncated() -> anyhow::Result<()> {
        // framing of the whole datagram is checked before the first header is read
        let mut datagram = encode_record(ContentType::Handshake, 0, 0, &[1, 0, 0])?;
        let trailing = encode_record(ContentType::Handshake, 0, 1, &[1; 32])?;
        datagram.extend(&trailing[..20]);

        assert!(!accept_handshake(&datagram));
        Ok(())
    }
}
