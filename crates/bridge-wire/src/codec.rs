use crate::{
    command::MAX_PAYLOAD,
    error::FramingError,
    packet::Packet,
};

/// Computes `Σ payload bytes mod 2^32`, the checksum the wire format uses.
#[inline]
pub fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Fills in `magic` and `data_check` from `command` and `payload`. Does not
/// otherwise transform the packet: no reordering, no fragmentation.
pub fn encode(packet: &mut Packet) {
    packet.msg.data_length = packet.payload.len() as u32;
    packet.msg.data_check = checksum(packet.payload.as_slice());
    packet.msg.magic = packet.msg.command ^ 0xFFFF_FFFF;
}

/// Validates a decoded header before its payload (if any) is read.
///
/// Rejects frames whose `magic` doesn't match `command`, or whose declared
/// `data_length` exceeds [`MAX_PAYLOAD`].
pub fn validate_header(packet: &Packet) -> Result<(), FramingError> {
    let expected_magic = packet.msg.command ^ 0xFFFF_FFFF;
    if packet.msg.magic != expected_magic {
        return Err(FramingError::BadMagic { command: packet.msg.command, magic: packet.msg.magic });
    }
    if packet.msg.data_length as usize > MAX_PAYLOAD {
        return Err(FramingError::LengthOverflow {
            len: packet.msg.data_length,
            max: MAX_PAYLOAD as u32,
        });
    }
    Ok(())
}

/// Validates that the payload already read into `packet` matches its
/// declared `data_check`. Call only after `validate_header` has succeeded
/// and the full payload has been read.
pub fn validate_data(packet: &Packet) -> Result<(), FramingError> {
    let got = checksum(packet.payload.as_slice());
    if got != packet.msg.data_check {
        return Err(FramingError::BadChecksum { expected: packet.msg.data_check, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::CNXN, message::Message, packet::Packet};

    #[test]
    fn encode_then_validate_round_trips() {
        for payload in [&b""[..], b"host::\0", &vec![7u8; MAX_PAYLOAD]] {
            let mut p = Packet::with_payload(
                Message { command: CNXN, arg0: 1, arg1: 2, ..Default::default() },
                payload,
            );
            encode(&mut p);
            validate_header(&p).unwrap();
            validate_data(&p).unwrap();
            assert_eq!(p.msg.data_length as usize, payload.len());
        }
    }

    #[test]
    fn zero_length_payload_has_zero_checksum() {
        let mut p = Packet::with_payload(Message { command: CNXN, ..Default::default() }, b"");
        encode(&mut p);
        assert_eq!(p.msg.data_check, 0);
    }

    #[test]
    fn max_payload_accepted_overflow_rejected() {
        let mut p = Packet::with_payload(
            Message { command: CNXN, ..Default::default() },
            &vec![1u8; MAX_PAYLOAD],
        );
        encode(&mut p);
        assert!(validate_header(&p).is_ok());

        // A header claiming one byte over MAX_PAYLOAD must be rejected
        // regardless of what's actually in the (fixed-capacity) buffer.
        p.msg.data_length = MAX_PAYLOAD as u32 + 1;
        assert!(matches!(validate_header(&p), Err(FramingError::LengthOverflow { .. })));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut p = Packet::with_payload(Message { command: CNXN, ..Default::default() }, b"hi");
        encode(&mut p);
        p.msg.magic ^= 1;
        assert!(matches!(validate_header(&p), Err(FramingError::BadMagic { .. })));
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut p = Packet::with_payload(Message { command: CNXN, ..Default::default() }, b"hi");
        encode(&mut p);
        p.msg.data_check ^= 1;
        assert!(validate_header(&p).is_ok());
        assert!(matches!(validate_data(&p), Err(FramingError::BadChecksum { .. })));
    }

    #[test]
    fn known_handshake_frame_matches_literal_bytes() {
        // Scenario 3 from the testable-properties list: the first frame a
        // reader thread sends has these exact field values.
        let payload = b"host::\0";
        let mut p = Packet::with_payload(
            Message { command: CNXN, arg0: 0x0100_0000, arg1: 0x0000_1000, ..Default::default() },
            payload,
        );
        encode(&mut p);
        assert_eq!(p.msg.command, 0x4e58_4e43);
        assert_eq!(p.msg.arg0, 0x0100_0000);
        assert_eq!(p.msg.arg1, 0x0000_1000);
        assert_eq!(p.msg.data_length, payload.len() as u32);
        assert_eq!(p.msg.data_check, checksum(payload));
        assert_eq!(p.msg.magic, 0xb1a7_b1bc);
    }
}
