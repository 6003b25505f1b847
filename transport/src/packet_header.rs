use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf_ext::BufExt;
use crate::error::PacketError;
use crate::safe_converter::SafeCast;

const FRAGMENT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    InitConnection = 0,
    Command = 1,
    UpdateDeviceSettings = 2,
    UpdateColorSettings = 3,
    UpdateFiltersSettings = 4,
    UpdateDelaySettings = 5,
    Synchro = 6,
    Feedback = 7,
    CompressedFrameData = 8,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::InitConnection,
        MessageType::Command,
        MessageType::UpdateDeviceSettings,
        MessageType::UpdateColorSettings,
        MessageType::UpdateFiltersSettings,
        MessageType::UpdateDelaySettings,
        MessageType::Synchro,
        MessageType::Feedback,
        MessageType::CompressedFrameData,
    ];
}

/// The fixed-size header in front of every datagram. See the crate documentation for the byte
///  layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_type: MessageType,
    pub message_id: i32,
    pub packet_index: u32,
    pub packet_count: u32,
    pub total_payload_bytes: u64,
    pub fragment_offset: u64,
    pub sender_timestamp_ns: i64,
    pub fragment_checksum: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()     // message type
        + size_of::<i32>()  // message id
        + size_of::<u32>()  // packet index
        + size_of::<u32>()  // packet count
        + size_of::<u64>()  // total payload bytes
        + size_of::<u64>()  // fragment offset
        + size_of::<i64>()  // sender timestamp
        + size_of::<u32>()  // checksum
    ;

    /// Header for a message that fits into a single datagram, e.g. heartbeats
    pub fn single_packet(message_type: MessageType, message_id: i32, fragment: &[u8], sender_timestamp_ns: i64) -> PacketHeader {
        PacketHeader {
            message_type,
            message_id,
            packet_index: 0,
            packet_count: 1,
            total_payload_bytes: fragment.len().safe_cast(),
            fragment_offset: 0,
            sender_timestamp_ns,
            fragment_checksum: fragment_checksum(fragment),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type.into());
        buf.put_i32(self.message_id);
        buf.put_u32(self.packet_index);
        buf.put_u32(self.packet_count);
        buf.put_u64(self.total_payload_bytes);
        buf.put_u64(self.fragment_offset);
        buf.put_i64(self.sender_timestamp_ns);
        buf.put_u32(self.fragment_checksum);
    }

    /// Parses the header fields without checking them against a fragment
    pub fn deser(mut buf: &[u8]) -> Result<PacketHeader, PacketError> {
        if buf.len() < Self::SERIALIZED_LEN {
            return Err(PacketError::Malformed(buf.len()));
        }

        let raw_message_type = buf.read_u8()?;
        let message_type = MessageType::try_from(raw_message_type)
            .map_err(|_| PacketError::UnknownMessageType(raw_message_type))?;

        Ok(PacketHeader {
            message_type,
            message_id: buf.read_i32()?,
            packet_index: buf.read_u32()?,
            packet_count: buf.read_u32()?,
            total_payload_bytes: buf.read_u64()?,
            fragment_offset: buf.read_u64()?,
            sender_timestamp_ns: buf.read_i64()?,
            fragment_checksum: buf.read_u32()?,
        })
    }

    fn validate_against(&self, fragment: &[u8]) -> Result<(), PacketError> {
        if self.packet_index >= self.packet_count {
            return Err(PacketError::InconsistentHeader("packet index out of range"));
        }
        let fragment_end = self.fragment_offset.checked_add(fragment.len().safe_cast());
        if fragment_end.map_or(true, |end| end > self.total_payload_bytes) {
            return Err(PacketError::InconsistentHeader("fragment exceeds total payload"));
        }

        let actual = fragment_checksum(fragment);
        if actual != self.fragment_checksum {
            return Err(PacketError::ChecksumMismatch { expected: self.fragment_checksum, actual });
        }
        Ok(())
    }
}

pub fn fragment_checksum(fragment: &[u8]) -> u32 {
    FRAGMENT_CRC.checksum(fragment)
}

/// Appends a complete datagram (header followed by fragment) to `buf`
pub fn encode(header: &PacketHeader, fragment: &[u8], buf: &mut BytesMut) {
    buf.reserve(PacketHeader::SERIALIZED_LEN + fragment.len());
    header.ser(buf);
    buf.put_slice(fragment);
}

/// Splits a datagram into its header and the fragment it carries. The fragment is borrowed from
///  the datagram, nothing is copied.
pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, &[u8]), PacketError> {
    let header = PacketHeader::deser(datagram)?;
    let fragment = &datagram[PacketHeader::SERIALIZED_LEN..];
    header.validate_against(fragment)?;
    Ok((header, fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn header_for(fragment: &[u8]) -> PacketHeader {
        PacketHeader {
            message_type: MessageType::CompressedFrameData,
            message_id: 17,
            packet_index: 2,
            packet_count: 5,
            total_payload_bytes: 1000,
            fragment_offset: 200,
            sender_timestamp_ns: -3,
            fragment_checksum: fragment_checksum(fragment),
        }
    }

    #[test]
    fn test_header_len() {
        assert_eq!(PacketHeader::SERIALIZED_LEN, 41);
    }

    #[test]
    fn test_byte_layout() {
        let header = PacketHeader {
            message_type: MessageType::Feedback,
            message_id: 0x01020304,
            packet_index: 5,
            packet_count: 6,
            total_payload_bytes: 7,
            fragment_offset: 8,
            sender_timestamp_ns: 9,
            fragment_checksum: 0x0a0b0c0d,
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(&buf[..], &[
            7,
            1, 2, 3, 4,
            0, 0, 0, 5,
            0, 0, 0, 6,
            0, 0, 0, 0, 0, 0, 0, 7,
            0, 0, 0, 0, 0, 0, 0, 8,
            0, 0, 0, 0, 0, 0, 0, 9,
            0x0a, 0x0b, 0x0c, 0x0d,
        ]);
    }

    #[test]
    fn test_encode_decode() {
        let fragment = b"some fragment bytes";
        let header = header_for(fragment);

        let mut buf = BytesMut::new();
        encode(&header, fragment, &mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN + fragment.len());

        let (decoded, decoded_fragment) = decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded_fragment, fragment);
    }

    #[test]
    fn test_decode_empty_fragment() {
        let header = PacketHeader::single_packet(MessageType::Synchro, 3, &[], 12345);
        let mut buf = BytesMut::new();
        encode(&header, &[], &mut buf);

        let (decoded, fragment) = decode(&buf).unwrap();
        assert_eq!(decoded.sender_timestamp_ns, 12345);
        assert!(fragment.is_empty());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_byte(1)]
    #[case::one_short(PacketHeader::SERIALIZED_LEN - 1)]
    fn test_decode_too_short(#[case] len: usize) {
        let buf = vec![0u8; len];
        assert_eq!(decode(&buf), Err(PacketError::Malformed(len)));
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let mut buf = BytesMut::new();
        encode(&header_for(&[]), &[], &mut buf);
        buf[0] = 99;
        assert_eq!(decode(&buf), Err(PacketError::UnknownMessageType(99)));
    }

    #[rstest]
    #[case::index_equals_count(5, 5, 0, 100)]
    #[case::index_beyond_count(7, 5, 0, 100)]
    #[case::fragment_beyond_total(0, 5, 95, 100)]
    #[case::offset_overflow(0, 5, u64::MAX, u64::MAX)]
    fn test_decode_inconsistent(#[case] packet_index: u32, #[case] packet_count: u32, #[case] fragment_offset: u64, #[case] total_payload_bytes: u64) {
        let fragment = [1u8; 10];
        let header = PacketHeader {
            packet_index,
            packet_count,
            fragment_offset,
            total_payload_bytes,
            ..header_for(&fragment)
        };
        let mut buf = BytesMut::new();
        encode(&header, &fragment, &mut buf);

        assert!(matches!(decode(&buf), Err(PacketError::InconsistentHeader(_))));
    }

    #[test]
    fn test_decode_corrupted_fragment() {
        let fragment = b"abcdef";
        let mut buf = BytesMut::new();
        encode(&header_for(fragment), fragment, &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        assert!(matches!(decode(&buf), Err(PacketError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_message_type_roundtrip() {
        for message_type in MessageType::ALL {
            let raw: u8 = message_type.into();
            assert_eq!(MessageType::try_from(raw).unwrap(), message_type);
        }
        assert!(MessageType::try_from(MessageType::ALL.len() as u8).is_err());
    }
}
