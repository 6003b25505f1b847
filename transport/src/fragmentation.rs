use crate::packet_header::{fragment_checksum, MessageType, PacketHeader};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// One datagram's worth of a message, borrowed from the message buffer
#[derive(Debug, Clone)]
pub struct Fragment<'a> {
    pub header: PacketHeader,
    pub data: &'a [u8],
}

/// The number of fragments a payload is split into. An empty payload still needs one (empty)
///  fragment to be transmitted at all.
pub fn packet_count(payload_len: usize, max_fragment_len: usize) -> u32 {
    debug_assert!(max_fragment_len > 0);
    payload_len.div_ceil(max_fragment_len).max(1).prechecked_cast()
}

/// Splits a payload into fragments of `max_fragment_len` bytes (the last one possibly shorter),
///  each with its own header carrying index, offset and checksum.
pub fn split<'a>(message_type: MessageType, message_id: i32, payload: &'a [u8], max_fragment_len: usize, sender_timestamp_ns: i64) -> impl Iterator<Item = Fragment<'a>> + 'a {
    let packet_count = packet_count(payload.len(), max_fragment_len);
    let total_payload_bytes: u64 = payload.len().safe_cast();

    (0..packet_count).map(move |packet_index| {
        let index: usize = packet_index.safe_cast();
        let offset = index * max_fragment_len;
        let end = (offset + max_fragment_len).min(payload.len());
        let data = &payload[offset..end];

        Fragment {
            header: PacketHeader {
                message_type,
                message_id,
                packet_index,
                packet_count,
                total_payload_bytes,
                fragment_offset: offset.safe_cast(),
                sender_timestamp_ns,
                fragment_checksum: fragment_checksum(data),
            },
            data,
        }
    })
}
