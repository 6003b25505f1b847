use crate::buf_ext::BufferUnderflow;

/// Reasons for dropping a received datagram. None of these are fatal: the receive loop counts
///  and reports them and carries on with the next datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("malformed packet: {0} bytes is shorter than the packet header")]
    Malformed(usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("inconsistent packet header: {0}")]
    InconsistentHeader(&'static str),
    #[error("fragment checksum mismatch: header says {expected:08x}, fragment has {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl From<BufferUnderflow> for PacketError {
    fn from(value: BufferUnderflow) -> Self {
        PacketError::Malformed(value.remaining)
    }
}
