use std::time::Duration;
use anyhow::bail;

use crate::packet_header::PacketHeader;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This is the payload size inside UDP packets that the transport assumes. Messages are
    ///  split into fragments so that header plus fragment fits into this size, and the transport
    ///  relies on the network to deliver datagrams of this size without IP level fragmentation.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. With Jumbo frames, this can be significantly
    ///  bigger.
    ///
    /// Choosing this value too big causes packets to be dropped, which loses the entire message
    ///  they are part of. Choosing it too small wastes bandwidth on headers.
    pub payload_size_inside_udp: usize,

    /// Upper bound for the reassembled size of a single message. Fragments announcing a bigger
    ///  total are dropped rather than causing an allocation of that size.
    pub max_message_size: usize,

    /// A partially received message is discarded if no fragment arrived for it during this
    ///  interval. Frames are produced at camera frame rate, so anything older than a few frame
    ///  intervals is obsolete anyway.
    pub reassembly_timeout: Duration,

    /// Blocking socket reads return after this interval so the receive loop can check for
    ///  timeouts and for shutdown.
    pub socket_read_timeout: Duration,

    /// Number of heartbeat samples the clock offset is averaged over
    pub clock_sample_count: usize,

    /// Number of completed or discarded message ids remembered per message type, so that late
    ///  fragments for them are ignored.
    pub retired_id_memory: usize,

    pub event_channel_capacity: usize,
}

impl TransportConfig {
    /// IPV4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            payload_size_inside_udp: 1472,
            max_message_size: 64*1024*1024,
            reassembly_timeout: Duration::from_millis(500),
            socket_read_timeout: Duration::from_millis(10),
            clock_sample_count: 1000,
            retired_id_memory: 1024,
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < PacketHeader::SERIALIZED_LEN + 100 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > 65507 {
            bail!("Payload size does not fit into a UDP datagram");
        }
        if self.clock_sample_count == 0 {
            bail!("At least one clock sample is required");
        }
        if self.reassembly_timeout.is_zero() {
            bail!("Reassembly timeout must not be zero");
        }
        if self.socket_read_timeout.is_zero() {
            bail!("Socket read timeout must not be zero - it would block reads indefinitely");
        }
        if self.event_channel_capacity == 0 {
            bail!("Event channel capacity must not be zero");
        }
        Ok(())
    }

    /// The maximum number of message bytes that go into a single datagram
    pub fn max_fragment_len(&self) -> usize {
        self.payload_size_inside_udp - PacketHeader::SERIALIZED_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = TransportConfig::default_ipv4();
        config.validate().unwrap();
        assert_eq!(config.max_fragment_len(), 1472 - 41);
    }

    #[rstest]
    #[case::payload_too_small(TransportConfig { payload_size_inside_udp: 100, ..TransportConfig::default_ipv4() })]
    #[case::payload_too_big(TransportConfig { payload_size_inside_udp: 70000, ..TransportConfig::default_ipv4() })]
    #[case::no_clock_samples(TransportConfig { clock_sample_count: 0, ..TransportConfig::default_ipv4() })]
    #[case::zero_timeout(TransportConfig { reassembly_timeout: Duration::ZERO, ..TransportConfig::default_ipv4() })]
    #[case::zero_read_timeout(TransportConfig { socket_read_timeout: Duration::ZERO, ..TransportConfig::default_ipv4() })]
    fn test_invalid(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }
}
