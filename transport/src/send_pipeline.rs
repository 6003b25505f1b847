#[cfg(test)] use mockall::automock;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::clock::now_nanos;
use crate::fragmentation::split;
use crate::packet_header::{encode, MessageType, PacketHeader};

/// This is an abstraction for sending a datagram to the connected peer, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

impl SendSocket for UdpSocket {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        let num_sent = self.send(datagram)?;
        if num_sent != datagram.len() {
            return Err(std::io::Error::other(format!("datagram truncated: sent {} of {} bytes", num_sent, datagram.len())));
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        UdpSocket::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        UdpSocket::local_addr(self).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendStats {
    pub messages_sent: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
}

/// Splits messages into fragments and sends them as datagrams to a single peer.
///
/// Message ids are counted per message type. Every sender starts counting at a clock-derived value
///  rather than zero, so that a receiver still remembering the ids of a previous sender's messages
///  does not mistake a restarted peer's messages for stale ones. The datagram buffer is reused
///  across sends.
pub struct PacketSender {
    socket: Arc<dyn SendSocket>,
    max_fragment_len: usize,
    first_message_id: i32,
    next_message_ids: FxHashMap<MessageType, i32>,
    packet_buf: BytesMut,
    stats: SendStats,
}

impl PacketSender {
    pub fn new(socket: Arc<dyn SendSocket>, max_fragment_len: usize) -> anyhow::Result<PacketSender> {
        let first_message_id = ((now_nanos() / 1_000) & 0x3fff_ffff) as i32;
        PacketSender::with_first_message_id(socket, max_fragment_len, first_message_id)
    }

    pub fn with_first_message_id(socket: Arc<dyn SendSocket>, max_fragment_len: usize, first_message_id: i32) -> anyhow::Result<PacketSender> {
        if max_fragment_len == 0 {
            bail!("fragment length must be positive");
        }
        Ok(PacketSender {
            socket,
            max_fragment_len,
            first_message_id,
            next_message_ids: FxHashMap::default(),
            packet_buf: BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + max_fragment_len),
            stats: SendStats::default(),
        })
    }

    /// Binds a UDP socket to `local_addr` and connects it to `peer_addr`
    pub fn connect(local_addr: SocketAddr, peer_addr: SocketAddr, max_fragment_len: usize) -> anyhow::Result<PacketSender> {
        let socket = UdpSocket::bind(local_addr)
            .map_err(|e| anyhow!("binding send socket to {:?}: {}", local_addr, e))?;
        socket.connect(peer_addr)
            .map_err(|e| anyhow!("connecting send socket to {:?}: {}", peer_addr, e))?;
        debug!("sending from {:?} to {:?}", socket.local_addr().ok(), peer_addr);

        PacketSender::new(Arc::new(socket), max_fragment_len)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    /// Sends a message as one or more datagrams, returning the message id it was sent with. If
    ///  sending a fragment fails, the remaining fragments are not sent - the receiver can not
    ///  complete the message anyway.
    pub fn send_message(&mut self, message_type: MessageType, payload: &[u8]) -> anyhow::Result<i32> {
        let message_id = self.next_message_id(message_type);

        for fragment in split(message_type, message_id, payload, self.max_fragment_len, 0) {
            let header = PacketHeader {
                sender_timestamp_ns: now_nanos(),
                ..fragment.header
            };

            self.packet_buf.clear();
            encode(&header, fragment.data, &mut self.packet_buf);
            trace!("sending {:?} #{} fragment {}/{}", message_type, message_id, header.packet_index, header.packet_count);

            self.socket.send_datagram(&self.packet_buf)
                .map_err(|e| anyhow!("sending {:?} #{} to {:?}: {}", message_type, message_id, self.socket.peer_addr(), e))?;
            self.stats.datagrams_sent += 1;
            self.stats.bytes_sent += self.packet_buf.len() as u64;
        }

        self.stats.messages_sent += 1;
        Ok(message_id)
    }

    /// Sends a heartbeat: a single datagram without payload, carrying only the send timestamp
    pub fn send_synchro(&mut self) -> anyhow::Result<()> {
        self.send_message(MessageType::Synchro, &[])?;
        Ok(())
    }

    fn next_message_id(&mut self, message_type: MessageType) -> i32 {
        let next = self.next_message_ids.entry(message_type).or_insert(self.first_message_id);
        let result = *next;
        *next = next.wrapping_add(1);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::decode;
    use std::sync::Mutex;
    use std::time::Instant;
    use crate::reassembly::MessageReassembler;

    fn recording_socket(sent: Arc<Mutex<Vec<Vec<u8>>>>) -> MockSendSocket {
        let mut socket = MockSendSocket::new();
        socket.expect_send_datagram()
            .returning(move |datagram| {
                sent.lock().unwrap().push(datagram.to_vec());
                Ok(())
            });
        socket.expect_peer_addr()
            .returning(|| None);
        socket
    }

    #[test]
    fn test_send_fragments() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sender = PacketSender::with_first_message_id(Arc::new(recording_socket(sent.clone())), 1_400, 0).unwrap();

        let payload = (0..300_000usize).map(|i| i as u8).collect::<Vec<_>>();
        let message_id = sender.send_message(MessageType::CompressedFrameData, &payload).unwrap();
        assert_eq!(message_id, 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 215);
        assert!(sent.iter().all(|d| d.len() <= PacketHeader::SERIALIZED_LEN + 1_400));

        let mut reassembler = MessageReassembler::new(MessageType::CompressedFrameData, 1024*1024, 16);
        for datagram in sent.iter().rev() {
            let (header, fragment) = decode(datagram).unwrap();
            assert_eq!(header.message_type, MessageType::CompressedFrameData);
            reassembler.on_fragment(&header, fragment, Instant::now());
        }
        assert_eq!(&reassembler.take_completed().unwrap().payload[..], &payload[..]);
        assert_eq!(sender.stats().datagrams_sent, 215);
        assert_eq!(sender.stats().messages_sent, 1);
    }

    #[test]
    fn test_message_ids_per_type() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sender = PacketSender::new(Arc::new(recording_socket(sent.clone())), 100).unwrap();

        let first = sender.send_message(MessageType::Feedback, b"a").unwrap();
        assert!(first >= 0);
        assert_eq!(sender.send_message(MessageType::Feedback, b"b").unwrap(), first + 1);
        assert_eq!(sender.send_message(MessageType::Command, b"c").unwrap(), first);
        sender.send_synchro().unwrap();

        let sent = sent.lock().unwrap();
        let (synchro, payload) = decode(&sent[3]).unwrap();
        assert_eq!(synchro.message_type, MessageType::Synchro);
        assert_eq!(synchro.packet_count, 1);
        assert!(payload.is_empty());
        assert!(synchro.sender_timestamp_ns > 0);
    }

    #[test]
    fn test_send_error_aborts_message() {
        let mut socket = MockSendSocket::new();
        socket.expect_send_datagram()
            .times(1)
            .returning(|_| Err(std::io::Error::other("network is down")));
        socket.expect_peer_addr()
            .returning(|| None);

        let mut sender = PacketSender::new(Arc::new(socket), 10).unwrap();
        assert!(sender.send_message(MessageType::CompressedFrameData, &[0u8; 100]).is_err());
        assert_eq!(sender.stats().datagrams_sent, 0);
    }

    #[test]
    fn test_zero_fragment_len_is_an_error() {
        let socket = MockSendSocket::new();
        assert!(PacketSender::new(Arc::new(socket), 0).is_err());
        assert!(PacketSender::connect("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap(), 0).is_err());
    }

    #[test]
    fn test_connect_sends_to_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();

        let mut sender = PacketSender::connect("127.0.0.1:0".parse().unwrap(), peer.local_addr().unwrap(), 1_000).unwrap();
        assert_eq!(sender.peer_addr(), Some(peer.local_addr().unwrap()));
        assert!(sender.local_addr().is_some());
        sender.send_message(MessageType::Command, &[3]).unwrap();

        let mut buf = [0u8; 2_000];
        let len = peer.recv(&mut buf).unwrap();
        let (header, fragment) = decode(&buf[..len]).unwrap();
        assert_eq!(header.message_type, MessageType::Command);
        assert_eq!(fragment, &[3]);
    }
}
