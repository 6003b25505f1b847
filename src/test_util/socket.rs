use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use transport::packet_header::{decode, MessageType, PacketHeader};
use transport::send_pipeline::SendSocket;

/// A [SendSocket] that keeps every datagram instead of sending it
#[derive(Clone, Default)]
pub struct RecordingSocket {
    datagrams: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSocket {
    pub fn new() -> RecordingSocket {
        RecordingSocket::default()
    }

    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.datagrams.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The decoded headers and fragments of all datagrams sent so far
    pub fn packets(&self) -> Vec<(PacketHeader, Vec<u8>)> {
        self.datagrams().iter()
            .filter_map(|d| decode(d).ok())
            .map(|(header, fragment)| (header, fragment.to_vec()))
            .collect()
    }

    pub fn message_types(&self) -> Vec<MessageType> {
        self.packets().into_iter()
            .map(|(header, _)| header.message_type)
            .collect()
    }

    pub fn non_synchro_types(&self) -> Vec<MessageType> {
        self.message_types().into_iter()
            .filter(|&t| t != MessageType::Synchro)
            .collect()
    }
}

impl SendSocket for RecordingSocket {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        self.datagrams.lock().unwrap_or_else(|e| e.into_inner()).push(datagram.to_vec());
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Polls `condition` until it holds, returning `false` if it did not within `timeout`
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
