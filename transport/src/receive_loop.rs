use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::clock_sync::ClockSynchronizer;
use crate::config::TransportConfig;
use crate::events::{TransportEvent, TransportEventNotifier};
use crate::packet_header::{decode, MessageType};
use crate::reassembly::{CompletedMessage, MessageReassembler, ReassemblyStats};

/// Everything the receive thread shares with the thread calling `update()`, behind a single lock
pub(crate) struct ReceiveState {
    reassemblers: FxHashMap<MessageType, MessageReassembler>,
    clock: ClockSynchronizer,
    inbox: VecDeque<CompletedMessage>,
    stats: ReceiveStats,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveStats {
    pub datagrams_received: u64,
    pub packets_dropped: u64,
    pub synchros_received: u64,
    pub reassembly: ReassemblyStats,
}

/// The messages completed since the last drain, together with the clock offset estimate at the
///  time of draining
#[derive(Debug)]
pub struct ReceiveBatch {
    pub messages: Vec<CompletedMessage>,
    pub clock_offset_ns: i64,
}

impl ReceiveBatch {
    /// converts a timestamp from the peer's time base into the local one
    pub fn correct(&self, remote_timestamp_ns: i64) -> i64 {
        remote_timestamp_ns.saturating_add(self.clock_offset_ns)
    }
}

impl ReceiveState {
    pub(crate) fn new(config: &TransportConfig) -> anyhow::Result<ReceiveState> {
        let reassemblers = MessageType::ALL.iter()
            .filter(|&&t| t != MessageType::Synchro)
            .map(|&t| (t, MessageReassembler::new(t, config.max_message_size, config.retired_id_memory)))
            .collect();

        Ok(ReceiveState {
            reassemblers,
            clock: ClockSynchronizer::new(config.clock_sample_count)?,
            inbox: VecDeque::new(),
            stats: ReceiveStats::default(),
        })
    }

    /// Decodes a datagram and feeds it to the clock synchronizer (heartbeats) or the reassembler
    ///  for its message type (everything else). Returns an event if the datagram was dropped.
    pub(crate) fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> Option<TransportEvent> {
        self.stats.datagrams_received += 1;

        let (header, fragment) = match decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping datagram: {}", e);
                self.stats.packets_dropped += 1;
                return Some(TransportEvent::PacketDropped(e));
            }
        };

        if header.message_type == MessageType::Synchro {
            self.stats.synchros_received += 1;
            self.clock.update(header.sender_timestamp_ns);
            return None;
        }

        let Some(reassembler) = self.reassemblers.get_mut(&header.message_type) else {
            return None;
        };
        reassembler.on_fragment(&header, fragment, now);
        while let Some(completed) = reassembler.take_completed() {
            trace!("received {:?} #{} with {} bytes", completed.message_type, completed.message_id, completed.payload.len());
            self.inbox.push_back(completed);
        }
        None
    }

    pub(crate) fn check_timeouts(&mut self, now: Instant, max_age: Duration) -> Vec<TransportEvent> {
        self.reassemblers.values_mut()
            .filter_map(|r| {
                let count = r.check_timeouts(now, max_age);
                (count > 0).then(|| TransportEvent::MessagesTimedOut { message_type: r.message_type(), count })
            })
            .collect()
    }

    pub(crate) fn drain(&mut self) -> ReceiveBatch {
        ReceiveBatch {
            messages: self.inbox.drain(..).collect(),
            clock_offset_ns: self.clock.average_offset_ns(),
        }
    }

    fn reset_reassembly(&mut self) {
        for r in self.reassemblers.values_mut() {
            r.reset();
        }
    }

    fn stats(&self) -> ReceiveStats {
        let mut result = self.stats.clone();
        result.reassembly = ReassemblyStats::default();
        for r in self.reassemblers.values() {
            result.reassembly.merge(r.stats());
        }
        result
    }
}

fn lock(state: &Mutex<ReceiveState>) -> MutexGuard<'_, ReceiveState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns a bound UDP socket and the thread reading from it.
///
/// Completed messages accumulate in an inbox until a caller drains them with [Receiver::try_drain].
///  Draining never blocks: if the receive thread holds the lock at that moment, the drain is
///  skipped and the messages are picked up by the next one.
pub struct Receiver {
    state: Arc<Mutex<ReceiveState>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    events: TransportEventNotifier,
}

impl Receiver {
    pub fn bind(addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<Receiver> {
        config.validate()?;

        let socket = UdpSocket::bind(addr)
            .map_err(|e| anyhow!("binding receive socket to {:?}: {}", addr, e))?;
        socket.set_read_timeout(Some(config.socket_read_timeout))?;
        let local_addr = socket.local_addr()?;

        let state = Arc::new(Mutex::new(ReceiveState::new(&config)?));
        let running = Arc::new(AtomicBool::new(true));
        let events = TransportEventNotifier::new(config.event_channel_capacity);

        let handle = {
            let state = state.clone();
            let running = running.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(format!("udp-receive-{}", local_addr.port()))
                .spawn(move || receive_loop(socket, state, running, events, config))?
        };
        info!("receiving on {:?}", local_addr);

        Ok(Receiver {
            state,
            running,
            handle: Some(handle),
            local_addr,
            events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Takes all messages completed since the last call, or returns `None` without waiting if the
    ///  receive thread currently holds the lock
    pub fn try_drain(&self) -> Option<ReceiveBatch> {
        match self.state.try_lock() {
            Ok(mut state) => Some(state.drain()),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner().drain()),
            Err(TryLockError::WouldBlock) => {
                trace!("receive state is busy - skipping drain");
                None
            }
        }
    }

    pub fn clock_offset_ns(&self) -> i64 {
        lock(&self.state).clock.average_offset_ns()
    }

    /// Discards all partially received messages and forgets retired message ids, for when the
    ///  peer starts over with fresh message ids
    pub fn reset_reassembly(&self) {
        debug!("resetting reassembly state on {:?}", self.local_addr);
        lock(&self.state).reset_reassembly();
    }

    pub fn stats(&self) -> ReceiveStats {
        lock(&self.state).stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the receive thread and waits for it to finish. The thread notices within one socket
    ///  read timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("receive thread on {:?} panicked", self.local_addr);
            }
            debug!("stopped receiving on {:?}", self.local_addr);
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

fn is_socket_closed(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted)
}

fn receive_loop(socket: UdpSocket, state: Arc<Mutex<ReceiveState>>, running: Arc<AtomicBool>, events: TransportEventNotifier, config: Arc<TransportConfig>) {
    let mut buf = vec![0u8; 65536];
    let timeout_check_interval = config.reassembly_timeout / 4;
    let mut last_timeout_check = Instant::now();

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!("received {} bytes from {:?}", len, from);
                let event = lock(&state).on_datagram(&buf[..len], Instant::now());
                if let Some(event) = event {
                    events.send_event(event);
                }
            }
            Err(e) if is_timeout(e.kind()) => {}
            Err(e) if is_socket_closed(e.kind()) => {
                error!("receive socket closed: {}", e);
                events.send_event(TransportEvent::SocketError(e.to_string()));
                break;
            }
            Err(e) => {
                // e.g. ICMP 'port unreachable' surfacing as connection reset on some platforms
                warn!("error receiving from socket: {}", e);
                events.send_event(TransportEvent::SocketError(e.to_string()));
            }
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_timeout_check) >= timeout_check_interval {
            last_timeout_check = now;
            let timeout_events = lock(&state).check_timeouts(now, config.reassembly_timeout);
            for event in timeout_events {
                events.send_event(event);
            }
        }
    }

    debug!("receive loop finished");
    events.send_event(TransportEvent::ReceiveLoopStopped);
}
