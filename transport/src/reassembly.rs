use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bit_set::BitSet;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::clock::now_nanos;
use crate::packet_header::{MessageType, PacketHeader};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A fully reassembled message, handed over to the caller by [MessageReassembler::take_completed]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub message_type: MessageType,
    pub message_id: i32,
    pub payload: Bytes,
    /// sender timestamp from the header of the first fragment that arrived
    pub first_fragment_sent_ns: i64,
    /// local time at which the first fragment arrived
    pub first_fragment_received_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// fragment was stored, the message is still incomplete
    Accepted,
    /// fragment was stored and completed the message
    Completed,
    /// fragment index was received before, nothing changed
    Duplicate,
    /// the message this fragment belongs to was completed or discarded already
    Retired,
    Rejected(&'static str),
}

struct PendingMessage {
    total_payload_bytes: usize,
    packet_count: u32,
    received_bytes: usize,
    fragments_received: BitSet,
    buffer: Vec<u8>,
    first_fragment_sent_ns: i64,
    first_fragment_received_ns: i64,
    last_fragment_received_at: Instant,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        self.fragments_received.count() == self.packet_count.safe_cast()
    }
}

/// Counters for observability, accumulated over the lifetime of a reassembler
#[derive(Debug, Clone, Default)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub timed_out: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub bytes_received: u64,
    recent_outcomes: VecDeque<bool>,
}

impl ReassemblyStats {
    const RECENT_WINDOW: usize = 100;

    fn record_finished(&mut self, success: bool) {
        if self.recent_outcomes.len() == Self::RECENT_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
    }

    /// Percentage of the last 100 finished messages that completed rather than timing out,
    ///  or `None` if no message finished yet
    pub fn success_percentage(&self) -> Option<f64> {
        if self.recent_outcomes.is_empty() {
            return None;
        }
        let num_success = self.recent_outcomes.iter().filter(|&&s| s).count();
        Some(100.0 * num_success as f64 / self.recent_outcomes.len() as f64)
    }

    pub fn merge(&mut self, other: &ReassemblyStats) {
        self.completed += other.completed;
        self.timed_out += other.timed_out;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.bytes_received += other.bytes_received;
        for &o in &other.recent_outcomes {
            self.record_finished(o);
        }
    }
}

/// Reassembles the messages of a single message type from their fragments.
///
/// Each message id goes through `pending -> {completed, timed out}`. Fragments may arrive in any
///  order since each carries its byte offset, and duplicates are ignored. Once a message is
///  finished, its id is 'retired': fragments arriving for it later are dropped, so a straggler can
///  not resurrect a message that was discarded after a timeout.
pub struct MessageReassembler {
    message_type: MessageType,
    max_message_size: usize,
    retired_id_memory: usize,
    pending: FxHashMap<i32, PendingMessage>,
    completed: BTreeMap<i32, CompletedMessage>,
    retired: FxHashSet<i32>,
    retired_order: VecDeque<i32>,
    stats: ReassemblyStats,
}

impl MessageReassembler {
    pub fn new(message_type: MessageType, max_message_size: usize, retired_id_memory: usize) -> MessageReassembler {
        MessageReassembler {
            message_type,
            max_message_size,
            retired_id_memory,
            pending: Default::default(),
            completed: Default::default(),
            retired: Default::default(),
            retired_order: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn on_fragment(&mut self, header: &PacketHeader, fragment: &[u8], now: Instant) -> FragmentOutcome {
        let outcome = self.do_on_fragment(header, fragment, now);
        match outcome {
            FragmentOutcome::Duplicate => self.stats.duplicates += 1,
            FragmentOutcome::Rejected(reason) => {
                debug!("{:?} #{}: dropping fragment {}/{}: {}", self.message_type, header.message_id, header.packet_index, header.packet_count, reason);
                self.stats.rejected += 1;
            }
            _ => {}
        }
        outcome
    }

    fn do_on_fragment(&mut self, header: &PacketHeader, fragment: &[u8], now: Instant) -> FragmentOutcome {
        let message_id = header.message_id;
        if self.retired.contains(&message_id) {
            trace!("{:?} #{}: fragment for retired message", self.message_type, message_id);
            return FragmentOutcome::Retired;
        }

        if header.packet_index >= header.packet_count {
            return FragmentOutcome::Rejected("packet index out of range");
        }
        let max_message_size: u64 = self.max_message_size.safe_cast();
        if header.total_payload_bytes > max_message_size {
            return FragmentOutcome::Rejected("message exceeds maximum message size");
        }
        // every fragment except that of an empty message carries at least one byte
        if u64::from(header.packet_count) > header.total_payload_bytes.max(1) {
            return FragmentOutcome::Rejected("more fragments than payload bytes");
        }
        let total_payload_bytes: usize = header.total_payload_bytes.prechecked_cast();
        let offset = match usize::try_from(header.fragment_offset) {
            Ok(offset) if offset.saturating_add(fragment.len()) <= total_payload_bytes => offset,
            _ => return FragmentOutcome::Rejected("fragment exceeds total payload"),
        };

        let pending = self.pending.entry(message_id).or_insert_with(|| {
            trace!("{:?} #{}: starting reassembly of {} bytes in {} fragments", header.message_type, message_id, total_payload_bytes, header.packet_count);
            PendingMessage {
                total_payload_bytes,
                packet_count: header.packet_count,
                received_bytes: 0,
                fragments_received: BitSet::with_capacity(header.packet_count.safe_cast()),
                buffer: vec![0; total_payload_bytes],
                first_fragment_sent_ns: header.sender_timestamp_ns,
                first_fragment_received_ns: now_nanos(),
                last_fragment_received_at: now,
            }
        });

        if pending.total_payload_bytes != total_payload_bytes || pending.packet_count != header.packet_count {
            return FragmentOutcome::Rejected("header contradicts earlier fragments of the same message");
        }
        let packet_index: usize = header.packet_index.safe_cast();
        if pending.fragments_received.contains(packet_index) {
            return FragmentOutcome::Duplicate;
        }
        if pending.received_bytes + fragment.len() > pending.total_payload_bytes {
            return FragmentOutcome::Rejected("fragments overlap");
        }
        pending.fragments_received.insert(packet_index);

        pending.buffer[offset..offset + fragment.len()].copy_from_slice(fragment);
        pending.received_bytes += fragment.len();
        pending.last_fragment_received_at = now;
        self.stats.bytes_received += fragment.len() as u64;

        if !pending.is_complete() {
            return FragmentOutcome::Accepted;
        }

        let Some(pending) = self.pending.remove(&message_id) else {
            return FragmentOutcome::Accepted;
        };
        self.retire(message_id);

        if pending.received_bytes != pending.total_payload_bytes {
            warn!("{:?} #{}: all fragments received, but only {} of {} bytes - discarding", self.message_type, message_id, pending.received_bytes, pending.total_payload_bytes);
            self.stats.record_finished(false);
            return FragmentOutcome::Rejected("fragment sizes do not add up to total payload");
        }

        trace!("{:?} #{}: message complete", self.message_type, message_id);
        self.stats.completed += 1;
        self.stats.record_finished(true);
        self.completed.insert(message_id, CompletedMessage {
            message_type: self.message_type,
            message_id,
            payload: Bytes::from(pending.buffer),
            first_fragment_sent_ns: pending.first_fragment_sent_ns,
            first_fragment_received_ns: pending.first_fragment_received_ns,
        });
        FragmentOutcome::Completed
    }

    /// true iff all fragments of the message were received and it was not taken yet
    pub fn is_complete(&self, message_id: i32) -> bool {
        self.completed.contains_key(&message_id)
    }

    pub fn is_pending(&self, message_id: i32) -> bool {
        self.pending.contains_key(&message_id)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns and removes the completed message with the lowest id
    pub fn take_completed(&mut self) -> Option<CompletedMessage> {
        self.completed.pop_first().map(|(_, m)| m)
    }

    /// Discards all pending messages that did not receive a fragment for longer than `max_age`,
    ///  returning the number of discarded messages
    pub fn check_timeouts(&mut self, now: Instant, max_age: Duration) -> usize {
        let timed_out = self.pending.iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_fragment_received_at) > max_age)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        for &message_id in &timed_out {
            if let Some(p) = self.pending.remove(&message_id) {
                debug!("{:?} #{}: timed out with {} of {} fragments", self.message_type, message_id, p.fragments_received.count(), p.packet_count);
            }
            self.retire(message_id);
            self.stats.timed_out += 1;
            self.stats.record_finished(false);
        }
        timed_out.len()
    }

    /// Forgets all state, e.g. because the peer restarted and will reuse message ids
    pub fn reset(&mut self) {
        self.pending.clear();
        self.completed.clear();
        self.retired.clear();
        self.retired_order.clear();
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    fn retire(&mut self, message_id: i32) {
        if self.retired.insert(message_id) {
            self.retired_order.push_back(message_id);
        }
        while self.retired_order.len() > self.retired_id_memory {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}
