use anyhow::bail;
use tracing::trace;

use crate::clock::now_nanos;

/// Estimates the offset between a remote peer's clock and the local clock from the sender
///  timestamps of heartbeat packets.
///
/// Every heartbeat contributes one sample `local receive time - remote send time` to a ring of
///  the most recent `N` samples, and the offset is the arithmetic mean of the whole ring. The ring
///  starts out filled with zeros, so the estimate is defined from the very first sample and
///  converges as real samples displace the seed values.
///
/// The estimate includes the one-way network latency, which is fine for converting remote capture
///  timestamps into 'when could this have arrived here' in the local time base.
pub struct ClockSynchronizer {
    samples: Vec<i64>,
    next: usize,
    cached_sum: i128,
    num_updates: u64,
}

impl ClockSynchronizer {
    pub fn new(sample_count: usize) -> anyhow::Result<ClockSynchronizer> {
        if sample_count == 0 {
            bail!("clock synchronizer needs at least one sample slot");
        }
        Ok(ClockSynchronizer {
            samples: vec![0; sample_count],
            next: 0,
            cached_sum: 0,
            num_updates: 0,
        })
    }

    pub fn update(&mut self, remote_send_timestamp_ns: i64) {
        self.update_at(now_nanos(), remote_send_timestamp_ns);
    }

    pub fn update_at(&mut self, local_now_ns: i64, remote_send_timestamp_ns: i64) {
        let diff = local_now_ns.saturating_sub(remote_send_timestamp_ns);

        let evicted = std::mem::replace(&mut self.samples[self.next], diff);
        self.cached_sum += diff as i128 - evicted as i128;
        self.next = (self.next + 1) % self.samples.len();
        self.num_updates += 1;

        trace!("clock sample {} ns, average offset now {} ns", diff, self.average_offset_ns());
    }

    pub fn average_offset_ns(&self) -> i64 {
        (self.cached_sum / self.samples.len() as i128) as i64
    }

    /// converts a timestamp from the remote time base into the local one
    pub fn correct(&self, remote_timestamp_ns: i64) -> i64 {
        remote_timestamp_ns.saturating_add(self.average_offset_ns())
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
