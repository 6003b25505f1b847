use std::slice::Iter;

use tracing::{debug, trace};
use transport::clock::nanos_to_millis;

use crate::frame::CompressedFrame;

/// An insertion-ordered sequence of frames from a single device.
///
/// Capture ids increase strictly along the sequence: a frame with the same capture id as the last
///  one is a duplicate, and a frame with a lower one arrived out of order. Both are rejected. This
///  keeps timestamps monotonic, which the nearest-timestamp lookup relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSequenceBuffer {
    frames: Vec<CompressedFrame>,
}

impl FrameSequenceBuffer {
    pub fn new() -> FrameSequenceBuffer {
        FrameSequenceBuffer::default()
    }

    /// Appends a frame, returning `false` if it was rejected as a duplicate of the last one or
    ///  because it is older than the last one
    pub fn add(&mut self, frame: CompressedFrame) -> bool {
        if let Some(last) = self.frames.last() {
            if frame.id_capture == last.id_capture {
                trace!("rejecting duplicate frame {}", frame.id_capture);
                return false;
            }
            if frame.id_capture < last.id_capture {
                debug!("rejecting frame {} that arrived after frame {}", frame.id_capture, last.id_capture);
                return false;
            }
        }
        self.frames.push(frame);
        true
    }

    /// A frame with a lower capture id but a later capture time than the last frame means the
    ///  device restarted its capture sequence, so the buffered frames can not be continued.
    pub fn starts_new_sequence(&self, frame: &CompressedFrame) -> bool {
        self.frames.last()
            .is_some_and(|last| frame.id_capture < last.id_capture && frame.after_capture_ts_ns > last.after_capture_ts_ns)
    }

    pub fn get(&self, index: usize) -> Option<&CompressedFrame> {
        self.frames.get(index)
    }

    pub fn first(&self) -> Option<&CompressedFrame> {
        self.frames.first()
    }

    pub fn last(&self) -> Option<&CompressedFrame> {
        self.frames.last()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, CompressedFrame> {
        self.frames.iter()
    }

    /// Removes the frames before `index`, keeping `index` and everything after it. Does nothing
    ///  if `index` is out of range.
    pub fn remove_until(&mut self, index: usize) {
        if index < self.frames.len() {
            self.frames.drain(..index);
        }
    }

    /// Removes the frame at `index` and everything after it. Does nothing if `index` is out of
    ///  range.
    pub fn remove_after(&mut self, index: usize) {
        if index < self.frames.len() {
            self.frames.truncate(index);
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Time between the first and the last frame
    pub fn duration_ms(&self) -> f64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => nanos_to_millis(last.received_ts_ns - first.received_ts_ns),
            _ => 0.0,
        }
    }

    /// Finds the frame whose (local) timestamp is closest to `target_ms`, scanning from the start
    ///  until the distance starts growing. Relies on timestamps being non-decreasing.
    pub fn closest_index_for_time(&self, target_ms: f64) -> Option<usize> {
        if self.frames.is_empty() {
            return None;
        }

        let mut previous_diff = f64::INFINITY;
        for (index, frame) in self.frames.iter().enumerate() {
            let diff = (target_ms - nanos_to_millis(frame.received_ts_ns)).abs();
            if diff > previous_diff {
                return Some(index - 1);
            }
            previous_diff = diff;
        }
        Some(self.frames.len() - 1)
    }

    /// Same as [FrameSequenceBuffer::closest_index_for_time], with the target given relative to
    ///  the first frame, e.g. for playback
    pub fn closest_index_for_elapsed(&self, elapsed_ms: f64) -> Option<usize> {
        let start_ms = nanos_to_millis(self.first()?.received_ts_ns);
        self.closest_index_for_time(start_ms + elapsed_ms)
    }
}

impl <'a> IntoIterator for &'a FrameSequenceBuffer {
    type Item = &'a CompressedFrame;
    type IntoIter = Iter<'a, CompressedFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
