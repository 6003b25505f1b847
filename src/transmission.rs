use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};
use transport::packet_header::MessageType;
use transport::send_pipeline::PacketSender;

use crate::config::TransmissionConfig;
use crate::frame::CompressedFrame;
use crate::messages::Feedback;

#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Feedback(Feedback),
    Frame(Arc<CompressedFrame>),
}

/// The queue between the code producing frames and feedback and the transmission loop sending
///  them. Holds at most `max_queued_frames` frames, dropping the oldest frame when a new one
///  arrives at a full queue. Feedback is never dropped.
pub struct OutgoingQueue {
    items: Mutex<VecDeque<OutgoingMessage>>,
    max_queued_frames: usize,
    frames_dropped: AtomicU64,
}

impl OutgoingQueue {
    pub fn new(max_queued_frames: usize) -> OutgoingQueue {
        OutgoingQueue {
            items: Mutex::new(VecDeque::new()),
            max_queued_frames,
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutgoingMessage>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_feedback(&self, feedback: Feedback) {
        self.lock().push_back(OutgoingMessage::Feedback(feedback));
    }

    pub fn push_frame(&self, frame: Arc<CompressedFrame>) {
        let mut items = self.lock();

        let num_frames = items.iter()
            .filter(|item| matches!(item, OutgoingMessage::Frame(_)))
            .count();
        if num_frames >= self.max_queued_frames {
            if let Some(oldest) = items.iter().position(|item| matches!(item, OutgoingMessage::Frame(_))) {
                if let Some(OutgoingMessage::Frame(dropped)) = items.remove(oldest) {
                    debug!("outgoing queue is full - dropping frame {}", dropped.id_capture);
                }
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        items.push_back(OutgoingMessage::Frame(frame));
    }

    pub fn pop(&self) -> Option<OutgoingMessage> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discards all queued frames, keeping feedback
    pub fn clear_frames(&self) {
        self.lock().retain(|item| matches!(item, OutgoingMessage::Feedback(_)));
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Counters updated by the transmission thread
#[derive(Debug)]
pub struct TransmissionStats {
    last_frame_id_sent: AtomicI64,
    last_send_duration_us: AtomicU64,
    frames_sent: AtomicU64,
    feedback_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl Default for TransmissionStats {
    fn default() -> Self {
        TransmissionStats {
            last_frame_id_sent: AtomicI64::new(-1),
            last_send_duration_us: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            feedback_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

impl TransmissionStats {
    /// -1 before the first frame was sent
    pub fn last_frame_id_sent(&self) -> i64 {
        self.last_frame_id_sent.load(Ordering::Relaxed)
    }

    pub fn last_send_duration(&self) -> Duration {
        Duration::from_micros(self.last_send_duration_us.load(Ordering::Relaxed))
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn feedback_sent(&self) -> u64 {
        self.feedback_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// A thread taking items from an [OutgoingQueue] and sending them to a single peer.
///
/// Every iteration ends with a heartbeat ('synchro') datagram, so the peer's clock estimate stays
///  fresh whether or not there is data to send. When the queue is empty, the thread sleeps for the
///  configured heartbeat interval before sending the heartbeat.
///
/// Stopping is cooperative: [TransmissionLoop::stop] clears a flag and joins the thread, which
///  sends remaining feedback before it exits. Frames still queued at that point are discarded.
pub struct TransmissionLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<TransmissionStats>,
}

impl TransmissionLoop {
    pub fn start(sender: PacketSender, queue: Arc<OutgoingQueue>, config: &TransmissionConfig) -> anyhow::Result<TransmissionLoop> {
        config.validate()?;

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(TransmissionStats::default());
        let heartbeat_interval = config.heartbeat_interval;

        let thread_name = match sender.peer_addr() {
            Some(addr) => format!("transmission-{}", addr.port()),
            None => "transmission".to_string(),
        };
        info!("starting transmission to {:?}", sender.peer_addr());

        let handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || transmission_loop(sender, queue, running, stats, heartbeat_interval))?
        };

        Ok(TransmissionLoop {
            running,
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> &TransmissionStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("transmission thread panicked");
            }
            debug!("transmission stopped");
        }
    }
}

impl Drop for TransmissionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn transmission_loop(mut sender: PacketSender, queue: Arc<OutgoingQueue>, running: Arc<AtomicBool>, stats: Arc<TransmissionStats>, heartbeat_interval: Duration) {
    // grow-only: cleared before every frame, never shrunk
    let mut frame_buf = BytesMut::new();

    while running.load(Ordering::Acquire) {
        match queue.pop() {
            None => thread::sleep(heartbeat_interval),
            Some(item) => send_item(&mut sender, item, &mut frame_buf, &stats),
        }

        if let Err(e) = sender.send_synchro() {
            trace!("sending heartbeat failed: {}", e);
            stats.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    while let Some(item) = queue.pop() {
        if let OutgoingMessage::Feedback(_) = item {
            send_item(&mut sender, item, &mut frame_buf, &stats);
        }
    }
}

fn send_item(sender: &mut PacketSender, item: OutgoingMessage, frame_buf: &mut BytesMut, stats: &TransmissionStats) {
    match item {
        OutgoingMessage::Feedback(feedback) => {
            let mut buf = BytesMut::with_capacity(2);
            feedback.ser(&mut buf);
            match sender.send_message(MessageType::Feedback, &buf) {
                Ok(_) => {
                    trace!("sent feedback {:?}", feedback);
                    stats.feedback_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("sending feedback {:?} failed: {}", feedback, e);
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        OutgoingMessage::Frame(frame) => {
            let start = Instant::now();
            frame_buf.clear();
            frame.ser(frame_buf);

            match sender.send_message(MessageType::CompressedFrameData, &frame_buf[..]) {
                Ok(_) => {
                    let duration_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
                    trace!("sent frame {} with {} bytes in {} us", frame.id_capture, frame_buf.len(), duration_us);
                    stats.last_frame_id_sent.store(frame.id_capture, Ordering::Relaxed);
                    stats.last_send_duration_us.store(duration_us, Ordering::Relaxed);
                    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("sending frame {} failed: {}", frame.id_capture, e);
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
