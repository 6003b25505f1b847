use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use transport::config::TransportConfig;

pub struct TransmissionConfig {
    /// The transmission loop sleeps for this long when there is nothing to send, and sends a
    ///  heartbeat after waking up. This bounds both the latency for queued items and the
    ///  heartbeat rate of an idle grabber.
    pub heartbeat_interval: Duration,

    /// Frames are produced at camera frame rate regardless of how fast they can be sent. If more
    ///  than this number of frames is waiting, the oldest ones are dropped.
    pub max_queued_frames: usize,

    /// Frames held back by the controller-requested send delay. If more are waiting, the oldest
    ///  ones are dropped.
    pub max_delayed_frames: usize,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        TransmissionConfig {
            heartbeat_interval: Duration::from_millis(5),
            max_queued_frames: 8,
            max_delayed_frames: 300,
        }
    }
}

impl TransmissionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must not be zero - an idle grabber would spin");
        }
        if self.max_queued_frames == 0 {
            bail!("at least one frame must fit into the outgoing queue");
        }
        if self.max_delayed_frames == 0 {
            bail!("at least one frame must fit into the delay queue");
        }
        Ok(())
    }
}

pub struct GrabberConfig {
    /// the address the grabber receives control messages on
    pub listen_addr: SocketAddr,
    pub transport: Arc<TransportConfig>,
    pub transmission: TransmissionConfig,

    /// Pause between stopping / closing a device and reopening / restarting it, giving the
    ///  hardware time to release its resources
    pub settle_delay: Duration,
}

impl GrabberConfig {
    pub fn new(listen_addr: SocketAddr) -> GrabberConfig {
        GrabberConfig {
            listen_addr,
            transport: Arc::new(TransportConfig::default_ipv4()),
            transmission: TransmissionConfig::default(),
            settle_delay: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport.validate()?;
        self.transmission.validate()?;
        if self.settle_delay > Duration::from_secs(5) {
            bail!("settle delay of {:?} would block the grabber's update loop for too long", self.settle_delay);
        }
        Ok(())
    }
}

pub struct ControllerConfig {
    /// where the grabber receives control messages
    pub grabber_addr: SocketAddr,
    /// The local address frames and feedback are received on. An unspecified IP address is
    ///  replaced by the address the controller uses to talk to the grabber when telling the
    ///  grabber where to reply.
    pub listen_addr: SocketAddr,
    pub transport: Arc<TransportConfig>,

    /// The frame buffer for this grabber is trimmed to this many frames on every update
    pub max_buffered_frames: usize,
}

impl ControllerConfig {
    pub fn new(grabber_addr: SocketAddr, listen_addr: SocketAddr) -> ControllerConfig {
        ControllerConfig {
            grabber_addr,
            listen_addr,
            transport: Arc::new(TransportConfig::default_ipv4()),
            max_buffered_frames: 300,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport.validate()?;
        if self.max_buffered_frames == 0 {
            bail!("the frame buffer must hold at least one frame");
        }
        if self.grabber_addr.ip().is_unspecified() {
            bail!("grabber address {:?} is not a concrete address", self.grabber_addr);
        }
        Ok(())
    }
}
