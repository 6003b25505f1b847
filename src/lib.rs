//! Streaming captured frames from depth camera grabbers to a controller over UDP.
//!
//! A *grabber* process drives one depth camera. A *controller* connects to any number of grabbers,
//!  configures their cameras and receives their frames:
//!
//! ```ascii
//!  controller                                     grabber
//!  ----------                                     -------
//!  RemoteGrabber  -- init connection ---------->  Grabber
//!                 -- settings, commands ------->    |- DeviceManager -> DeviceBackend (vendor SDK)
//!                 <- feedback ------------------    |
//!                 <- compressed frames ---------    |- TransmissionLoop
//!                 <- synchro (heartbeats) ------
//!  FrameSequenceBuffer (frames in local time)
//! ```
//!
//! The datagram protocol (fragmentation, reassembly, clock offset estimation) lives in the
//!  `transport` crate. This crate defines the message payloads and the behavior on both ends.
//!
//! Neither end spawns a thread driving the application logic: the host calls `update()`
//!  regularly, and everything that happened since the last call is returned as events. Receiving
//!  and sending happen in background threads owned by the respective objects and stopped when
//!  they are dropped.
//!
//! Capturing frames and compressing their channels is the device backend's job and not part of
//!  this crate, as is interpreting the channel contents on the controller side.

pub mod config;
pub mod controller;
pub mod device;
pub mod device_manager;
pub mod frame;
pub mod frame_buffer;
pub mod grabber;
pub mod messages;
pub mod reconciliation;
pub mod settings;
pub mod test_util;
pub mod transmission;
pub mod video;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
