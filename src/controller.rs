use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use transport::events::TransportEvent;
use transport::packet_header::MessageType;
use transport::receive_loop::{ReceiveBatch, ReceiveStats, Receiver};
use transport::reassembly::CompletedMessage;
use transport::send_pipeline::{PacketSender, SendStats};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::frame::CompressedFrame;
use crate::frame_buffer::FrameSequenceBuffer;
use crate::messages::{Command, Feedback, InitConnection};
use crate::settings::color::ColorSettings;
use crate::settings::delay::DelaySettings;
use crate::settings::device_settings::DeviceSettings;
use crate::settings::filters::FiltersSettings;
use crate::video::{DeviceRecording, Transform, VideoRecording, IDENTITY};

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    FrameReceived { id_capture: i64 },
    /// the frame had the same capture id as the previous one and was not stored
    DuplicateFrame { id_capture: i64 },
    /// the frame was older than the last stored one, e.g. because it completed reassembly late
    OutOfOrderFrame { id_capture: i64 },
    Feedback(Feedback),
    InvalidMessage { message_type: MessageType, reason: String },
}

/// The controller's end of the connection to a single grabber. Settings and commands are sent
///  synchronously from the calling thread; frames and feedback are received in the background
///  and picked up by [RemoteGrabber::update].
pub struct RemoteGrabber {
    config: ControllerConfig,
    session: Uuid,
    receiver: Receiver,
    sender: PacketSender,
    frames: FrameSequenceBuffer,
    transform: Transform,
    clock_offset_ns: i64,
}

impl RemoteGrabber {
    /// Binds the local receive socket and sends 'init connection' to the grabber
    pub fn connect(config: ControllerConfig) -> anyhow::Result<RemoteGrabber> {
        config.validate()?;

        let receiver = Receiver::bind(config.listen_addr, config.transport.clone())?;
        let unspecified_local = SocketAddr::new(unspecified_like(config.grabber_addr.ip()), 0);
        let sender = PacketSender::connect(unspecified_local, config.grabber_addr, config.transport.max_fragment_len())?;

        let mut result = RemoteGrabber {
            config,
            session: Uuid::new_v4(),
            receiver,
            sender,
            frames: FrameSequenceBuffer::new(),
            transform: IDENTITY,
            clock_offset_ns: 0,
        };
        result.send_init()?;
        Ok(result)
    }

    /// Where the grabber should send frames: the receive socket's port, at the address this
    ///  controller uses to reach the grabber if the receive socket is not bound to a specific one
    pub fn reply_addr(&self) -> SocketAddr {
        let local = self.receiver.local_addr();
        if !local.ip().is_unspecified() {
            return local;
        }
        match self.sender.local_addr() {
            Some(sender_addr) => SocketAddr::new(sender_addr.ip(), local.port()),
            None => local,
        }
    }

    pub fn grabber_addr(&self) -> SocketAddr {
        self.config.grabber_addr
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Sends 'init connection' again, e.g. after the grabber restarted
    pub fn send_init(&mut self) -> anyhow::Result<()> {
        let init = InitConnection {
            session: self.session,
            reply_addr: self.reply_addr(),
            max_datagram_size: u16::try_from(self.config.transport.payload_size_inside_udp).unwrap_or(u16::MAX),
        };
        info!("initializing connection to grabber {:?}, replies to {:?}", self.config.grabber_addr, init.reply_addr);
        self.send(MessageType::InitConnection, |buf| init.ser(buf))
    }

    pub fn send_device_settings(&mut self, settings: &DeviceSettings) -> anyhow::Result<()> {
        self.send(MessageType::UpdateDeviceSettings, |buf| settings.ser(buf))
    }

    pub fn send_color_settings(&mut self, settings: &ColorSettings) -> anyhow::Result<()> {
        self.send(MessageType::UpdateColorSettings, |buf| settings.ser(buf))
    }

    pub fn send_filters_settings(&mut self, settings: &FiltersSettings) -> anyhow::Result<()> {
        self.send(MessageType::UpdateFiltersSettings, |buf| settings.ser(buf))
    }

    pub fn send_delay_settings(&mut self, settings: &DelaySettings) -> anyhow::Result<()> {
        self.send(MessageType::UpdateDelaySettings, |buf| settings.ser(buf))
    }

    pub fn send_command(&mut self, command: Command) -> anyhow::Result<()> {
        info!("sending {:?} to grabber {:?}", command, self.config.grabber_addr);
        self.send(MessageType::Command, |buf| command.ser(buf))
    }

    fn send(&mut self, message_type: MessageType, ser: impl FnOnce(&mut BytesMut)) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        ser(&mut buf);
        let message_id = self.sender.send_message(message_type, &buf)?;
        debug!("sent {:?} #{} with {} bytes", message_type, message_id, buf.len());
        Ok(())
    }

    /// Picks up frames and feedback received since the last call. Frame timestamps are converted
    ///  into the local clock once, when the frame is stored. Does nothing if the receive thread
    ///  holds the lock.
    pub fn update(&mut self) -> Vec<ControllerEvent> {
        let Some(batch) = self.receiver.try_drain() else {
            return Vec::new();
        };
        self.clock_offset_ns = batch.clock_offset_ns;

        let events = self.handle_batch(batch);

        if self.frames.len() > self.config.max_buffered_frames {
            self.frames.remove_until(self.frames.len() - self.config.max_buffered_frames);
        }
        events
    }

    fn handle_batch(&mut self, batch: ReceiveBatch) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        for message in &batch.messages {
            if let Some(event) = self.handle_message(message, &batch) {
                events.push(event);
            }
        }
        events
    }

    fn handle_message(&mut self, message: &CompletedMessage, batch: &ReceiveBatch) -> Option<ControllerEvent> {
        let message_type = message.message_type;
        let mut payload = message.payload.clone();

        match message_type {
            MessageType::CompressedFrameData => {
                let mut frame = match CompressedFrame::deser(&mut payload) {
                    Ok(frame) => frame,
                    Err(e) => return Some(invalid(message_type, e)),
                };
                frame.received_ts_ns = batch.correct(frame.after_capture_ts_ns);

                let id_capture = frame.id_capture;
                if self.frames.starts_new_sequence(&frame) {
                    info!("grabber restarted its capture sequence at frame {}, discarding {} buffered frames", id_capture, self.frames.len());
                    self.frames.clear();
                }

                let last_id = self.frames.last().map(|f| f.id_capture);
                if self.frames.add(frame) {
                    Some(ControllerEvent::FrameReceived { id_capture })
                }
                else if last_id == Some(id_capture) {
                    Some(ControllerEvent::DuplicateFrame { id_capture })
                }
                else {
                    Some(ControllerEvent::OutOfOrderFrame { id_capture })
                }
            }
            MessageType::Feedback => {
                match Feedback::deser(&mut payload) {
                    Ok(feedback) => {
                        debug!("feedback from grabber: {:?}", feedback);
                        Some(ControllerEvent::Feedback(feedback))
                    }
                    Err(e) => Some(invalid(message_type, e)),
                }
            }
            _ => {
                debug!("ignoring {:?} message - not for a controller", message_type);
                None
            }
        }
    }

    pub fn frames(&self) -> &FrameSequenceBuffer {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameSequenceBuffer {
        &mut self.frames
    }

    /// The calibration transform stored with this grabber's frames in recordings
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Offset from the grabber's clock to the local one, as of the last update
    pub fn clock_offset_ns(&self) -> i64 {
        self.clock_offset_ns
    }

    pub fn reception_stats(&self) -> ReceiveStats {
        self.receiver.stats()
    }

    pub fn send_stats(&self) -> &SendStats {
        self.sender.stats()
    }

    pub fn subscribe_transport_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.receiver.subscribe()
    }
}

fn invalid(message_type: MessageType, e: anyhow::Error) -> ControllerEvent {
    warn!("invalid {:?} message: {}", message_type, e);
    ControllerEvent::InvalidMessage { message_type, reason: e.to_string() }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

/// Owns the connections to all grabbers of a setup. Grabbers are addressed by the index they
///  were added with.
#[derive(Default)]
pub struct Controller {
    grabbers: Vec<RemoteGrabber>,
}

impl Controller {
    pub fn new() -> Controller {
        Controller::default()
    }

    /// Connects to a grabber, returning its index
    pub fn add_grabber(&mut self, config: ControllerConfig) -> anyhow::Result<usize> {
        self.grabbers.push(RemoteGrabber::connect(config)?);
        Ok(self.grabbers.len() - 1)
    }

    pub fn num_grabbers(&self) -> usize {
        self.grabbers.len()
    }

    pub fn grabber(&self, index: usize) -> Option<&RemoteGrabber> {
        self.grabbers.get(index)
    }

    pub fn grabber_mut(&mut self, index: usize) -> Option<&mut RemoteGrabber> {
        self.grabbers.get_mut(index)
    }

    pub fn grabbers(&self) -> impl Iterator<Item = &RemoteGrabber> {
        self.grabbers.iter()
    }

    /// Updates all grabbers, tagging each event with the index of the grabber it came from
    pub fn update(&mut self) -> Vec<(usize, ControllerEvent)> {
        self.grabbers.iter_mut()
            .enumerate()
            .flat_map(|(index, g)| g.update().into_iter().map(move |e| (index, e)))
            .collect()
    }

    /// Sends a command to every grabber, continuing after failures. Returns the first failure.
    pub fn send_command_to_all(&mut self, command: Command) -> anyhow::Result<()> {
        let mut result = Ok(());
        for grabber in &mut self.grabbers {
            if let Err(e) = grabber.send_command(command) {
                warn!("sending {:?} to {:?} failed: {}", command, grabber.grabber_addr(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// A snapshot of all grabbers' frame buffers
    pub fn record(&self) -> VideoRecording {
        VideoRecording {
            devices: self.grabbers.iter()
                .map(|g| DeviceRecording {
                    transform: g.transform,
                    frames: g.frames.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FeedbackKind;
    use crate::test_util::frame::frame_with_data;
    use crate::test_util::socket::wait_until;
    use std::sync::Arc;
    use std::time::Duration;
    use transport::config::TransportConfig;

    /// stands in for a grabber: a receive loop plus a sender that is connected once the
    ///  controller's 'init connection' arrived
    struct FakeGrabber {
        receiver: Receiver,
        sender: Option<PacketSender>,
    }

    impl FakeGrabber {
        fn new() -> FakeGrabber {
            FakeGrabber {
                receiver: Receiver::bind("127.0.0.1:0".parse().unwrap(), Arc::new(TransportConfig::default_ipv4())).unwrap(),
                sender: None,
            }
        }

        fn receive(&mut self, message_type: MessageType) -> CompletedMessage {
            let mut result = None;
            assert!(wait_until(Duration::from_secs(2), || {
                if let Some(batch) = self.receiver.try_drain() {
                    result = result.take().or(batch.messages.into_iter().find(|m| m.message_type == message_type));
                }
                result.is_some()
            }));
            result.unwrap()
        }

        fn accept(&mut self) -> InitConnection {
            let message = self.receive(MessageType::InitConnection);
            let init = InitConnection::deser(&mut message.payload.clone()).unwrap();
            self.sender = Some(PacketSender::connect("127.0.0.1:0".parse().unwrap(), init.reply_addr, 1400).unwrap());
            init
        }

        fn send(&mut self, message_type: MessageType, ser: impl FnOnce(&mut BytesMut)) {
            let mut buf = BytesMut::new();
            ser(&mut buf);
            self.sender.as_mut().unwrap().send_message(message_type, &buf).unwrap();
        }
    }

    fn connect(grabber: &FakeGrabber, max_buffered_frames: usize) -> RemoteGrabber {
        let config = ControllerConfig {
            max_buffered_frames,
            ..ControllerConfig::new(grabber.receiver.local_addr(), "0.0.0.0:0".parse().unwrap())
        };
        RemoteGrabber::connect(config).unwrap()
    }

    fn update_until(remote: &mut RemoteGrabber, count: usize) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        wait_until(Duration::from_secs(2), || {
            events.extend(remote.update());
            events.len() >= count
        });
        events
    }

    #[test]
    fn test_init_connection() {
        let mut grabber = FakeGrabber::new();
        let remote = connect(&grabber, 10);

        let init = grabber.accept();
        assert_eq!(init.session, remote.session());
        assert_eq!(init.reply_addr, remote.reply_addr());
        assert_eq!(init.reply_addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(init.max_datagram_size, 1472);
    }

    #[test]
    fn test_settings_and_commands() {
        let mut grabber = FakeGrabber::new();
        let mut remote = connect(&grabber, 10);
        grabber.accept();

        let settings = DeviceSettings::default();
        remote.send_device_settings(&settings).unwrap();
        let message = grabber.receive(MessageType::UpdateDeviceSettings);
        assert_eq!(DeviceSettings::deser(&mut message.payload.clone()).unwrap(), settings);

        let filters = FiltersSettings { depth_mask: vec![1; 100_000], ..FiltersSettings::default() };
        remote.send_filters_settings(&filters).unwrap();
        let message = grabber.receive(MessageType::UpdateFiltersSettings);
        assert_eq!(FiltersSettings::deser(&mut message.payload.clone()).unwrap(), filters);

        remote.send_command(Command::Quit).unwrap();
        let message = grabber.receive(MessageType::Command);
        assert_eq!(message.payload.as_ref(), &[Command::Quit as u8]);
    }

    #[test]
    fn test_late_frame_and_restarted_sequence() {
        let mut grabber = FakeGrabber::new();
        let mut remote = connect(&grabber, 10);
        grabber.accept();

        for (id, ts_ms) in [(0, 0), (1, 33), (2, 66), (1, 33), (0, 1_000), (1, 1_033)] {
            let frame = frame_with_data(id, 1_000_000 * ts_ms, 100);
            grabber.send(MessageType::CompressedFrameData, |buf| frame.ser(buf));
        }

        let events = update_until(&mut remote, 6);
        assert_eq!(events, vec![
            ControllerEvent::FrameReceived { id_capture: 0 },
            ControllerEvent::FrameReceived { id_capture: 1 },
            ControllerEvent::FrameReceived { id_capture: 2 },
            ControllerEvent::OutOfOrderFrame { id_capture: 1 },
            ControllerEvent::FrameReceived { id_capture: 0 },
            ControllerEvent::FrameReceived { id_capture: 1 },
        ]);

        let ids = remote.frames().iter().map(|f| f.id_capture).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(remote.frames().first().unwrap().after_capture_ts_ns, 1_000_000_000);
    }

    #[test]
    fn test_frames_and_feedback() {
        let mut grabber = FakeGrabber::new();
        let mut remote = connect(&grabber, 3);
        grabber.accept();

        for id in 0..5 {
            let frame = frame_with_data(id, 1_000_000 * id, 5_000);
            grabber.send(MessageType::CompressedFrameData, |buf| frame.ser(buf));
        }
        let duplicate = frame_with_data(4, 0, 10);
        grabber.send(MessageType::CompressedFrameData, |buf| duplicate.ser(buf));
        let feedback = Feedback { received_message_type: MessageType::Command, kind: FeedbackKind::Quit };
        grabber.send(MessageType::Feedback, |buf| feedback.ser(buf));

        let events = update_until(&mut remote, 7);
        assert_eq!(events, vec![
            ControllerEvent::FrameReceived { id_capture: 0 },
            ControllerEvent::FrameReceived { id_capture: 1 },
            ControllerEvent::FrameReceived { id_capture: 2 },
            ControllerEvent::FrameReceived { id_capture: 3 },
            ControllerEvent::FrameReceived { id_capture: 4 },
            ControllerEvent::DuplicateFrame { id_capture: 4 },
            ControllerEvent::Feedback(feedback),
        ]);

        assert_eq!(remote.frames().len(), 3);
        assert_eq!(remote.frames().first().unwrap().id_capture, 2);
        let frame = remote.frames().last().unwrap();
        assert_eq!(frame.received_ts_ns, frame.after_capture_ts_ns + remote.clock_offset_ns());
    }

    #[test]
    fn test_controller_record() {
        let mut grabbers = vec![FakeGrabber::new(), FakeGrabber::new()];
        let mut controller = Controller::new();
        for g in &grabbers {
            controller.add_grabber(ControllerConfig::new(g.receiver.local_addr(), "0.0.0.0:0".parse().unwrap())).unwrap();
        }
        assert_eq!(controller.num_grabbers(), 2);

        for g in &mut grabbers {
            g.accept();
        }
        let frame = frame_with_data(1, 0, 100);
        grabbers[1].send(MessageType::CompressedFrameData, |buf| frame.ser(buf));

        let mut events = Vec::new();
        assert!(wait_until(Duration::from_secs(2), || {
            events.extend(controller.update());
            !events.is_empty()
        }));
        assert_eq!(events, vec![(1, ControllerEvent::FrameReceived { id_capture: 1 })]);

        controller.send_command_to_all(Command::Disconnect).unwrap();
        for g in &mut grabbers {
            g.receive(MessageType::Command);
        }

        let recording = controller.record();
        assert_eq!(recording.num_devices(), 2);
        assert!(recording.devices[0].frames.is_empty());
        assert_eq!(recording.devices[1].frames.len(), 1);
        assert!(controller.grabber(2).is_none());
    }
}
