use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use transport::clock::now_nanos;
use transport::events::TransportEvent;
use transport::packet_header::{MessageType, PacketHeader};
use transport::receive_loop::{ReceiveStats, Receiver};
use transport::reassembly::CompletedMessage;
use transport::send_pipeline::PacketSender;
use uuid::Uuid;

use crate::config::GrabberConfig;
use crate::device::{DeviceFactory, DeviceState};
use crate::device_manager::{DeviceEvent, DeviceManager};
use crate::frame::CompressedFrame;
use crate::messages::{Command, Feedback, FeedbackKind, InitConnection};
use crate::settings::color::ColorSettings;
use crate::settings::delay::DelaySettings;
use crate::settings::device_settings::DeviceSettings;
use crate::settings::filters::FiltersSettings;
use crate::transmission::{OutgoingQueue, TransmissionLoop, TransmissionStats};

#[derive(Debug, Clone, PartialEq)]
pub enum GrabberEvent {
    /// a controller (re)initialized the connection
    Connected { session: Uuid, reply_addr: SocketAddr },
    /// The host decides what to do about commands. The connection itself is already handled
    ///  for 'disconnect'.
    Command(Command),
    Device(DeviceEvent),
    InvalidMessage { message_type: MessageType, reason: String },
}

/// The messages a grabber understands, decoded
#[derive(Debug, Clone, PartialEq)]
enum Incoming {
    Init(InitConnection),
    Command(Command),
    DeviceSettings(DeviceSettings),
    Color(ColorSettings),
    Filters(FiltersSettings),
    Delay(DelaySettings),
}

impl Incoming {
    fn decode(message_type: MessageType, mut payload: Bytes) -> anyhow::Result<Option<Incoming>> {
        let buf = &mut payload;
        let result = match message_type {
            MessageType::InitConnection => Incoming::Init(InitConnection::deser(buf)?),
            MessageType::Command => Incoming::Command(Command::deser(buf)?),
            MessageType::UpdateDeviceSettings => Incoming::DeviceSettings(DeviceSettings::deser(buf)?),
            MessageType::UpdateColorSettings => Incoming::Color(ColorSettings::deser(buf)?),
            MessageType::UpdateFiltersSettings => Incoming::Filters(FiltersSettings::deser(buf)?),
            MessageType::UpdateDelaySettings => Incoming::Delay(DelaySettings::deser(buf)?),
            MessageType::Synchro | MessageType::Feedback | MessageType::CompressedFrameData => return Ok(None),
        };
        Ok(Some(result))
    }
}

/// The grabber side of a connection: receives control messages from a controller, keeps the
///  device in sync with the requested settings and sends frames and feedback back.
///
/// There is no background thread driving this: the host calls [Grabber::update] regularly, e.g.
///  once per captured frame, and [Grabber::send_frame] for every frame it wants to send.
pub struct Grabber {
    config: GrabberConfig,
    receiver: Receiver,
    queue: Arc<OutgoingQueue>,
    transmission: Option<TransmissionLoop>,
    session: Option<Uuid>,
    device_manager: DeviceManager,
    delay: DelaySettings,
    delayed_frames: VecDeque<Arc<CompressedFrame>>,
    delayed_frames_dropped: u64,
}

impl Grabber {
    pub fn start(config: GrabberConfig, factory: Box<dyn DeviceFactory>) -> anyhow::Result<Grabber> {
        config.validate()?;

        let receiver = Receiver::bind(config.listen_addr, config.transport.clone())?;
        info!("grabber listening on {:?}", receiver.local_addr());

        Ok(Grabber {
            queue: Arc::new(OutgoingQueue::new(config.transmission.max_queued_frames)),
            device_manager: DeviceManager::new(factory, config.settle_delay),
            config,
            receiver,
            transmission: None,
            session: None,
            delay: DelaySettings::default(),
            delayed_frames: VecDeque::new(),
            delayed_frames_dropped: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receiver.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.transmission.is_some()
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_manager.state()
    }

    pub fn device_manager(&self) -> &DeviceManager {
        &self.device_manager
    }

    pub fn delay(&self) -> DelaySettings {
        self.delay
    }

    pub fn transmission_stats(&self) -> Option<&TransmissionStats> {
        self.transmission.as_ref().map(|t| t.stats())
    }

    /// frames dropped because the outgoing queue or the delay queue was full
    pub fn frames_dropped(&self) -> u64 {
        self.queue.frames_dropped() + self.delayed_frames_dropped
    }

    pub fn reception_stats(&self) -> ReceiveStats {
        self.receiver.stats()
    }

    pub fn subscribe_transport_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.receiver.subscribe()
    }

    /// Processes the control messages received since the last call. If the receive thread holds
    ///  the lock on received messages, this returns right away and the messages are processed
    ///  on the next call.
    pub fn update(&mut self) -> Vec<GrabberEvent> {
        self.release_delayed_frames(now_nanos());

        match self.receiver.try_drain() {
            Some(batch) => self.handle_messages(batch.messages),
            None => Vec::new(),
        }
    }

    /// Queues a frame for sending, honoring the configured delay. Frames are discarded while no
    ///  controller is connected, returning `false`.
    pub fn send_frame(&mut self, frame: CompressedFrame) -> bool {
        if !self.is_connected() {
            return false;
        }

        let now = now_nanos();
        if self.delayed_frames.len() >= self.config.transmission.max_delayed_frames {
            if let Some(oldest) = self.delayed_frames.pop_front() {
                debug!("delay queue full, dropping frame {}", oldest.id_capture);
                self.delayed_frames_dropped += 1;
            }
        }
        self.delayed_frames.push_back(Arc::new(frame));
        self.release_delayed_frames(now);
        true
    }

    /// Stops sending, closes the device and stops receiving. Also called on drop.
    pub fn stop(&mut self) {
        self.disconnect();
        self.device_manager.shutdown();
        self.receiver.stop();
    }

    fn release_delayed_frames(&mut self, now_ns: i64) {
        let delay_ns = self.delay.delay_ns();
        while let Some(frame) = self.delayed_frames.front() {
            if frame.after_capture_ts_ns.saturating_add(delay_ns) > now_ns {
                break;
            }
            if let Some(frame) = self.delayed_frames.pop_front() {
                self.queue.push_frame(frame);
            }
        }
    }

    fn handle_messages(&mut self, messages: Vec<CompletedMessage>) -> Vec<GrabberEvent> {
        let mut events = Vec::new();

        // settings of the same kind overwrite each other: only the latest is applied
        let mut device_settings = None;
        let mut color = None;
        let mut filters = None;

        for message in messages {
            let message_type = message.message_type;
            let incoming = match Incoming::decode(message_type, message.payload) {
                Ok(Some(incoming)) => incoming,
                Ok(None) => {
                    debug!("ignoring {:?} message - not for a grabber", message_type);
                    continue;
                }
                Err(e) => {
                    warn!("invalid {:?} message: {}", message_type, e);
                    events.push(GrabberEvent::InvalidMessage { message_type, reason: e.to_string() });
                    continue;
                }
            };

            match incoming {
                Incoming::Init(init) => {
                    match self.connect(&init) {
                        Ok(()) => {
                            events.push(GrabberEvent::Connected { session: init.session, reply_addr: init.reply_addr });
                            self.acknowledge(message_type, FeedbackKind::MessageReceived);
                        }
                        Err(e) => {
                            warn!("initializing connection to {:?} failed: {}", init.reply_addr, e);
                            events.push(GrabberEvent::InvalidMessage { message_type, reason: e.to_string() });
                        }
                    }
                }
                Incoming::Command(command) => {
                    info!("received command {:?}", command);
                    self.acknowledge(message_type, command.into());
                    if command == Command::Disconnect {
                        self.disconnect();
                    }
                    events.push(GrabberEvent::Command(command));
                }
                Incoming::DeviceSettings(s) => {
                    device_settings = Some(s);
                    self.acknowledge(message_type, FeedbackKind::MessageReceived);
                }
                Incoming::Color(s) => {
                    color = Some(s);
                    self.acknowledge(message_type, FeedbackKind::MessageReceived);
                }
                Incoming::Filters(s) => {
                    filters = Some(s);
                    self.acknowledge(message_type, FeedbackKind::MessageReceived);
                }
                Incoming::Delay(s) => {
                    debug!("frame delay is now {} ms", s.delay_ms);
                    self.delay = s;
                    self.acknowledge(message_type, FeedbackKind::MessageReceived);
                }
            }
        }

        if let Some(s) = device_settings {
            self.device_manager.update_device_settings(s);
        }
        if let Some(s) = color {
            self.device_manager.update_color_settings(s);
        }
        if let Some(s) = filters {
            self.device_manager.update_filters_settings(s);
        }

        events.extend(self.device_manager.drain_events()
            .into_iter()
            .map(GrabberEvent::Device));
        events
    }

    fn acknowledge(&self, received_message_type: MessageType, kind: FeedbackKind) {
        if self.is_connected() {
            self.queue.push_feedback(Feedback { received_message_type, kind });
        }
    }

    fn connect(&mut self, init: &InitConnection) -> anyhow::Result<()> {
        let datagram_size = usize::from(init.max_datagram_size)
            .min(self.config.transport.payload_size_inside_udp);
        if datagram_size <= PacketHeader::SERIALIZED_LEN {
            bail!("datagram size {} leaves no room for payload", init.max_datagram_size);
        }

        if self.session.is_some_and(|s| s != init.session) {
            info!("controller started a new session {}", init.session);
            self.receiver.reset_reassembly();
        }

        self.disconnect();

        let unspecified = match init.reply_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let sender = PacketSender::connect(
            SocketAddr::new(unspecified, 0),
            init.reply_addr,
            datagram_size - PacketHeader::SERIALIZED_LEN,
        )?;
        self.transmission = Some(TransmissionLoop::start(sender, self.queue.clone(), &self.config.transmission)?);
        self.session = Some(init.session);

        info!("connected to controller at {:?}", init.reply_addr);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut transmission) = self.transmission.take() {
            transmission.stop();
            info!("disconnected from controller");
        }
        self.delayed_frames.clear();
        self.queue.clear_frames();
    }
}

impl Drop for Grabber {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::device_settings::DeviceMode;
    use crate::test_util::device::{DeviceCall, RecordingDeviceFactory};
    use crate::test_util::frame::frame_at;
    use crate::test_util::socket::wait_until;
    use bytes::BytesMut;
    use std::time::Duration;
    use transport::config::TransportConfig;

    struct Fixture {
        grabber: Grabber,
        factory: RecordingDeviceFactory,
        /// stands in for the controller's receive loop
        controller: Receiver,
    }

    fn fixture() -> Fixture {
        let factory = RecordingDeviceFactory::new();
        let config = GrabberConfig {
            settle_delay: Duration::ZERO,
            ..GrabberConfig::new("127.0.0.1:0".parse().unwrap())
        };
        let grabber = Grabber::start(config, Box::new(factory.clone())).unwrap();
        let controller = Receiver::bind("127.0.0.1:0".parse().unwrap(), Arc::new(TransportConfig::default_ipv4())).unwrap();
        Fixture { grabber, factory, controller }
    }

    fn message(message_type: MessageType, ser: impl FnOnce(&mut BytesMut)) -> CompletedMessage {
        let mut buf = BytesMut::new();
        ser(&mut buf);
        CompletedMessage {
            message_type,
            message_id: 0,
            payload: buf.freeze(),
            first_fragment_sent_ns: 0,
            first_fragment_received_ns: 0,
        }
    }

    fn init(reply_addr: SocketAddr, session: Uuid) -> CompletedMessage {
        let init = InitConnection { session, reply_addr, max_datagram_size: 1472 };
        message(MessageType::InitConnection, |buf| init.ser(buf))
    }

    fn device_settings(mode: u16) -> CompletedMessage {
        let mut settings = DeviceSettings::default();
        settings.config.mode = DeviceMode(mode);
        message(MessageType::UpdateDeviceSettings, |buf| settings.ser(buf))
    }

    fn command(command: Command) -> CompletedMessage {
        message(MessageType::Command, |buf| command.ser(buf))
    }

    /// collects feedback arriving at the controller until `expected` many arrived
    fn await_feedback(controller: &Receiver, expected: usize) -> Vec<Feedback> {
        let mut result = Vec::new();
        wait_until(Duration::from_secs(2), || {
            if let Some(batch) = controller.try_drain() {
                for m in batch.messages {
                    if m.message_type == MessageType::Feedback {
                        result.push(Feedback::deser(&mut m.payload.clone()).unwrap());
                    }
                }
            }
            result.len() >= expected
        });
        result
    }

    #[test]
    fn test_init_connection() {
        let Fixture { mut grabber, controller, .. } = fixture();
        assert!(!grabber.is_connected());
        let session = Uuid::new_v4();

        let events = grabber.handle_messages(vec![init(controller.local_addr(), session)]);
        assert_eq!(events, vec![GrabberEvent::Connected { session, reply_addr: controller.local_addr() }]);
        assert!(grabber.is_connected());
        assert_eq!(grabber.session(), Some(session));

        assert_eq!(await_feedback(&controller, 1), vec![
            Feedback { received_message_type: MessageType::InitConnection, kind: FeedbackKind::MessageReceived },
        ]);
        assert!(wait_until(Duration::from_secs(2), || controller.stats().synchros_received > 0));
    }

    #[test]
    fn test_invalid_init() {
        let Fixture { mut grabber, controller, .. } = fixture();
        let init = InitConnection { session: Uuid::new_v4(), reply_addr: controller.local_addr(), max_datagram_size: 41 };
        let events = grabber.handle_messages(vec![message(MessageType::InitConnection, |buf| init.ser(buf))]);
        assert!(matches!(events[..], [GrabberEvent::InvalidMessage { message_type: MessageType::InitConnection, .. }]));
        assert!(!grabber.is_connected());
    }

    #[test]
    fn test_device_settings_are_coalesced() {
        let Fixture { mut grabber, factory, controller } = fixture();

        let events = grabber.handle_messages(vec![
            init(controller.local_addr(), Uuid::new_v4()),
            device_settings(1),
            device_settings(2),
            device_settings(3),
        ]);
        assert_eq!(events.last(), Some(&GrabberEvent::Device(DeviceEvent::StateChanged(DeviceState { initialized: true, opened: true, reading: true }))));

        let starts = factory.take_calls().into_iter()
            .filter(|c| matches!(c, DeviceCall::StartReading(_)))
            .collect::<Vec<_>>();
        assert_eq!(starts, vec![DeviceCall::StartReading(DeviceMode(3))]);

        // every message is acknowledged, even the ones that were superseded
        assert_eq!(await_feedback(&controller, 4).len(), 4);
    }

    #[test]
    fn test_commands() {
        let Fixture { mut grabber, controller, .. } = fixture();
        grabber.handle_messages(vec![init(controller.local_addr(), Uuid::new_v4())]);

        let events = grabber.handle_messages(vec![command(Command::UpdateDeviceList), command(Command::Disconnect)]);
        assert_eq!(events, vec![GrabberEvent::Command(Command::UpdateDeviceList), GrabberEvent::Command(Command::Disconnect)]);
        assert!(!grabber.is_connected());

        let kinds = await_feedback(&controller, 3).into_iter().map(|f| f.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![FeedbackKind::MessageReceived, FeedbackKind::UpdateDeviceList, FeedbackKind::Disconnect]);

        assert!(!grabber.send_frame(frame_at(1, 0)));
    }

    #[test]
    fn test_invalid_settings() {
        let Fixture { mut grabber, controller, .. } = fixture();
        grabber.handle_messages(vec![init(controller.local_addr(), Uuid::new_v4())]);

        let events = grabber.handle_messages(vec![message(MessageType::UpdateColorSettings, |buf| buf.extend_from_slice(&[1, 2, 3]))]);
        assert!(matches!(events[..], [GrabberEvent::InvalidMessage { message_type: MessageType::UpdateColorSettings, .. }]));
        assert!(grabber.handle_messages(vec![message(MessageType::Synchro, |_| {})]).is_empty());
    }

    #[test]
    fn test_color_settings_before_device_settings() {
        let Fixture { mut grabber, factory, controller } = fixture();
        let color = ColorSettings { brightness: 99, ..ColorSettings::default() };

        grabber.handle_messages(vec![
            init(controller.local_addr(), Uuid::new_v4()),
            message(MessageType::UpdateColorSettings, |buf| color.ser(buf)),
        ]);
        assert!(factory.take_calls().is_empty());

        grabber.handle_messages(vec![device_settings(1)]);
        assert!(factory.take_calls().contains(&DeviceCall::ColorSettings(color)));
    }

    #[test]
    fn test_delayed_frames() {
        let Fixture { mut grabber, controller, .. } = fixture();
        grabber.handle_messages(vec![
            init(controller.local_addr(), Uuid::new_v4()),
            message(MessageType::UpdateDelaySettings, |buf| DelaySettings { delay_ms: 60_000 }.ser(buf)),
        ]);
        assert_eq!(grabber.delay().delay_ms, 60_000);

        let mut frame = frame_at(5, 0);
        frame.after_capture_ts_ns = now_nanos();
        assert!(grabber.send_frame(frame));
        assert_eq!(grabber.delayed_frames.len(), 1);

        grabber.release_delayed_frames(now_nanos() + 61_000_000_000);
        assert!(grabber.delayed_frames.is_empty());
        assert!(wait_until(Duration::from_secs(2), || grabber.transmission_stats().is_some_and(|s| s.last_frame_id_sent() == 5)));
    }

    #[test]
    fn test_delay_queue_is_bounded() {
        let factory = RecordingDeviceFactory::new();
        let mut config = GrabberConfig::new("127.0.0.1:0".parse().unwrap());
        config.transmission.max_delayed_frames = 3;
        let mut grabber = Grabber::start(config, Box::new(factory)).unwrap();
        let controller = Receiver::bind("127.0.0.1:0".parse().unwrap(), Arc::new(TransportConfig::default_ipv4())).unwrap();
        grabber.handle_messages(vec![
            init(controller.local_addr(), Uuid::new_v4()),
            message(MessageType::UpdateDelaySettings, |buf| DelaySettings { delay_ms: 60_000 }.ser(buf)),
        ]);

        for id in 0..5 {
            let mut frame = frame_at(id, 0);
            frame.after_capture_ts_ns = now_nanos();
            assert!(grabber.send_frame(frame));
        }

        let ids = grabber.delayed_frames.iter().map(|f| f.id_capture).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(grabber.frames_dropped(), 2);
    }

    #[test]
    fn test_update_over_network() {
        let Fixture { mut grabber, factory, controller } = fixture();
        let mut sender = PacketSender::connect("127.0.0.1:0".parse().unwrap(), grabber.local_addr(), 1400).unwrap();

        let mut buf = BytesMut::new();
        InitConnection { session: Uuid::new_v4(), reply_addr: controller.local_addr(), max_datagram_size: 1472 }.ser(&mut buf);
        sender.send_message(MessageType::InitConnection, &buf).unwrap();
        buf.clear();
        DeviceSettings::default().ser(&mut buf);
        sender.send_message(MessageType::UpdateDeviceSettings, &buf).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            grabber.update();
            grabber.device_state().reading
        }));
        assert!(grabber.is_connected());
        assert!(factory.take_calls().contains(&DeviceCall::Created(Default::default())));
    }
}
