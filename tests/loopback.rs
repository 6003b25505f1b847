use std::thread;
use std::time::{Duration, Instant};

use depthcast::config::{ControllerConfig, GrabberConfig};
use depthcast::controller::{ControllerEvent, RemoteGrabber};
use depthcast::device::DeviceState;
use depthcast::frame::CompressedFrame;
use depthcast::grabber::{Grabber, GrabberEvent};
use depthcast::messages::{Command, Feedback, FeedbackKind};
use depthcast::settings::color::ColorSettings;
use depthcast::settings::device_settings::{DeviceMode, DeviceSettings};
use depthcast::test_util::device::{DeviceCall, RecordingDeviceFactory};
use depthcast::test_util::frame::frame_with_data;
use tracing::Level;
use transport::clock::now_nanos;
use transport::packet_header::MessageType;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const TIMEOUT: Duration = Duration::from_secs(5);

struct Setup {
    grabber: Grabber,
    factory: RecordingDeviceFactory,
    remote: RemoteGrabber,
    grabber_events: Vec<GrabberEvent>,
    controller_events: Vec<ControllerEvent>,
}

impl Setup {
    fn new() -> Setup {
        let factory = RecordingDeviceFactory::new();
        let grabber_config = GrabberConfig {
            settle_delay: Duration::from_millis(1),
            ..GrabberConfig::new("127.0.0.1:0".parse().unwrap())
        };
        let grabber = Grabber::start(grabber_config, Box::new(factory.clone())).unwrap();

        let remote = RemoteGrabber::connect(ControllerConfig::new(grabber.local_addr(), "127.0.0.1:0".parse().unwrap())).unwrap();

        Setup {
            grabber,
            factory,
            remote,
            grabber_events: Vec::new(),
            controller_events: Vec::new(),
        }
    }

    /// updates both ends until `condition` holds
    fn run_until(&mut self, mut condition: impl FnMut(&Setup) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let grabber_events = self.grabber.update();
            self.grabber_events.extend(grabber_events);
            let controller_events = self.remote.update();
            self.controller_events.extend(controller_events);

            if condition(self) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out - grabber events {:?}, controller events {:?}", self.grabber_events, self.controller_events);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn has_feedback(&self, received_message_type: MessageType, kind: FeedbackKind) -> bool {
        self.controller_events.contains(&ControllerEvent::Feedback(Feedback { received_message_type, kind }))
    }
}

#[test]
fn test_connect_configure_stream() {
    let mut setup = Setup::new();

    setup.run_until(|s| s.grabber.is_connected());
    assert_eq!(setup.grabber.session(), Some(setup.remote.session()));
    setup.run_until(|s| s.has_feedback(MessageType::InitConnection, FeedbackKind::MessageReceived));

    let mut settings = DeviceSettings::default();
    settings.config.mode = DeviceMode(4);
    setup.remote.send_device_settings(&settings).unwrap();
    setup.run_until(|s| s.grabber.device_state().reading);
    setup.run_until(|s| s.has_feedback(MessageType::UpdateDeviceSettings, FeedbackKind::MessageReceived));
    assert!(setup.factory.take_calls().contains(&DeviceCall::StartReading(DeviceMode(4))));

    let color = ColorSettings { sharpness: 3, ..ColorSettings::default() };
    setup.remote.send_color_settings(&color).unwrap();
    setup.run_until(|s| s.grabber.device_manager().color_settings() == &color);
    assert_eq!(setup.factory.take_calls(), vec![DeviceCall::ColorSettings(color)]);

    let sent = (0..3)
        .map(|id| frame_with_data(id, now_nanos(), 20_000))
        .collect::<Vec<_>>();
    for frame in &sent {
        assert!(setup.grabber.send_frame(frame.clone()));
        thread::sleep(Duration::from_millis(5));
    }
    setup.run_until(|s| s.remote.frames().len() == 3);

    let received = setup.remote.frames().iter().cloned().collect::<Vec<_>>();
    for (sent, received) in sent.iter().zip(&received) {
        assert_eq!(&CompressedFrame { received_ts_ns: 0, ..received.clone() }, sent);
        assert!((received.received_ts_ns - received.after_capture_ts_ns).abs() < 1_000_000_000);
    }
    assert!(setup.remote.reception_stats().synchros_received > 0);
}

#[test]
fn test_disconnect_and_reconnect() {
    let mut setup = Setup::new();
    setup.run_until(|s| s.grabber.is_connected());

    setup.remote.send_command(Command::Disconnect).unwrap();
    setup.run_until(|s| s.grabber_events.contains(&GrabberEvent::Command(Command::Disconnect)));
    assert!(!setup.grabber.is_connected());
    setup.run_until(|s| s.has_feedback(MessageType::Command, FeedbackKind::Disconnect));

    assert!(!setup.grabber.send_frame(frame_with_data(1, now_nanos(), 10)));

    setup.remote.send_init().unwrap();
    setup.run_until(|s| s.grabber.is_connected());
    assert!(setup.grabber.send_frame(frame_with_data(1, now_nanos(), 10)));
    setup.run_until(|s| s.remote.frames().len() == 1);
    assert_eq!(setup.grabber.device_state(), DeviceState::default());
}
