use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::{DeviceBackend, DeviceFactory, DeviceState, DeviceType};
use crate::reconciliation::{plan, DeviceAction};
use crate::settings::color::ColorSettings;
use crate::settings::device_settings::DeviceSettings;
use crate::settings::filters::FiltersSettings;

/// Things that happen to the device while settings are applied, for the host to observe
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// the device type changed, and the color settings were replaced by the new type's defaults
    ColorSettingsReset(ColorSettings),
    InitializationFailed { device_type: DeviceType, reason: String },
    OpenFailed { device_id: u32, reason: String },
    StartFailed { reason: String },
    StateChanged(DeviceState),
}

/// Owns the device backend and keeps it in sync with the most recently requested settings.
///
/// The state it reports always reflects what actually succeeded. Failures are reported as events
///  and leave the manager usable: the next settings update plans from the actual state and
///  retries whatever is still missing.
pub struct DeviceManager {
    factory: Box<dyn DeviceFactory>,
    device: Option<Box<dyn DeviceBackend>>,
    settings: DeviceSettings,
    color: ColorSettings,
    filters: FiltersSettings,
    state: DeviceState,
    settle_delay: Duration,
    events: Vec<DeviceEvent>,
}

impl DeviceManager {
    pub fn new(factory: Box<dyn DeviceFactory>, settle_delay: Duration) -> DeviceManager {
        DeviceManager {
            factory,
            device: None,
            settings: DeviceSettings::default(),
            color: ColorSettings::default(),
            filters: FiltersSettings::default(),
            state: DeviceState::default(),
            settle_delay,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn color_settings(&self) -> &ColorSettings {
        &self.color
    }

    pub fn filters_settings(&self) -> &FiltersSettings {
        &self.filters
    }

    /// Takes the events that occurred since the last call
    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Brings the device in line with `proposed`, returning the actions that were executed. The
    ///  proposed settings become the current ones even if some actions failed.
    pub fn update_device_settings(&mut self, proposed: DeviceSettings) -> Vec<DeviceAction> {
        let actions = plan(&self.settings, &proposed, self.state, self.settle_delay);
        debug!("applying device settings: {:?}", actions);

        let state_before = self.state;
        let mut executed = Vec::with_capacity(actions.len());
        for action in actions {
            executed.push(action);
            if !self.execute(action, &proposed) {
                break;
            }
        }

        self.settings = proposed;
        if self.state != state_before {
            info!("device state changed from {:?} to {:?}", state_before, self.state);
            self.events.push(DeviceEvent::StateChanged(self.state));
        }
        executed
    }

    /// Applies the color settings right away if the device is opened, otherwise they are applied
    ///  when it is opened next. Values are clamped to the current device type's ranges.
    pub fn update_color_settings(&mut self, color: ColorSettings) {
        self.color = color.clamped_for(self.settings.config.device_type);
        if let (true, Some(device)) = (self.state.opened, self.device.as_mut()) {
            debug!("applying color settings");
            device.apply_color_settings(&self.color);
        }
    }

    pub fn update_filters_settings(&mut self, filters: FiltersSettings) {
        self.filters = filters;
        if let (true, Some(device)) = (self.state.opened, self.device.as_mut()) {
            debug!("applying filters settings");
            device.apply_filters_settings(&self.filters);
        }
    }

    /// Stops and closes the device, e.g. before the grabber shuts down
    pub fn shutdown(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if self.state.reading {
                device.stop_reading();
            }
            if self.state.opened {
                device.close();
            }
        }
        self.state.reading = false;
        self.state.opened = false;
    }

    /// Returns `false` if the action failed in a way that makes the remaining actions pointless
    fn execute(&mut self, action: DeviceAction, proposed: &DeviceSettings) -> bool {
        match action {
            DeviceAction::StopReading => {
                if let Some(device) = self.device.as_mut() {
                    device.stop_reading();
                }
                self.state.reading = false;
            }
            DeviceAction::CloseDevice => {
                if let Some(device) = self.device.as_mut() {
                    device.close();
                }
                self.state.opened = false;
            }
            DeviceAction::Settle(delay) => {
                thread::sleep(delay);
            }
            DeviceAction::InitializeDevice(device_type) => {
                self.device = None;
                self.state = DeviceState::default();
                match self.factory.create(device_type) {
                    Ok(device) => {
                        info!("initialized {} device", device_type.name());
                        self.device = Some(device);
                        self.state.initialized = true;
                    }
                    Err(e) => {
                        error!("initializing {} device failed: {}", device_type.name(), e);
                        self.events.push(DeviceEvent::InitializationFailed { device_type, reason: e.to_string() });
                        return false;
                    }
                }
            }
            DeviceAction::ResetColorSettings => {
                self.color = ColorSettings::defaults_for(proposed.config.device_type);
                self.events.push(DeviceEvent::ColorSettingsReset(self.color.clone()));
            }
            DeviceAction::ApplyDataSettings => {
                if let Some(device) = self.device.as_mut() {
                    device.apply_data_settings(&proposed.data);
                }
            }
            DeviceAction::OpenDevice { device_id } => {
                let Some(device) = self.device.as_mut() else {
                    return false;
                };
                if let Err(e) = device.open(device_id) {
                    warn!("opening device {} failed: {}", device_id, e);
                    self.events.push(DeviceEvent::OpenFailed { device_id, reason: e.to_string() });
                    return false;
                }
                info!("opened device {}", device_id);
                self.state.opened = true;
            }
            DeviceAction::ApplyDeviceSettings => {
                if let Some(device) = self.device.as_mut() {
                    device.apply_filters_settings(&self.filters);
                    device.apply_color_settings(&self.color);
                }
            }
            DeviceAction::StartReading => {
                let Some(device) = self.device.as_mut() else {
                    return false;
                };
                if let Err(e) = device.start_reading(&proposed.config) {
                    warn!("starting to read failed: {}", e);
                    self.events.push(DeviceEvent::StartFailed { reason: e.to_string() });
                    return false;
                }
                info!("device started reading in mode {:?}", proposed.config.mode);
                self.state.reading = true;
            }
        }
        true
    }
}
