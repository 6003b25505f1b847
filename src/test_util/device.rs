use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::device::{DeviceBackend, DeviceFactory, DeviceType};
use crate::settings::color::ColorSettings;
use crate::settings::device_settings::{DataConfig, DeviceConfig, DeviceMode};
use crate::settings::filters::FiltersSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Created(DeviceType),
    Open(u32),
    Close,
    StartReading(DeviceMode),
    StopReading,
    DataSettings,
    ColorSettings(ColorSettings),
    FiltersSettings,
}

/// Failures a [RecordingDevice] should simulate
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedFailures {
    pub create: bool,
    pub open: bool,
    pub start: bool,
}

type CallLog = Arc<Mutex<Vec<DeviceCall>>>;

/// A device that does nothing except recording the calls it receives
pub struct RecordingDevice {
    device_type: DeviceType,
    calls: CallLog,
    failures: Arc<Mutex<SimulatedFailures>>,
}

impl DeviceBackend for RecordingDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn open(&mut self, device_id: u32) -> anyhow::Result<()> {
        self.record(DeviceCall::Open(device_id));
        if self.failures().open {
            bail!("simulated open failure");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.record(DeviceCall::Close);
    }

    fn start_reading(&mut self, config: &DeviceConfig) -> anyhow::Result<()> {
        self.record(DeviceCall::StartReading(config.mode));
        if self.failures().start {
            bail!("simulated start failure");
        }
        Ok(())
    }

    fn stop_reading(&mut self) {
        self.record(DeviceCall::StopReading);
    }

    fn apply_data_settings(&mut self, _data: &DataConfig) {
        self.record(DeviceCall::DataSettings);
    }

    fn apply_color_settings(&mut self, color: &ColorSettings) {
        self.record(DeviceCall::ColorSettings(color.clone()));
    }

    fn apply_filters_settings(&mut self, _filters: &FiltersSettings) {
        self.record(DeviceCall::FiltersSettings);
    }
}

impl RecordingDevice {
    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn failures(&self) -> SimulatedFailures {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Creates [RecordingDevice]s that share a single call log, and allows tests to inspect that log
///  and to switch simulated failures on and off.
#[derive(Clone, Default)]
pub struct RecordingDeviceFactory {
    calls: CallLog,
    failures: Arc<Mutex<SimulatedFailures>>,
}

impl RecordingDeviceFactory {
    pub fn new() -> RecordingDeviceFactory {
        RecordingDeviceFactory::default()
    }

    pub fn set_failures(&self, failures: SimulatedFailures) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = failures;
    }

    /// Returns the calls recorded since the last call to this method
    pub fn take_calls(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl DeviceFactory for RecordingDeviceFactory {
    fn create(&self, device_type: DeviceType) -> anyhow::Result<Box<dyn DeviceBackend>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(DeviceCall::Created(device_type));
        if self.failures.lock().unwrap_or_else(|e| e.into_inner()).create {
            bail!("simulated failure creating {}", device_type.name());
        }

        Ok(Box::new(RecordingDevice {
            device_type,
            calls: self.calls.clone(),
            failures: self.failures.clone(),
        }))
    }
}
