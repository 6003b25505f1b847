//! Turning a settings update into the sequence of device operations that gets the device from
//!  its current state into the requested one.
//!
//! Planning is a pure function of the previous settings, the proposed settings and the device's
//!  actual state, so it can be tested without a device. [crate::device_manager::DeviceManager]
//!  executes the plan against a backend.
//!
//! The general shape of a plan is 'tear down as far as necessary, pause, build up again':
//!
//! ```ascii
//!   StopReading  ->  CloseDevice  ->  Settle  ->  InitializeDevice  ->  OpenDevice  ->  StartReading
//!   (if reading)     (if opened)      (if either   (if not initialized   (if requested   (if requested
//!                                      happened)    or type changed)      and closed)     and stopped)
//! ```
//!
//! Changes that affect only what is done with captured data (data settings) never require a
//!  restart and are applied on every update.

use std::time::Duration;

use crate::device::{DeviceState, DeviceType};
use crate::settings::device_settings::DeviceSettings;

/// What changed between two device settings, as far as the device lifecycle is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsDiff {
    /// a different device type requires a new device object
    pub device_changed: bool,
    /// a different device of the same type requires closing and reopening
    pub device_id_changed: bool,
    /// settings that only take effect when the device starts reading
    pub camera_settings_changed: bool,
}

impl SettingsDiff {
    pub fn between(previous: &DeviceSettings, proposed: &DeviceSettings) -> SettingsDiff {
        SettingsDiff {
            device_changed: previous.config.device_type != proposed.config.device_type,
            device_id_changed: previous.config.device_id != proposed.config.device_id,
            camera_settings_changed: previous.config.camera_settings_differ(&proposed.config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    StopReading,
    CloseDevice,
    Settle(Duration),
    /// create a new device object for the given type, replacing the previous one
    InitializeDevice(DeviceType),
    /// replace the current color settings with the device type's defaults
    ResetColorSettings,
    ApplyDataSettings,
    OpenDevice { device_id: u32 },
    /// apply the current filters and color settings to a freshly opened device
    ApplyDeviceSettings,
    StartReading,
}

impl DeviceAction {
    /// true for the actions that change the device's open / reading state
    pub fn is_lifecycle(&self) -> bool {
        matches!(self,
            DeviceAction::StopReading
            | DeviceAction::CloseDevice
            | DeviceAction::Settle(_)
            | DeviceAction::OpenDevice { .. }
            | DeviceAction::StartReading
        )
    }
}

pub fn plan(previous: &DeviceSettings, proposed: &DeviceSettings, state: DeviceState, settle_delay: Duration) -> Vec<DeviceAction> {
    let diff = SettingsDiff::between(previous, proposed);
    let mut actions = Vec::new();

    let close = state.opened
        && (diff.device_changed || diff.device_id_changed || !proposed.actions.open_device);
    let stop = state.reading
        && (close || !proposed.actions.start_reading || diff.camera_settings_changed);

    if stop {
        actions.push(DeviceAction::StopReading);
    }
    if close {
        actions.push(DeviceAction::CloseDevice);
    }
    if stop || close {
        actions.push(DeviceAction::Settle(settle_delay));
    }

    if diff.device_changed {
        actions.push(DeviceAction::ResetColorSettings);
    }
    if !state.initialized || diff.device_changed {
        actions.push(DeviceAction::InitializeDevice(proposed.config.device_type));
    }

    actions.push(DeviceAction::ApplyDataSettings);

    let opened = state.opened && !close;
    let reading = state.reading && !stop;

    let open = proposed.actions.open_device && !opened;
    if open {
        actions.push(DeviceAction::OpenDevice { device_id: proposed.config.device_id });
        actions.push(DeviceAction::ApplyDeviceSettings);
    }

    if proposed.actions.start_reading && !reading && (opened || open) {
        actions.push(DeviceAction::StartReading);
    }

    actions
}
