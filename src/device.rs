#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::settings::color::ColorSettings;
use crate::settings::device_settings::{DataConfig, DeviceConfig};
use crate::settings::filters::FiltersSettings;

/// The camera models a grabber can drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    #[default]
    AzureKinect = 0,
    FemtoBolt = 1,
    FemtoMegaEthernet = 2,
    FemtoMegaUsb = 3,
    Gemini215 = 4,
}

/// Which table of color control ranges and defaults a device type uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorProfile {
    Kinect,
    Orbbec,
}

impl DeviceType {
    pub fn color_profile(self) -> ColorProfile {
        match self {
            DeviceType::AzureKinect => ColorProfile::Kinect,
            DeviceType::FemtoBolt | DeviceType::FemtoMegaEthernet | DeviceType::FemtoMegaUsb | DeviceType::Gemini215 => ColorProfile::Orbbec,
        }
    }

    /// Body tracking runs on the depth stream of time-of-flight sensors only
    pub fn supports_body_tracking(self) -> bool {
        !matches!(self, DeviceType::Gemini215)
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::AzureKinect => "Azure Kinect",
            DeviceType::FemtoBolt => "Femto Bolt",
            DeviceType::FemtoMegaEthernet => "Femto Mega (Ethernet)",
            DeviceType::FemtoMegaUsb => "Femto Mega (USB)",
            DeviceType::Gemini215 => "Gemini 215",
        }
    }
}

/// What is known about the physical device at a given point in time. This always reflects what
///  actually succeeded, not what was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub initialized: bool,
    pub opened: bool,
    pub reading: bool,
}

/// The boundary to a vendor SDK. Implementations wrap the SDK calls for one device type; capturing
///  and compressing frames happens behind this interface and is not part of this crate.
#[cfg_attr(test, automock)]
pub trait DeviceBackend: Send {
    fn device_type(&self) -> DeviceType;

    fn open(&mut self, device_id: u32) -> anyhow::Result<()>;
    fn close(&mut self);

    fn start_reading(&mut self, config: &DeviceConfig) -> anyhow::Result<()>;
    fn stop_reading(&mut self);

    fn apply_data_settings(&mut self, data: &DataConfig);
    fn apply_color_settings(&mut self, color: &ColorSettings);
    fn apply_filters_settings(&mut self, filters: &FiltersSettings);
}

/// Creates the backend for a device type, e.g. by loading the matching vendor SDK
pub trait DeviceFactory: Send {
    fn create(&self, device_type: DeviceType) -> anyhow::Result<Box<dyn DeviceBackend>>;
}

impl <F> DeviceFactory for F
where F: Fn(DeviceType) -> anyhow::Result<Box<dyn DeviceBackend>> + Send
{
    fn create(&self, device_type: DeviceType) -> anyhow::Result<Box<dyn DeviceBackend>> {
        self(device_type)
    }
}
