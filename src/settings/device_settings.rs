use anyhow::anyhow;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport::buf_ext::BufExt;

use crate::device::DeviceType;

/// Device specific capture mode, i.e. a combination of color / depth resolutions and frame rate.
///  The numbering is defined by the device backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceMode(pub u16);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SynchronisationMode {
    #[default]
    Standalone = 0,
    Main = 1,
    Subordinate = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BodyTrackingOrientation {
    #[default]
    Default = 0,
    Flip180 = 1,
    Clockwise90 = 2,
    CounterClockwise90 = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BodyTrackingProcessingMode {
    #[default]
    Gpu = 0,
    Cpu = 1,
    GpuCuda = 2,
    GpuTensorRt = 3,
    GpuDirectMl = 4,
}

/// What the device captures and how it captures it. Any change to these fields except for the
///  device type and id requires the device to stop and restart reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_type: DeviceType,
    /// index of the device among those of its type connected to the grabber host
    pub device_id: u32,
    pub mode: DeviceMode,
    pub synchronize_color_and_depth: bool,
    pub delay_between_color_and_depth_usec: i32,
    pub synch_mode: SynchronisationMode,
    pub subordinate_delay_usec: i32,
    pub bt_enabled: bool,
    pub bt_gpu_id: i8,
    pub bt_orientation: BodyTrackingOrientation,
    pub bt_processing_mode: BodyTrackingProcessingMode,
    pub disable_led: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_type: DeviceType::default(),
            device_id: 0,
            mode: DeviceMode::default(),
            synchronize_color_and_depth: true,
            delay_between_color_and_depth_usec: 0,
            synch_mode: SynchronisationMode::default(),
            subordinate_delay_usec: 0,
            bt_enabled: false,
            bt_gpu_id: 0,
            bt_orientation: BodyTrackingOrientation::default(),
            bt_processing_mode: BodyTrackingProcessingMode::default(),
            disable_led: false,
        }
    }
}

impl DeviceConfig {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.device_type.into());
        buf.put_u32(self.device_id);
        buf.put_u16(self.mode.0);
        buf.put_u8(self.synchronize_color_and_depth.into());
        buf.put_i32(self.delay_between_color_and_depth_usec);
        buf.put_u8(self.synch_mode.into());
        buf.put_i32(self.subordinate_delay_usec);
        buf.put_u8(self.bt_enabled.into());
        buf.put_i8(self.bt_gpu_id);
        buf.put_u8(self.bt_orientation.into());
        buf.put_u8(self.bt_processing_mode.into());
        buf.put_u8(self.disable_led.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DeviceConfig> {
        let device_type = buf.read_u8()?;
        let device_type = DeviceType::try_from(device_type)
            .map_err(|_| anyhow!("invalid device type {}", device_type))?;
        let device_id = buf.read_u32()?;
        let mode = DeviceMode(buf.read_u16()?);
        let synchronize_color_and_depth = buf.read_bool()?;
        let delay_between_color_and_depth_usec = buf.read_i32()?;
        let synch_mode = SynchronisationMode::try_from(buf.read_u8()?)?;
        let subordinate_delay_usec = buf.read_i32()?;
        let bt_enabled = buf.read_bool()?;
        let bt_gpu_id = buf.read_i8()?;
        let bt_orientation = BodyTrackingOrientation::try_from(buf.read_u8()?)?;
        let bt_processing_mode = BodyTrackingProcessingMode::try_from(buf.read_u8()?)?;
        let disable_led = buf.read_bool()?;

        Ok(DeviceConfig {
            device_type,
            device_id,
            mode,
            synchronize_color_and_depth,
            delay_between_color_and_depth_usec,
            synch_mode,
            subordinate_delay_usec,
            bt_enabled,
            bt_gpu_id,
            bt_orientation,
            bt_processing_mode,
            disable_led,
        })
    }

    /// true if switching from `self` to `other` requires the device to restart reading
    pub fn camera_settings_differ(&self, other: &DeviceConfig) -> bool {
        self.mode != other.mode
            || self.synchronize_color_and_depth != other.synchronize_color_and_depth
            || self.delay_between_color_and_depth_usec != other.delay_between_color_and_depth_usec
            || self.subordinate_delay_usec != other.subordinate_delay_usec
            || self.synch_mode != other.synch_mode
            || self.bt_enabled != other.bt_enabled
            || self.bt_gpu_id != other.bt_gpu_id
            || self.bt_orientation != other.bt_orientation
            || self.bt_processing_mode != other.bt_processing_mode
            || self.disable_led != other.disable_led
    }
}

/// What the grabber should do with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionConfig {
    pub open_device: bool,
    pub start_reading: bool,
}

impl Default for ActionConfig {
    fn default() -> Self {
        ActionConfig {
            open_device: true,
            start_reading: true,
        }
    }
}

impl ActionConfig {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.open_device.into());
        buf.put_u8(self.start_reading.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ActionConfig> {
        Ok(ActionConfig {
            open_device: buf.read_bool()?,
            start_reading: buf.read_bool()?,
        })
    }
}

bitflags! {
    /// The data channels a grabber captures and sends
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CaptureFlags: u16 {
        const COLOR = 1 << 0;
        const DEPTH_SIZED_COLOR = 1 << 1;
        const DEPTH = 1 << 2;
        const INFRA = 1 << 3;
        const CLOUD = 1 << 4;
        const BODIES = 1 << 5;
        const BODIES_ID_MAP = 1 << 6;
        const IMU = 1 << 7;
        const CALIBRATION = 1 << 8;
    }
}

/// Selection and compression of the data sent per frame. Changing these never requires the
///  device to restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConfig {
    pub capture: CaptureFlags,
    /// JPEG quality of compressed color images, 0..=100
    pub jpeg_quality: u8,
    /// compress depth and infra images losslessly before sending
    pub compress_depth: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            capture: CaptureFlags::COLOR | CaptureFlags::DEPTH | CaptureFlags::CLOUD | CaptureFlags::CALIBRATION,
            jpeg_quality: 80,
            compress_depth: true,
        }
    }
}

impl DataConfig {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.capture.bits());
        buf.put_u8(self.jpeg_quality);
        buf.put_u8(self.compress_depth.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataConfig> {
        Ok(DataConfig {
            capture: CaptureFlags::from_bits_truncate(buf.read_u16()?),
            jpeg_quality: buf.read_u8()?.min(100),
            compress_depth: buf.read_bool()?,
        })
    }
}

/// The payload of an 'update device settings' message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSettings {
    pub config: DeviceConfig,
    pub actions: ActionConfig,
    pub data: DataConfig,
}

impl DeviceSettings {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.config.ser(buf);
        self.actions.ser(buf);
        self.data.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DeviceSettings> {
        Ok(DeviceSettings {
            config: DeviceConfig::deser(buf)?,
            actions: ActionConfig::deser(buf)?,
            data: DataConfig::deser(buf)?,
        })
    }
}
