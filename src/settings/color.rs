use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport::buf_ext::BufExt;

use crate::device::{ColorProfile, DeviceType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PowerlineFrequency {
    Disabled = 0,
    Hz50 = 1,
    #[default]
    Hz60 = 2,
}

/// The individually adjustable controls of a color camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorControl {
    Exposure,
    AutoExposure,
    WhiteBalance,
    AutoWhiteBalance,
    Brightness,
    Contrast,
    Sharpness,
    Saturation,
    Gain,
    PowerlineFrequency,
    BacklightCompensation,
    Hdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRange {
    pub available: bool,
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub default: i32,
}

const fn range(available: bool, min: i32, max: i32, step: i32, default: i32) -> ControlRange {
    ControlRange { available, min, max, step, default }
}

impl ColorControl {
    pub fn range(self, device_type: DeviceType) -> ControlRange {
        use ColorControl::*;

        match device_type.color_profile() {
            ColorProfile::Kinect => match self {
                Exposure              => range(true,  500,  133330, 1,  33330),
                AutoExposure          => range(true,  0,    1,      1,  1),
                WhiteBalance          => range(true,  2500, 12500,  10, 4500),
                AutoWhiteBalance      => range(true,  0,    1,      1,  1),
                Brightness            => range(true,  0,    255,    1,  128),
                Contrast              => range(true,  0,    10,     1,  5),
                Sharpness             => range(true,  0,    4,      1,  2),
                Saturation            => range(true,  0,    63,     1,  32),
                Gain                  => range(true,  0,    255,    1,  128),
                PowerlineFrequency    => range(true,  1,    2,      1,  2),
                BacklightCompensation => range(true,  0,    1,      1,  0),
                Hdr                   => range(false, 0,    0,      0,  0),
            },
            ColorProfile::Orbbec => match self {
                Exposure              => range(true,  1,    300,    1,   200),
                AutoExposure          => range(true,  0,    1,      1,   1),
                WhiteBalance          => range(true,  2000, 11000,  100, 6500),
                AutoWhiteBalance      => range(true,  0,    1,      1,   1),
                Brightness            => range(true,  1,    20,     1,   10),
                Contrast              => range(true,  1,    99,     1,   50),
                Sharpness             => range(true,  1,    40,     1,   24),
                Saturation            => range(true,  1,    255,    1,   64),
                Gain                  => range(true,  0,    80,     1,   0),
                PowerlineFrequency    => range(true,  0,    2,      1,   2),
                BacklightCompensation => range(false, 0,    0,      0,   0),
                Hdr                   => range(true,  0,    1,      1,   1),
            },
        }
    }
}

/// Color camera controls. Valid ranges and defaults depend on the device type, see
///  [ColorControl::range].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorSettings {
    pub exposure_time: i32,
    pub auto_exposure: bool,
    pub white_balance: i32,
    pub auto_white_balance: bool,
    pub brightness: i32,
    pub contrast: i32,
    pub sharpness: i32,
    pub saturation: i32,
    pub gain: i32,
    pub powerline_frequency: PowerlineFrequency,
    pub backlight_compensation: bool,
    pub hdr: bool,
}

impl Default for ColorSettings {
    fn default() -> Self {
        ColorSettings::defaults_for(DeviceType::default())
    }
}

impl ColorSettings {
    pub fn defaults_for(device_type: DeviceType) -> ColorSettings {
        let default = |control: ColorControl| control.range(device_type).default;

        ColorSettings {
            exposure_time: default(ColorControl::Exposure),
            auto_exposure: default(ColorControl::AutoExposure) != 0,
            white_balance: default(ColorControl::WhiteBalance),
            auto_white_balance: default(ColorControl::AutoWhiteBalance) != 0,
            brightness: default(ColorControl::Brightness),
            contrast: default(ColorControl::Contrast),
            sharpness: default(ColorControl::Sharpness),
            saturation: default(ColorControl::Saturation),
            gain: default(ColorControl::Gain),
            powerline_frequency: u8::try_from(default(ColorControl::PowerlineFrequency)).ok()
                .and_then(|v| PowerlineFrequency::try_from(v).ok())
                .unwrap_or_default(),
            backlight_compensation: default(ColorControl::BacklightCompensation) != 0,
            hdr: default(ColorControl::Hdr) != 0,
        }
    }

    /// Returns a copy with every numeric control clamped into the device type's valid range
    pub fn clamped_for(&self, device_type: DeviceType) -> ColorSettings {
        let clamp = |control: ColorControl, value: i32| {
            let r = control.range(device_type);
            value.clamp(r.min, r.max)
        };

        ColorSettings {
            exposure_time: clamp(ColorControl::Exposure, self.exposure_time),
            white_balance: clamp(ColorControl::WhiteBalance, self.white_balance),
            brightness: clamp(ColorControl::Brightness, self.brightness),
            contrast: clamp(ColorControl::Contrast, self.contrast),
            sharpness: clamp(ColorControl::Sharpness, self.sharpness),
            saturation: clamp(ColorControl::Saturation, self.saturation),
            gain: clamp(ColorControl::Gain, self.gain),
            ..self.clone()
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.exposure_time);
        buf.put_u8(self.auto_exposure.into());
        buf.put_i32(self.white_balance);
        buf.put_u8(self.auto_white_balance.into());
        buf.put_i32(self.brightness);
        buf.put_i32(self.contrast);
        buf.put_i32(self.sharpness);
        buf.put_i32(self.saturation);
        buf.put_i32(self.gain);
        buf.put_u8(self.powerline_frequency.into());
        buf.put_u8(self.backlight_compensation.into());
        buf.put_u8(self.hdr.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ColorSettings> {
        Ok(ColorSettings {
            exposure_time: buf.read_i32()?,
            auto_exposure: buf.read_bool()?,
            white_balance: buf.read_i32()?,
            auto_white_balance: buf.read_bool()?,
            brightness: buf.read_i32()?,
            contrast: buf.read_i32()?,
            sharpness: buf.read_i32()?,
            saturation: buf.read_i32()?,
            gain: buf.read_i32()?,
            powerline_frequency: PowerlineFrequency::try_from(buf.read_u8()?)?,
            backlight_compensation: buf.read_bool()?,
            hdr: buf.read_bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_depend_on_device_type() {
        let kinect = ColorSettings::defaults_for(DeviceType::AzureKinect);
        assert_eq!(kinect.exposure_time, 33330);
        assert_eq!(kinect.brightness, 128);
        assert_eq!(kinect.white_balance, 4500);
        assert!(!kinect.hdr);

        let bolt = ColorSettings::defaults_for(DeviceType::FemtoBolt);
        assert_eq!(bolt.exposure_time, 200);
        assert_eq!(bolt.brightness, 10);
        assert_eq!(bolt.white_balance, 6500);
        assert!(bolt.hdr);
        assert_eq!(bolt.powerline_frequency, PowerlineFrequency::Hz60);

        assert_eq!(ColorSettings::defaults_for(DeviceType::Gemini215), bolt);
    }

    #[test]
    fn test_clamp() {
        let settings = ColorSettings {
            brightness: 200,
            exposure_time: 0,
            ..ColorSettings::defaults_for(DeviceType::AzureKinect)
        };
        let clamped = settings.clamped_for(DeviceType::FemtoBolt);
        assert_eq!(clamped.brightness, 20);
        assert_eq!(clamped.exposure_time, 1);
        assert_eq!(clamped.contrast, 5);
    }

    #[test]
    fn test_ser_deser() {
        let settings = ColorSettings {
            auto_exposure: false,
            gain: 77,
            powerline_frequency: PowerlineFrequency::Hz50,
            ..ColorSettings::defaults_for(DeviceType::FemtoMegaUsb)
        };
        let mut buf = BytesMut::new();
        settings.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(ColorSettings::deser(&mut b).unwrap(), settings);
        assert!(b.is_empty());
    }
}
