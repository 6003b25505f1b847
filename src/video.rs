use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, info, warn};
use transport::buf_ext::BufExt;

use crate::frame::{Channel, CompressedFrame};
use crate::frame_buffer::FrameSequenceBuffer;
use crate::settings::device_settings::DeviceMode;

/// The format version tag at the start of a video file. Older versions can be read but not
///  written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum VideoType {
    Legacy2 = 2,
    Legacy3 = 3,
    Current = 4,
}

/// column-major 4x4 matrix placing a device's points in a common coordinate system
pub type Transform = [f64; 16];

pub const IDENTITY: Transform = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// The channels of a legacy3 frame, in file order
const LEGACY3_CHANNELS: [Channel; 8] = [
    Channel::Color,
    Channel::DepthSizedColor,
    Channel::BodiesIdMap,
    Channel::Depth,
    Channel::Infra,
    Channel::Cloud,
    Channel::Calibration,
    Channel::Imu,
];

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecording {
    pub transform: Transform,
    pub frames: FrameSequenceBuffer,
}

impl DeviceRecording {
    pub fn new(transform: Transform) -> DeviceRecording {
        DeviceRecording {
            transform,
            frames: FrameSequenceBuffer::new(),
        }
    }
}

/// A recording of several devices' frame sequences, as stored in a video file.
///
/// ```ascii
/// 0: video type (i8)
/// 1: device count (i8)
/// 2: per device: frame count (i32), transform (16 * f64)
/// *: per device, per frame: time (f64, unused), frame
/// ```
///
/// All numbers are big-endian. Devices without frames are skipped when reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoRecording {
    pub devices: Vec<DeviceRecording>,
}

impl VideoRecording {
    pub fn new() -> VideoRecording {
        VideoRecording::default()
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// From the earliest first frame to the latest last frame of all devices
    pub fn duration_ms(&self) -> f64 {
        match (self.start_ns(), self.end_ns()) {
            (Some(start), Some(end)) => (end - start) as f64 / 1_000_000.0,
            _ => 0.0,
        }
    }

    fn start_ns(&self) -> Option<i64> {
        self.devices.iter()
            .filter_map(|d| d.frames.first())
            .map(|f| f.received_ts_ns)
            .min()
    }

    fn end_ns(&self) -> Option<i64> {
        self.devices.iter()
            .filter_map(|d| d.frames.last())
            .map(|f| f.received_ts_ns)
            .max()
    }

    /// For each device, the index of the frame closest to `elapsed_ms` after the start of the
    ///  recording, for synchronized playback of all devices
    pub fn closest_frame_indices(&self, elapsed_ms: f64) -> Vec<Option<usize>> {
        let Some(start_ns) = self.start_ns() else {
            return vec![None; self.devices.len()];
        };
        let target_ms = start_ns as f64 / 1_000_000.0 + elapsed_ms;

        self.devices.iter()
            .map(|d| d.frames.closest_index_for_time(target_ms))
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("creating video file {:?}", path))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!("saved video with {} devices to {:?}", self.devices.len(), path);
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<VideoRecording> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening video file {:?}", path))?;
        let result = VideoRecording::read_from(&mut BufReader::new(file))
            .with_context(|| format!("reading video file {:?}", path))?;
        info!("loaded video with {} devices from {:?}", result.devices.len(), path);
        Ok(result)
    }

    /// Always writes the current format
    pub fn write_to(&self, writer: &mut impl Write) -> anyhow::Result<()> {
        let num_devices = i8::try_from(self.devices.len())
            .map_err(|_| anyhow!("a video file can hold at most {} devices", i8::MAX))?;

        let mut buf = BytesMut::new();
        buf.put_i8(VideoType::Current.into());
        buf.put_i8(num_devices);
        for device in &self.devices {
            let num_frames = i32::try_from(device.frames.len())
                .map_err(|_| anyhow!("too many frames"))?;
            buf.put_i32(num_frames);
            for v in device.transform {
                buf.put_f64(v);
            }
        }

        for device in &self.devices {
            for frame in &device.frames {
                buf.put_f64(0.0);
                frame.ser(&mut buf);
            }
        }

        writer.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> anyhow::Result<VideoRecording> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        VideoRecording::parse(Bytes::from(raw))
    }

    /// Frame data is sliced out of `buf` without copying
    pub fn parse(mut buf: Bytes) -> anyhow::Result<VideoRecording> {
        let raw_type = buf.read_i8()?;
        let video_type = VideoType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid video type {}", raw_type))?;
        debug!("video type {:?}", video_type);

        let num_devices = buf.read_i8()?;
        if num_devices < 0 {
            bail!("invalid device count {}", num_devices);
        }

        let mut frame_counts = Vec::new();
        let mut devices = Vec::new();
        for _ in 0..num_devices {
            let num_frames = buf.read_i32()?;
            let mut transform = [0.0; 16];
            for v in transform.iter_mut() {
                *v = buf.read_f64()?;
            }

            if num_frames > 0 {
                frame_counts.push(num_frames);
                devices.push(DeviceRecording::new(transform));
            }
        }

        for (device, num_frames) in devices.iter_mut().zip(frame_counts) {
            for index in 0..num_frames {
                let _time_ms = buf.read_f64()?;
                let frame = match video_type {
                    VideoType::Current => CompressedFrame::deser(&mut buf)?,
                    VideoType::Legacy3 => read_legacy3_frame(&mut buf)?,
                    VideoType::Legacy2 => read_legacy2_frame(&mut buf, index.into())?,
                };
                let id_capture = frame.id_capture;
                if !device.frames.add(frame) {
                    warn!("skipping duplicate or out-of-order frame {} in video file", id_capture);
                }
            }
        }

        if buf.has_remaining() {
            debug!("{} trailing bytes after the last frame", buf.remaining());
        }

        Ok(VideoRecording { devices })
    }
}

/// Legacy formats store only the (corrected) receive time
fn read_legacy3_frame(buf: &mut Bytes) -> anyhow::Result<CompressedFrame> {
    let id_capture = buf.read_i64()?;
    let received_ts_ns = buf.read_i64()?;
    let mode = DeviceMode(buf.read_u16()?);
    let valid_vertices_count = buf.read_i32()?.max(0).unsigned_abs();

    let mut frame = CompressedFrame {
        id_capture,
        after_capture_ts_ns: received_ts_ns,
        received_ts_ns,
        mode,
        valid_vertices_count,
        channels: Default::default(),
    };
    for channel in LEGACY3_CHANNELS {
        insert_non_empty(&mut frame, channel, buf.read_len_prefixed()?);
    }
    Ok(frame)
}

fn read_legacy2_frame(buf: &mut Bytes, id_capture: i64) -> anyhow::Result<CompressedFrame> {
    let received_ts_ns = buf.read_i64()?;
    let mode = DeviceMode(buf.read_u16()?);
    let calibration = buf.read_len_prefixed()?;
    let valid_vertices_count = buf.read_i32()?.max(0).unsigned_abs();

    let mut frame = CompressedFrame {
        id_capture,
        after_capture_ts_ns: received_ts_ns,
        received_ts_ns,
        mode,
        valid_vertices_count,
        channels: Default::default(),
    };
    insert_non_empty(&mut frame, Channel::Calibration, calibration);
    for channel in [Channel::Color, Channel::Depth, Channel::Infra] {
        insert_non_empty(&mut frame, channel, buf.read_len_prefixed()?);
    }
    Ok(frame)
}

fn insert_non_empty(frame: &mut CompressedFrame, channel: Channel, data: Bytes) {
    if !data.is_empty() {
        frame.channels.insert(channel, data);
    }
}
