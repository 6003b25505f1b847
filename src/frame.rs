use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport::buf_ext::BufExt;
use transport::safe_converter::PrecheckedCast;

use crate::settings::device_settings::DeviceMode;

/// The kinds of data a frame can carry. Contents are opaque to this crate: they are produced by
///  the device backend's codecs and consumed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Channel {
    Color = 0,
    DepthSizedColor = 1,
    BodiesIdMap = 2,
    Depth = 3,
    Infra = 4,
    Cloud = 5,
    Calibration = 6,
    Imu = 7,
    Bodies = 8,
}

/// One capture of a device, with its data channels compressed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedFrame {
    /// per-device capture sequence number
    pub id_capture: i64,
    /// capture time in the grabber's clock
    pub after_capture_ts_ns: i64,
    /// capture time converted into the receiver's clock, set once when the frame is received
    pub received_ts_ns: i64,
    pub mode: DeviceMode,
    pub valid_vertices_count: u32,
    pub channels: BTreeMap<Channel, Bytes>,
}

impl CompressedFrame {
    const FIXED_LEN: usize = 3 * size_of::<i64>() + size_of::<u16>() + size_of::<u32>() + size_of::<u8>();
    const CHANNEL_OVERHEAD: usize = size_of::<u8>() + size_of::<u32>();

    pub fn channel(&self, channel: Channel) -> Option<&Bytes> {
        self.channels.get(&channel)
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + self.channels.values()
            .map(|data| Self::CHANNEL_OVERHEAD + data.len())
            .sum::<usize>()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(self.serialized_len());

        buf.put_i64(self.id_capture);
        buf.put_i64(self.after_capture_ts_ns);
        buf.put_i64(self.received_ts_ns);
        buf.put_u16(self.mode.0);
        buf.put_u32(self.valid_vertices_count);
        buf.put_u8(self.channels.len().prechecked_cast());
        for (&channel, data) in &self.channels {
            buf.put_u8(channel.into());
            buf.put_u32(data.len().prechecked_cast());
            buf.put_slice(data);
        }
    }

    /// Channel data is sliced out of `buf` without copying if `buf` is a [Bytes]
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CompressedFrame> {
        let id_capture = buf.read_i64()?;
        let after_capture_ts_ns = buf.read_i64()?;
        let received_ts_ns = buf.read_i64()?;
        let mode = DeviceMode(buf.read_u16()?);
        let valid_vertices_count = buf.read_u32()?;

        let num_channels = buf.read_u8()?;
        let mut channels = BTreeMap::new();
        for _ in 0..num_channels {
            let raw = buf.read_u8()?;
            let channel = Channel::try_from(raw)
                .map_err(|_| anyhow!("invalid channel {}", raw))?;
            let data = buf.read_len_prefixed()?;
            if channels.insert(channel, data).is_some() {
                bail!("duplicate channel {:?}", channel);
            }
        }

        Ok(CompressedFrame {
            id_capture,
            after_capture_ts_ns,
            received_ts_ns,
            mode,
            valid_vertices_count,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_channels() -> CompressedFrame {
        CompressedFrame {
            id_capture: 12,
            after_capture_ts_ns: 1_700_000_000_000_000_000,
            received_ts_ns: 0,
            mode: DeviceMode(3),
            valid_vertices_count: 250_000,
            channels: [
                (Channel::Color, Bytes::from(vec![1u8; 20_000])),
                (Channel::Depth, Bytes::from(vec![2u8; 50_000])),
                (Channel::Calibration, Bytes::from_static(b"calibration")),
                (Channel::Bodies, Bytes::new()),
            ].into_iter().collect(),
        }
    }

    #[test]
    fn test_ser_deser() {
        let frame = frame_with_channels();
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.len(), frame.serialized_len());

        let mut b = buf.freeze();
        let deser = CompressedFrame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, frame);
        assert_eq!(deser.channel(Channel::Calibration).unwrap(), &Bytes::from_static(b"calibration"));
        assert!(deser.channel(Channel::Infra).is_none());
    }

    #[test]
    fn test_deser_truncated_channel() {
        let mut buf = BytesMut::new();
        frame_with_channels().ser(&mut buf);
        let mut b: &[u8] = &buf[..buf.len() - 12];
        assert!(CompressedFrame::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_duplicate_channel() {
        let mut buf = BytesMut::new();
        CompressedFrame::default().ser(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 2;
        for _ in 0..2 {
            buf.put_u8(Channel::Imu.into());
            buf.put_u32(1);
            buf.put_u8(0);
        }

        let mut b: &[u8] = &buf;
        assert!(CompressedFrame::deser(&mut b).is_err());
    }
}
