use bytes::Bytes;

use crate::frame::{Channel, CompressedFrame};
use crate::settings::device_settings::DeviceMode;

/// A frame with the given capture id, captured and received at `time_ms`
pub fn frame_at(id_capture: i64, time_ms: i64) -> CompressedFrame {
    CompressedFrame {
        id_capture,
        after_capture_ts_ns: time_ms * 1_000_000,
        received_ts_ns: time_ms * 1_000_000,
        mode: DeviceMode(1),
        valid_vertices_count: 0,
        channels: Default::default(),
    }
}

/// A frame with some content in the color and depth channels, big enough to need many datagrams
pub fn frame_with_data(id_capture: i64, after_capture_ts_ns: i64, len: usize) -> CompressedFrame {
    let color = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let depth = (0..len / 2).map(|i| (i % 13) as u8).collect::<Vec<_>>();

    CompressedFrame {
        id_capture,
        after_capture_ts_ns,
        received_ts_ns: 0,
        mode: DeviceMode(1),
        valid_vertices_count: (len / 4) as u32,
        channels: [
            (Channel::Color, Bytes::from(color)),
            (Channel::Depth, Bytes::from(depth)),
        ].into_iter().collect(),
    }
}
