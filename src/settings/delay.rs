use bytes::{Buf, BufMut, BytesMut};
use transport::buf_ext::BufExt;

/// Frames are held back on the grabber for this long after capture before they are sent, to
///  align several grabbers whose cameras have different processing latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelaySettings {
    pub delay_ms: i64,
}

impl DelaySettings {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i64(self.delay_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DelaySettings> {
        Ok(DelaySettings {
            delay_ms: buf.read_i64()?.max(0),
        })
    }

    pub fn delay_ns(&self) -> i64 {
        self.delay_ms.saturating_mul(1_000_000)
    }
}
