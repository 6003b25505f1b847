use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use transport::buf_ext::BufExt;
use transport::safe_converter::PrecheckedCast;

/// Filters the grabber applies to depth data before generating and sending frames. The optional
///  depth mask has one byte per depth pixel and makes this the one settings message that regularly
///  spans several datagrams.
#[derive(Debug, Clone, PartialEq)]
pub struct FiltersSettings {
    pub min_depth_mm: u16,
    pub max_depth_mm: u16,
    /// crop box in meters, in camera space
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
    pub min_z: f32,
    pub max_z: f32,
    /// points with fewer valid neighbours than this are removed, 0 disables the filter
    pub min_neighbours: u8,
    /// non-zero entries mark depth pixels that are discarded
    pub depth_mask: Vec<u8>,
}

impl Default for FiltersSettings {
    fn default() -> Self {
        FiltersSettings {
            min_depth_mm: 0,
            max_depth_mm: 16_000,
            min_x: -10.0,
            max_x: 10.0,
            min_y: -10.0,
            max_y: 10.0,
            min_z: -10.0,
            max_z: 10.0,
            min_neighbours: 0,
            depth_mask: Vec::new(),
        }
    }
}

impl FiltersSettings {
    pub const MAX_MASK_LEN: usize = 4096 * 4096;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.min_depth_mm);
        buf.put_u16(self.max_depth_mm);
        for v in [self.min_x, self.max_x, self.min_y, self.max_y, self.min_z, self.max_z] {
            buf.put_f32(v);
        }
        buf.put_u8(self.min_neighbours);
        buf.put_u32(self.depth_mask.len().prechecked_cast());
        buf.put_slice(&self.depth_mask);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FiltersSettings> {
        let min_depth_mm = buf.read_u16()?;
        let max_depth_mm = buf.read_u16()?;
        let min_x = buf.read_f32()?;
        let max_x = buf.read_f32()?;
        let min_y = buf.read_f32()?;
        let max_y = buf.read_f32()?;
        let min_z = buf.read_f32()?;
        let max_z = buf.read_f32()?;
        let min_neighbours = buf.read_u8()?;

        let mask_len = buf.read_u32()? as usize;
        if mask_len > Self::MAX_MASK_LEN {
            bail!("depth mask of {} bytes exceeds maximum of {}", mask_len, Self::MAX_MASK_LEN);
        }
        let depth_mask = buf.read_vec(mask_len)?;

        Ok(FiltersSettings {
            min_depth_mm,
            max_depth_mm,
            min_x,
            max_x,
            min_y,
            max_y,
            min_z,
            max_z,
            min_neighbours,
            depth_mask,
        })
    }
}
