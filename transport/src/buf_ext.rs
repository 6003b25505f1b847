use bytes::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
pub struct BufferUnderflow {
    pub needed: usize,
    pub remaining: usize,
}

macro_rules! read_checked_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        fn $reader(&mut self) -> Result<$ty, BufferUnderflow> {
            self.ensure_remaining(size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Length-checked fixed-width reads. `bytes` panics on underflow, which is not acceptable for
///  data coming from the network or from a file.
pub trait BufExt: Buf {
    fn ensure_remaining(&self, needed: usize) -> Result<(), BufferUnderflow> {
        if self.remaining() < needed {
            return Err(BufferUnderflow { needed, remaining: self.remaining() });
        }
        Ok(())
    }

    read_checked_impl!(read_u8, u8, get_u8);
    read_checked_impl!(read_u16, u16, get_u16);
    read_checked_impl!(read_u32, u32, get_u32);
    read_checked_impl!(read_u64, u64, get_u64);
    read_checked_impl!(read_u128, u128, get_u128);
    read_checked_impl!(read_i8, i8, get_i8);
    read_checked_impl!(read_i16, i16, get_i16);
    read_checked_impl!(read_i32, i32, get_i32);
    read_checked_impl!(read_i64, i64, get_i64);
    read_checked_impl!(read_f32, f32, get_f32);
    read_checked_impl!(read_f64, f64, get_f64);

    fn read_bool(&mut self) -> Result<bool, BufferUnderflow> {
        Ok(self.read_u8()? != 0)
    }

    /// reads exactly `len` bytes into a freshly allocated buffer
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, BufferUnderflow> {
        self.ensure_remaining(len)?;
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// reads exactly `len` bytes, without copying if the underlying buffer is [bytes::Bytes]
    fn read_bytes(&mut self, len: usize) -> Result<bytes::Bytes, BufferUnderflow> {
        self.ensure_remaining(len)?;
        Ok(self.copy_to_bytes(len))
    }

    /// reads a buffer prefixed with its length as u32
    fn read_len_prefixed(&mut self) -> Result<bytes::Bytes, BufferUnderflow> {
        let len = self.read_u32()?;
        self.read_bytes(len as usize)
    }
}

impl <T: Buf> BufExt for T {
}
