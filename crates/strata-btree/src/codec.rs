//! Fixed-width encoding of keys and values inside tree blocks.

use bytes::{Buf, BufMut};
use strata_common::Bid;

/// A type stored in tree blocks with a constant encoded width.
pub trait FixedCodec: Clone {
    /// Bytes written by `encode`.
    const ENCODED_SIZE: usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Reads one value. `buf` holds at least `ENCODED_SIZE` bytes.
    fn decode<B: Buf>(buf: &mut B) -> Self;
}

macro_rules! fixed_codec {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl FixedCodec for $ty {
            const ENCODED_SIZE: usize = $size;

            #[inline]
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            #[inline]
            fn decode<B: Buf>(buf: &mut B) -> Self {
                buf.$get()
            }
        }
    };
}

fixed_codec!(u8, 1, put_u8, get_u8);
fixed_codec!(u16, 2, put_u16_le, get_u16_le);
fixed_codec!(u32, 4, put_u32_le, get_u32_le);
fixed_codec!(u64, 8, put_u64_le, get_u64_le);
fixed_codec!(i32, 4, put_i32_le, get_i32_le);
fixed_codec!(i64, 8, put_i64_le, get_i64_le);
fixed_codec!(f32, 4, put_f32_le, get_f32_le);
fixed_codec!(f64, 8, put_f64_le, get_f64_le);

impl FixedCodec for Bid {
    const ENCODED_SIZE: usize = Bid::ENCODED_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.file);
        buf.put_u64_le(self.offset);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let file = buf.get_u32_le();
        let offset = buf.get_u64_le();
        Bid::new(file, offset)
    }
}

impl<const N: usize> FixedCodec for [u8; N] {
    const ENCODED_SIZE: usize = N;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        out
    }
}
