// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

/// A fixed-width value stored little-endian in a data section or list.
///
/// `bytes` must be at least `BYTES` long; callers slice to the field before calling.
pub trait Primitive: Copy + Default {
    const BYTES: usize;

    fn get(bytes: &[u8]) -> Self;

    fn set(bytes: &mut [u8], value: Self);

    /// XORs the value's bit pattern with the low bits of `default_bits`.
    ///
    /// Values are stored XORed with their schema default, so an all-zero
    /// wire word decodes to the default.
    fn mask(self, default_bits: u64) -> Self;
}

macro_rules! int_primitive(
    ($typ:ty, $n:expr) => (
        impl Primitive for $typ {
            const BYTES: usize = $n;

            #[inline]
            fn get(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                <$typ>::from_le_bytes(raw)
            }

            #[inline]
            fn set(bytes: &mut [u8], value: Self) {
                bytes[..$n].copy_from_slice(&value.to_le_bytes());
            }

            #[inline]
            fn mask(self, default_bits: u64) -> Self {
                self ^ (default_bits as $typ)
            }
        }
    );
);

int_primitive!(u8, 1);
int_primitive!(i8, 1);
int_primitive!(u16, 2);
int_primitive!(i16, 2);
int_primitive!(u32, 4);
int_primitive!(i32, 4);
int_primitive!(u64, 8);
int_primitive!(i64, 8);

impl Primitive for f32 {
    const BYTES: usize = 4;

    fn get(bytes: &[u8]) -> Self {
        f32::from_bits(<u32 as Primitive>::get(bytes))
    }

    fn set(bytes: &mut [u8], value: Self) {
        <u32 as Primitive>::set(bytes, value.to_bits())
    }

    fn mask(self, default_bits: u64) -> Self {
        f32::from_bits(self.to_bits() ^ default_bits as u32)
    }
}

impl Primitive for f64 {
    const BYTES: usize = 8;

    fn get(bytes: &[u8]) -> Self {
        f64::from_bits(<u64 as Primitive>::get(bytes))
    }

    fn set(bytes: &mut [u8], value: Self) {
        <u64 as Primitive>::set(bytes, value.to_bits())
    }

    fn mask(self, default_bits: u64) -> Self {
        f64::from_bits(self.to_bits() ^ default_bits)
    }
}

#[cfg(test)]
mod test {
    use super::Primitive;

    #[test]
    fn little_endian_layout() {
        let mut bytes = [0u8; 8];
        <u32 as Primitive>::set(&mut bytes[2..], 0x0403_0201);
        assert_eq!(bytes, [0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(<u16 as Primitive>::get(&bytes[3..]), 0x0302);
    }

    #[test]
    fn masking_round_trips() {
        let default = 42i32 as u32 as u64;
        let stored = 7i32.mask(default);
        assert_eq!(stored.mask(default), 7);
        assert_eq!(0i32.mask(default), 42);

        let fdefault = 1.5f64.to_bits();
        assert_eq!(0f64.mask(fdefault), 1.5);
    }
}
