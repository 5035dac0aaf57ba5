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

//! UTF-8 encoded text.

use std::str;

use crate::private::layout::{PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

pub type Reader<'a> = &'a str;

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Reader<'a>> {
        Ok(reader.get_text()?.unwrap_or(""))
    }
}

/// Text being written in place. The NUL terminator lies just past the end of `bytes` and is
/// never exposed.
pub struct Builder<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> Builder<'a> {
    /// A builder over freshly zeroed space, with nothing written yet.
    pub fn new(bytes: &'a mut [u8]) -> Builder<'a> {
        Builder { bytes, pos: 0 }
    }

    /// A builder over existing text; pushes append after it.
    pub(crate) fn with_pos(bytes: &'a mut [u8]) -> Builder<'a> {
        let pos = bytes.len();
        Builder { bytes, pos }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            bytes: &mut *self.bytes,
            pos: self.pos,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn push_ascii(&mut self, ascii: u8) {
        assert!(ascii < 128);
        self.bytes[self.pos] = ascii;
        self.pos += 1;
    }

    /// Appends `string`. Panics if it does not fit in the remaining capacity.
    pub fn push_str(&mut self, string: &str) {
        let bytes = string.as_bytes();
        self.bytes[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn clear(&mut self) {
        self.bytes[..self.pos].fill(0);
        self.pos = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    pub fn to_str(&self) -> Result<&str> {
        Ok(str::from_utf8(self.bytes)?)
    }

    pub fn into_reader(self) -> Result<Reader<'a>> {
        let bytes: &'a [u8] = self.bytes;
        Ok(str::from_utf8(bytes)?)
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Builder<'a>> {
        builder.init_text(size)
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Builder<'a>> {
        builder.get_text()
    }
}

impl SetPointerBuilder for Reader<'_> {
    fn set_pointer_builder(self, mut pointer: PointerBuilder<'_>) -> Result<()> {
        pointer.set_text(self)
    }
}

#[cfg(test)]
mod test {
    use crate::message;
    use crate::text;

    #[test]
    fn push_and_read_back() {
        let mut message = message::Builder::new_default();
        {
            let mut builder: text::Builder = message.get_root::<crate::any_pointer::Builder>()
                .unwrap()
                .initn_as(11)
                .unwrap();
            builder.push_str("hello");
            builder.push_ascii(b' ');
            builder.push_str("world");
            assert_eq!(builder.to_str().unwrap(), "hello world");
        }
        let root: text::Reader = message.get_root_as_reader().unwrap();
        assert_eq!(root, "hello world");
    }

    #[test]
    fn null_reads_as_empty() {
        let mut message = message::Builder::new_default();
        message.init_root::<crate::any_pointer::Builder>().unwrap();
        let root: text::Reader = message.get_root_as_reader().unwrap();
        assert_eq!(root, "");
    }
}
