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

//! Reading and writing of messages using the packed stream encoding.
//!
//! Each word becomes a tag byte, with bit `i` set when byte `i` is non-zero, followed by the
//! non-zero bytes. A tag of 0x00 is followed by a count of additional zero words. A tag of
//! 0xff is followed by a count of words copied through verbatim, then those words.

use std::io::{self, BufRead, Read, Write};

use crate::message;
use crate::serialize;
use crate::{Error, ErrorKind, Result};

fn packed_error(kind: ErrorKind) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, Error::from_kind(kind))
}

/// A `Read` wrapper that unpacks packed data. Returns an error on any `read()`
/// call that would end within an all-zero (tag 0x00) or uncompressed (tag 0xff)
/// run of words. Calls that come from `serialize_packed::read_message()` and
/// `serialize_packed::try_read_message()` always mirror `write()` calls from
/// `serialize_packed::write_message()`, so they always safely span such runs.
pub struct PackedRead<R>
where
    R: BufRead,
{
    inner: R,
}

impl<R> PackedRead<R>
where
    R: BufRead,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let buf = self.inner.fill_buf()?;
        match buf.first() {
            Some(&b) => {
                self.inner.consume(1);
                Ok(b)
            }
            None => Err(packed_error(ErrorKind::PrematureEndOfPackedInput)),
        }
    }

    fn read_verbatim(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < out.len() {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(packed_error(ErrorKind::PrematureEndOfPackedInput));
            }
            let n = buf.len().min(out.len() - pos);
            out[pos..pos + n].copy_from_slice(&buf[..n]);
            self.inner.consume(n);
            pos += n;
        }
        Ok(())
    }
}

impl<R> Read for PackedRead<R>
where
    R: BufRead,
{
    fn read(&mut self, out_buf: &mut [u8]) -> io::Result<usize> {
        let len = out_buf.len();
        if len == 0 || self.inner.fill_buf()?.is_empty() {
            return Ok(0);
        }

        assert!(len % 8 == 0, "PackedRead reads must be word-aligned.");

        let mut pos = 0;
        while pos < len {
            let tag = self.read_byte()?;
            for (bit, out) in out_buf[pos..pos + 8].iter_mut().enumerate() {
                *out = if tag & (1u8 << bit) != 0 {
                    self.read_byte()?
                } else {
                    0
                };
            }
            pos += 8;

            if tag == 0 || tag == 0xff {
                let run_length = usize::from(self.read_byte()?) * 8;
                if run_length > len - pos {
                    return Err(packed_error(
                        ErrorKind::PackedInputDidNotEndCleanlyOnASegmentBoundary,
                    ));
                }
                let run = &mut out_buf[pos..pos + run_length];
                if tag == 0 {
                    run.fill(0);
                } else {
                    self.read_verbatim(run)?;
                }
                pos += run_length;
            }
        }
        Ok(len)
    }
}

/// Reads a packed message from a stream using the provided options.
pub fn read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<serialize::OwnedSegments>>
where
    R: BufRead,
{
    serialize::read_message(PackedRead::new(read), options)
}

/// Like read_message(), but returns None instead of an error if there are zero bytes left in `read`.
pub fn try_read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<serialize::OwnedSegments>>>
where
    R: BufRead,
{
    serialize::try_read_message(PackedRead::new(read), options)
}

/// Packs whole words from `input` onto the end of `out`. Runs never extend past the end of
/// `input`.
pub fn pack_words(input: &[u8], out: &mut Vec<u8>) {
    assert!(input.len() % 8 == 0, "packing requires whole words");
    let words: Vec<&[u8]> = input.chunks_exact(8).collect();
    let mut idx = 0;
    while idx < words.len() {
        let word = words[idx];
        idx += 1;

        let tag_pos = out.len();
        out.push(0);
        let mut tag = 0u8;
        for (bit, &b) in word.iter().enumerate() {
            if b != 0 {
                tag |= 1 << bit;
                out.push(b);
            }
        }
        out[tag_pos] = tag;

        if tag == 0 {
            // An all-zero word is followed by a count of consecutive zero words (not including
            // the first one).
            let start = idx;
            while idx < words.len() && idx - start < 255 && words[idx] == [0; 8] {
                idx += 1;
            }
            out.push((idx - start) as u8);
        } else if tag == 0xff {
            // Count the consecutive words with at most one zero byte. Two zeros is where the
            // tagged form starts to win.
            let start = idx;
            while idx < words.len()
                && idx - start < 255
                && words[idx].iter().filter(|&&b| b == 0).count() < 2
            {
                idx += 1;
            }
            out.push((idx - start) as u8);
            for w in &words[start..idx] {
                out.extend_from_slice(w);
            }
        }
    }
}

/// A `Write` wrapper that packs each buffer passed to `write()` on its own.
pub struct PackedWrite<W>
where
    W: Write,
{
    inner: W,
    buf: Vec<u8>,
}

impl<W> PackedWrite<W>
where
    W: Write,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

impl<W> Write for PackedWrite<W>
where
    W: Write,
{
    fn write(&mut self, in_buf: &[u8]) -> io::Result<usize> {
        self.buf.clear();
        pack_words(in_buf, &mut self.buf);
        self.inner.write_all(&self.buf)?;
        Ok(in_buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a packed message to a stream.
///
/// The only source of errors from this function are `write.write_all()` calls. If you pass in
/// a writer that never returns an error, then this function will never return an error.
pub fn write_message<W, A>(write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    serialize::write_message(PackedWrite::new(write), message)
}

/// Like `write_message()`, but takes a `ReaderSegments`, allowing it to be
/// used on `message::Reader` objects (via `into_segments()`).
pub fn write_message_segments<W, R>(write: W, segments: &R) -> Result<()>
where
    W: Write,
    R: message::ReaderSegments + ?Sized,
{
    serialize::write_message_segments(PackedWrite::new(write), segments)
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use quickcheck::{quickcheck, TestResult};

    use super::{read_message, write_message_segments, PackedRead, PackedWrite};
    use crate::message::{ReaderOptions, ReaderSegments};
    use crate::ErrorKind;

    fn check_unpacks_to(packed: &[u8], unpacked: &[u8]) {
        let mut packed_read = PackedRead::new(packed);
        let mut bytes = vec![0; unpacked.len()];
        packed_read.read_exact(&mut bytes[..]).unwrap();

        assert!(packed_read.inner.is_empty()); // nothing left to read
        assert_eq!(bytes, unpacked);
    }

    fn check_packing(unpacked: &[u8], packed: &[u8]) {
        let mut bytes: Vec<u8> = Vec::new();
        PackedWrite::new(&mut bytes).write_all(unpacked).unwrap();
        assert_eq!(bytes, packed);

        check_unpacks_to(packed, unpacked);
    }

    #[test]
    fn simple_packing() {
        check_packing(&[], &[]);
        check_packing(&[0; 8], &[0, 0]);
        check_packing(&[0, 0, 12, 0, 0, 34, 0, 0], &[0x24, 12, 34]);
        check_packing(
            &[1, 3, 2, 4, 5, 7, 6, 8],
            &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
        );
        check_packing(
            &[0, 0, 0, 0, 0, 0, 0, 0, 1, 3, 2, 4, 5, 7, 6, 8],
            &[0, 0, 0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
        );
        check_packing(
            &[0, 0, 12, 0, 0, 34, 0, 0, 1, 3, 2, 4, 5, 7, 6, 8],
            &[0x24, 12, 34, 0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
        );
        check_packing(
            &[1, 3, 2, 4, 5, 7, 6, 8, 8, 6, 7, 4, 5, 2, 3, 1],
            &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 1, 8, 6, 7, 4, 5, 2, 3, 1],
        );
        check_packing(
            &[
                1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4,
                5, 6, 7, 8, 0, 2, 4, 0, 9, 0, 5, 1,
            ],
            &[
                0xff, 1, 2, 3, 4, 5, 6, 7, 8, 3, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1,
                2, 3, 4, 5, 6, 7, 8, 0xd6, 2, 4, 9, 5, 1,
            ],
        );
        check_packing(
            &[
                1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 6, 2, 4, 3, 9, 0, 5, 1, 1, 2, 3, 4,
                5, 6, 7, 8, 0, 2, 4, 0, 9, 0, 5, 1,
            ],
            &[
                0xff, 1, 2, 3, 4, 5, 6, 7, 8, 3, 1, 2, 3, 4, 5, 6, 7, 8, 6, 2, 4, 3, 9, 0, 5, 1, 1,
                2, 3, 4, 5, 6, 7, 8, 0xd6, 2, 4, 9, 5, 1,
            ],
        );
        check_packing(
            &[
                8, 0, 100, 6, 0, 1, 1, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 1, 0, 2, 0, 3, 1,
            ],
            &[0xed, 8, 100, 6, 1, 1, 2, 0, 2, 0xd4, 1, 2, 3, 1],
        );
        check_packing(&[0; 16], &[0, 1]);
        check_packing(
            &[
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0,
            ],
            &[0, 3],
        );
    }

    #[test]
    fn run_past_end_of_read_is_rejected() {
        // Three zero words, read as two.
        let mut packed_read = PackedRead::new(&[0u8, 2][..]);
        let mut bytes = [0u8; 16];
        let err: crate::Error = packed_read.read_exact(&mut bytes).unwrap_err().into();
        assert_eq!(
            err.kind,
            ErrorKind::PackedInputDidNotEndCleanlyOnASegmentBoundary
        );
    }

    #[test]
    fn truncated_input_is_premature() {
        let mut packed_read = PackedRead::new(&[0xffu8, 1, 2, 3][..]);
        let mut bytes = [0u8; 8];
        let err: crate::Error = packed_read.read_exact(&mut bytes).unwrap_err().into();
        assert_eq!(err.kind, ErrorKind::PrematureEndOfPackedInput);
    }

    #[test]
    fn did_not_end_cleanly() {
        let segment = [0u8; 8];
        let segments: &[&[u8]] = &[&segment];
        let mut packed = Vec::new();
        write_message_segments(&mut packed, segments).unwrap();
        // Claim one more zero word than the segment holds.
        let last = packed.len() - 1;
        packed[last] += 1;
        assert_eq!(
            read_message(&packed[..], ReaderOptions::new())
                .err()
                .map(|e| e.kind),
            Some(ErrorKind::PackedInputDidNotEndCleanlyOnASegmentBoundary)
        );
    }

    quickcheck! {
        fn round_trip(segments: Vec<Vec<u64>>) -> TestResult {
            if segments.is_empty() || segments.len() > crate::serialize::SEGMENTS_COUNT_LIMIT {
                return TestResult::discard();
            }
            let segments: Vec<Vec<u8>> = segments
                .iter()
                .map(|s| s.iter().flat_map(|w| w.to_le_bytes()).collect())
                .collect();
            let borrowed: Vec<&[u8]> = segments.iter().map(|s| &s[..]).collect();

            let mut packed = Vec::new();
            write_message_segments(&mut packed, &borrowed[..]).unwrap();
            let message = read_message(&packed[..], ReaderOptions::new()).unwrap();
            let result_segments = message.into_segments();

            TestResult::from_bool(borrowed.iter().enumerate().all(|(i, segment)| {
                result_segments.get_segment(i as u32) == Some(&segment[..])
            }))
        }

        fn words_round_trip(words: Vec<u64>) -> bool {
            let unpacked: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            let mut packed = Vec::new();
            super::pack_words(&unpacked, &mut packed);
            let mut out = vec![0; unpacked.len()];
            PackedRead::new(&packed[..]).read_exact(&mut out).unwrap();
            out == unpacked
        }
    }
}
