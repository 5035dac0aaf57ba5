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

//! Reading and writing of messages using the standard stream framing: the segment count minus
//! one, then each segment's length in words (all little-endian `u32`s, padded to a whole
//! word), then the segments themselves.

use std::io::{Read, Write};

use crate::message;
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, ErrorKind, Result};

/// Largest number of segments a reader will accept in one message.
pub const SEGMENTS_COUNT_LIMIT: usize = 512;

/// Segments read from a single flat slice of bytes.
pub struct SliceSegments<'a> {
    bytes: &'a [u8],

    // Byte ranges of the segments within `bytes`.
    segment_indices: Vec<(usize, usize)>,
}

impl<'a> message::ReaderSegments for SliceSegments<'a> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segment_indices
            .get(id as usize)
            .map(|&(a, b)| &self.bytes[a..b])
    }

    fn len(&self) -> usize {
        self.segment_indices.len()
    }
}

/// Reads a serialized message (including a segment table) from a flat slice of bytes, without
/// copying. The slice is allowed to extend beyond the end of the message. On success, updates
/// `slice` to point to the remaining bytes beyond the end of the message.
///
/// ALIGNMENT: the segments are read byte-wise, so `slice` need not be word-aligned.
pub fn read_message_from_flat_slice<'a>(
    slice: &mut &'a [u8],
    options: message::ReaderOptions,
) -> Result<message::Reader<SliceSegments<'a>>> {
    let all_bytes = *slice;
    let mut bytes = *slice;
    let orig_bytes_len = bytes.len();
    let Some(segment_lengths_builder) = read_segment_table(&mut bytes, options)? else {
        return Err(Error::from_kind(ErrorKind::PrematureEndOfFile));
    };
    let segment_table_bytes_len = orig_bytes_len - bytes.len();
    assert_eq!(segment_table_bytes_len % BYTES_PER_WORD, 0);
    let body_bytes = segment_lengths_builder.total_words() * BYTES_PER_WORD;
    if bytes.len() < body_bytes {
        Err(Error::from_kind_context(
            ErrorKind::PrematureEndOfFile,
            format!(
                "Message ends prematurely. Header claimed {} words, but message only has {} words.",
                segment_lengths_builder.total_words(),
                bytes.len() / BYTES_PER_WORD
            ),
        ))
    } else {
        *slice = &bytes[body_bytes..];
        let message_bytes = &all_bytes[segment_table_bytes_len..segment_table_bytes_len + body_bytes];
        Ok(message::Reader::new(
            segment_lengths_builder.into_slice_segments(message_bytes),
            options,
        ))
    }
}

/// Segments read into a single owned buffer.
pub struct OwnedSegments {
    // Byte ranges of the segments within `owned_space`.
    segment_indices: Vec<(usize, usize)>,
    owned_space: Vec<u8>,
}

impl OwnedSegments {
    /// The whole buffer, into which the segments are to be read back to back.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.owned_space[..]
    }
}

impl message::ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segment_indices
            .get(id as usize)
            .map(|&(a, b)| &self.owned_space[a..b])
    }

    fn len(&self) -> usize {
        self.segment_indices.len()
    }
}

/// Helper object for constructing an `OwnedSegments` or a `SliceSegments`.
#[derive(Debug, Default)]
pub struct SegmentLengthsBuilder {
    segment_indices: Vec<(usize, usize)>,
    total_words: usize,
}

impl SegmentLengthsBuilder {
    /// Creates a new `SegmentsLengthsBuilder`, initializing the segment_indices vector with
    /// `Vec::with_capacity(capacity)`. `capacity` should equal the number of times that
    /// `push_segment()` is expected to be called.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            segment_indices: Vec::with_capacity(capacity),
            total_words: 0,
        }
    }

    /// Pushes a new segment of length `length_in_words`.
    pub fn push_segment(&mut self, length_in_words: usize) {
        let start = self.total_words * BYTES_PER_WORD;
        self.total_words += length_in_words;
        self.segment_indices
            .push((start, self.total_words * BYTES_PER_WORD));
    }

    /// Constructs an `OwnedSegments`, allocating a single buffer of zeroed bytes.
    pub fn into_owned_segments(self) -> OwnedSegments {
        OwnedSegments {
            owned_space: vec![0; self.total_words * BYTES_PER_WORD],
            segment_indices: self.segment_indices,
        }
    }

    /// Constructs a `SliceSegments` over `bytes`, which must hold exactly `total_words()`
    /// words.
    pub fn into_slice_segments(self, bytes: &[u8]) -> SliceSegments<'_> {
        assert_eq!(bytes.len(), self.total_words * BYTES_PER_WORD);
        SliceSegments {
            bytes,
            segment_indices: self.segment_indices,
        }
    }

    /// Returns the sum of the lengths of the segments pushed so far.
    pub fn total_words(&self) -> usize {
        self.total_words
    }
}

/// Reads a serialized message from a stream with the provided options.
///
/// For optimal performance, `read` should be a buffered reader type.
pub fn read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    match try_read_message(read, options)? {
        Some(m) => Ok(m),
        None => Err(Error::from_kind_context(
            ErrorKind::PrematureEndOfFile,
            "Premature end of file".into(),
        )),
    }
}

/// Like `read_message()`, but returns None instead of an error if there are zero bytes left in
/// `read`. This is useful for reading a stream containing an unknown number of messages -- you
/// call this function until it returns None.
pub fn try_read_message<R>(
    mut read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: Read,
{
    let Some(segment_lengths_builder) = read_segment_table(&mut read, options)? else {
        return Ok(None);
    };
    Ok(Some(read_segments(
        &mut read,
        segment_lengths_builder.into_owned_segments(),
        options,
    )?))
}

/// Decodes the first word of a segment table into the segment count and the length of the
/// first segment.
pub fn parse_segment_table_first(buf: &[u8; 8]) -> Result<(usize, usize)> {
    let segment_count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).wrapping_add(1) as usize;
    if segment_count == 0 || segment_count > SEGMENTS_COUNT_LIMIT {
        tracing::debug!(segment_count, "rejecting segment table");
        return Err(Error::from_kind_context(
            ErrorKind::InvalidNumberOfSegments,
            format!("{segment_count}"),
        ));
    }
    let first_segment_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    Ok((segment_count, first_segment_length))
}

/// Number of bytes in the segment table after its first word.
pub fn segment_table_rest_len(segment_count: usize) -> usize {
    4 * (segment_count & !1)
}

/// Decodes the rest of a segment table, given the results of `parse_segment_table_first()`
/// and the `segment_table_rest_len()` bytes that follow the first word.
pub fn parse_segment_table_rest(
    options: message::ReaderOptions,
    segment_count: usize,
    first_segment_length: usize,
    buf: &[u8],
) -> Result<SegmentLengthsBuilder> {
    let mut builder = SegmentLengthsBuilder::with_capacity(segment_count);
    builder.push_segment(first_segment_length);
    for idx in 0..(segment_count - 1) {
        let b = &buf[idx * 4..(idx + 1) * 4];
        builder.push_segment(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize);
    }

    // Don't accept a message which the receiver couldn't possibly traverse without hitting the
    // traversal limit. Without this check, a malicious client could transmit a very large segment
    // size to make the receiver allocate excessive space and possibly crash.
    if builder.total_words() as u64 > options.traversal_limit_in_words {
        tracing::debug!(words = builder.total_words(), "rejecting oversized message");
        return Err(Error::from_kind_context(
            ErrorKind::MessageTooLarge,
            format!("{}", builder.total_words()),
        ));
    }
    Ok(builder)
}

/// Reads a segment table from `read` and returns the total number of words across all
/// segments, as well as the segment offsets.
///
/// Returns `None` if `read` is at end of file before the first byte.
fn read_segment_table<R>(
    read: &mut R,
    options: message::ReaderOptions,
) -> Result<Option<SegmentLengthsBuilder>>
where
    R: Read + ?Sized,
{
    // read the first Word, which contains segment_count and the 1st segment length
    let mut buf: [u8; 8] = [0; 8];
    {
        let n = read.read(&mut buf[..])?;
        if n == 0 {
            // Clean EOF on message boundary
            return Ok(None);
        } else if n < 8 {
            read.read_exact(&mut buf[n..])?;
        }
    }

    let (segment_count, first_segment_length) = parse_segment_table_first(&buf)?;

    let mut rest = vec![0u8; segment_table_rest_len(segment_count)];
    read.read_exact(&mut rest[..])?;
    Ok(Some(parse_segment_table_rest(
        options,
        segment_count,
        first_segment_length,
        &rest,
    )?))
}

/// Reads segments from `read`.
fn read_segments<R>(
    read: &mut R,
    mut segments: OwnedSegments,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: Read + ?Sized,
{
    read.read_exact(segments.as_bytes_mut())?;
    Ok(message::Reader::new(segments, options))
}

/// Constructs a flat vector containing the entire message, including a segment header.
pub fn write_message_to_words<A>(message: &message::Builder<A>) -> Vec<u8>
where
    A: message::Allocator,
{
    flatten_segments(&*message.get_segments_for_output())
}

/// Like `write_message_to_words()`, but takes a `ReaderSegments`, allowing it to be
/// used on `message::Reader` objects (via `into_segments()`).
pub fn write_message_segments_to_words<R>(message: &R) -> Vec<u8>
where
    R: message::ReaderSegments + ?Sized,
{
    flatten_segments(message)
}

fn flatten_segments<R: message::ReaderSegments + ?Sized>(segments: &R) -> Vec<u8> {
    let word_count = compute_serialized_size(segments);
    let mut result = Vec::with_capacity(word_count * BYTES_PER_WORD);
    write_segment_table_internal(&mut result, segments);
    for segment in segment_iter(segments) {
        result.extend_from_slice(segment);
    }
    result
}

/// Writes the provided message to `write`.
///
/// For optimal performance, `write` should be a buffered writer. `flush` will not be called on
/// the writer.
pub fn write_message<W, A>(mut write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    let segments = message.get_segments_for_output();
    write_segment_table(&mut write, &segments)?;
    write_segments(&mut write, &segments)
}

/// Like `write_message()`, but takes a `ReaderSegments`, allowing it to be
/// used on `message::Reader` objects (via `into_segments()`).
pub fn write_message_segments<W, R>(mut write: W, segments: &R) -> Result<()>
where
    W: Write,
    R: message::ReaderSegments + ?Sized,
{
    write_segment_table(&mut write, segments)?;
    write_segments(&mut write, segments)
}

/// Writes a segment table to `write`.
///
/// `segments` must contain at least one segment.
pub fn write_segment_table<W, R>(write: &mut W, segments: &R) -> Result<()>
where
    W: Write + ?Sized,
    R: message::ReaderSegments + ?Sized,
{
    let mut table = Vec::with_capacity(8 * (segments.len() / 2 + 1));
    write_segment_table_internal(&mut table, segments);

    // The first word goes out on its own. Readers fetch it separately, and packed runs must
    // not span the two reads.
    let (first, rest) = table.split_at(8);
    write.write_all(first)?;
    if !rest.is_empty() {
        write.write_all(rest)?;
    }
    Ok(())
}

fn write_segment_table_internal<R>(out: &mut Vec<u8>, segments: &R)
where
    R: message::ReaderSegments + ?Sized,
{
    let segment_count = segments.len();
    assert!(segment_count > 0, "a message always has at least one segment");

    out.extend_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    for segment in segment_iter(segments) {
        out.extend_from_slice(&((segment.len() / BYTES_PER_WORD) as u32).to_le_bytes());
    }
    if segment_count % 2 == 0 {
        // Pad to a whole word.
        out.extend_from_slice(&[0; 4]);
    }
}

/// Writes segments to `write`.
fn write_segments<W, R>(write: &mut W, segments: &R) -> Result<()>
where
    W: Write + ?Sized,
    R: message::ReaderSegments + ?Sized,
{
    for segment in segment_iter(segments) {
        write.write_all(segment)?;
    }
    Ok(())
}

fn segment_iter<R>(segments: &R) -> impl Iterator<Item = &[u8]>
where
    R: message::ReaderSegments + ?Sized,
{
    (0..).map_while(move |id| segments.get_segment(id))
}

fn compute_serialized_size<R: message::ReaderSegments + ?Sized>(segments: &R) -> usize {
    // Table size
    let len = segments.len();
    let mut size = (len / 2) + 1;
    for segment in segment_iter(segments) {
        size += segment.len() / BYTES_PER_WORD;
    }
    size
}

/// Returns the number of (8-byte) words required to serialize the message (including the
/// segment table).
///
/// Multiply this by 8 (or `std::mem::size_of::<capwire::Word>()`) to get the number of bytes
/// that `write_message()` will write.
pub fn compute_serialized_size_in_words<A>(message: &message::Builder<A>) -> usize
where
    A: message::Allocator,
{
    compute_serialized_size(&*message.get_segments_for_output())
}

#[cfg(test)]
pub mod test {
    use std::io::Cursor;

    use quickcheck::{quickcheck, TestResult};

    use super::{
        flatten_segments, parse_segment_table_first, read_message, read_message_from_flat_slice,
        read_segment_table, try_read_message, write_message_segments,
    };
    use crate::message::{self, ReaderSegments};
    use crate::{ErrorKind, Result};

    fn read_table(bytes: &[u8]) -> Result<Option<Vec<(usize, usize)>>> {
        Ok(
            read_segment_table(&mut Cursor::new(bytes), message::ReaderOptions::new())?
                .map(|b| b.segment_indices),
        )
    }

    #[test]
    fn test_read_segment_table() {
        assert_eq!(
            read_table(&[0, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
            Some(vec![(0, 0)])
        );
        assert_eq!(
            read_table(&[0, 0, 0, 0, 1, 0, 0, 0]).unwrap(),
            Some(vec![(0, 8)])
        );
        assert_eq!(
            read_table(&[1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
            Some(vec![(0, 8), (8, 16)])
        );
        assert_eq!(
            read_table(&[
                2, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 1, 0, 0
            ])
            .unwrap(),
            Some(vec![(0, 8), (8, 16), (16, 16 + 256 * 8)])
        );
        assert_eq!(read_table(&[]).unwrap(), None);
    }

    #[test]
    fn test_read_invalid_segment_table() {
        let kind = |bytes: &[u8]| read_table(bytes).err().map(|e| e.kind);

        // 513 segments
        assert_eq!(
            kind(&[0, 2, 0, 0, 0, 0, 0, 0]),
            Some(ErrorKind::InvalidNumberOfSegments)
        );
        // u32::MAX + 1 wraps to zero segments
        assert_eq!(
            kind(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]),
            Some(ErrorKind::InvalidNumberOfSegments)
        );
        // truncated first word
        assert_eq!(kind(&[0, 0, 0]), Some(ErrorKind::PrematureEndOfFile));
        // two segments, but the second length is missing
        assert_eq!(
            kind(&[1, 0, 0, 0, 1, 0, 0, 0]),
            Some(ErrorKind::PrematureEndOfFile)
        );
        // 2^32 - 1 words in the first segment
        assert_eq!(
            kind(&[0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]),
            Some(ErrorKind::MessageTooLarge)
        );
        assert!(parse_segment_table_first(&[0xff, 1, 0, 0, 0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn premature_eof_mid_message() {
        let mut bytes = flatten_segments(&[&[7u8; 16][..]][..]);
        bytes.truncate(bytes.len() - 3);
        assert_eq!(
            read_message(Cursor::new(&bytes[..]), message::ReaderOptions::new())
                .err()
                .map(|e| e.kind),
            Some(ErrorKind::PrematureEndOfFile)
        );
        assert!(
            try_read_message(Cursor::new(&[0u8; 0][..]), message::ReaderOptions::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn flat_slice_advances_past_message() {
        let first = flatten_segments(&[&[1u8; 8][..]][..]);
        let second = flatten_segments(&[&[2u8; 16][..], &[3u8; 8][..]][..]);
        let mut buf = first.clone();
        buf.extend_from_slice(&second);
        buf.extend_from_slice(&[9, 9]);

        let mut slice = &buf[..];
        let m1 = read_message_from_flat_slice(&mut slice, message::ReaderOptions::new()).unwrap();
        assert_eq!(m1.into_segments().get_segment(0), Some(&[1u8; 8][..]));
        let m2 = read_message_from_flat_slice(&mut slice, message::ReaderOptions::new()).unwrap();
        let segs = m2.into_segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs.get_segment(1), Some(&[3u8; 8][..]));
        assert_eq!(slice, &[9, 9]);

        let mut short = &first[..first.len() - 8];
        assert_eq!(
            read_message_from_flat_slice(&mut short, message::ReaderOptions::new())
                .err()
                .map(|e| e.kind),
            Some(ErrorKind::PrematureEndOfFile)
        );
    }

    fn to_segments(segments: &[Vec<u64>]) -> Vec<Vec<u8>> {
        segments
            .iter()
            .map(|s| s.iter().flat_map(|w| w.to_le_bytes()).collect())
            .collect()
    }

    quickcheck! {
        fn round_trip(segments: Vec<Vec<u64>>) -> TestResult {
            if segments.is_empty() || segments.len() > super::SEGMENTS_COUNT_LIMIT {
                return TestResult::discard();
            }
            let segments = to_segments(&segments);
            let borrowed: Vec<&[u8]> = segments.iter().map(|s| &s[..]).collect();

            let mut buf: Vec<u8> = Vec::new();
            write_message_segments(&mut buf, &borrowed[..]).unwrap();
            assert_eq!(buf, flatten_segments(&borrowed[..]));

            let message = read_message(Cursor::new(&buf[..]), message::ReaderOptions::new()).unwrap();
            let result_segments = message.into_segments();

            TestResult::from_bool(borrowed.iter().enumerate().all(|(i, segment)| {
                result_segments.get_segment(i as u32) == Some(&segment[..])
            }))
        }

        fn round_trip_flat_slice(segments: Vec<Vec<u64>>) -> TestResult {
            if segments.is_empty() || segments.len() > super::SEGMENTS_COUNT_LIMIT {
                return TestResult::discard();
            }
            let segments = to_segments(&segments);
            let borrowed: Vec<&[u8]> = segments.iter().map(|s| &s[..]).collect();
            let buf = flatten_segments(&borrowed[..]);
            let mut slice = &buf[..];
            let message = read_message_from_flat_slice(&mut slice, message::ReaderOptions::new())
                .unwrap();
            let result_segments = message.into_segments();
            TestResult::from_bool(slice.is_empty() && borrowed.iter().enumerate().all(|(i, segment)| {
                result_segments.get_segment(i as u32) == Some(&segment[..])
            }))
        }
    }
}
