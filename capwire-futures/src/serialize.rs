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

//! Asynchronous reading and writing of messages using the standard stream framing: a table of
//! segment sizes followed by the segments themselves.

use std::rc::Rc;

use capwire::serialize::{self as sync_serialize, OwnedSegments};
use capwire::{message, Error, ErrorKind, OutputSegments, Result};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Asynchronously reads a message from `reader`. Returns `None` if `reader` has zero bytes
/// left (i.e. is at end-of-file). To read a stream containing an unknown number of messages,
/// call this function repeatedly until it returns `None`.
pub async fn try_read_message<R>(
    mut reader: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: AsyncRead + Unpin,
{
    let mut first_word = [0u8; 8];
    if !read_first_word(&mut reader, &mut first_word).await? {
        return Ok(None);
    }
    let (segment_count, first_segment_length) =
        sync_serialize::parse_segment_table_first(&first_word)?;

    let mut rest = vec![0u8; sync_serialize::segment_table_rest_len(segment_count)];
    reader.read_exact(&mut rest[..]).await?;
    let lengths = sync_serialize::parse_segment_table_rest(
        options,
        segment_count,
        first_segment_length,
        &rest,
    )?;

    let mut segments = lengths.into_owned_segments();
    reader.read_exact(segments.as_bytes_mut()).await?;
    Ok(Some(message::Reader::new(segments, options)))
}

/// Asynchronously reads a message from `reader`.
pub async fn read_message<R>(
    reader: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: AsyncRead + Unpin,
{
    match try_read_message(reader, options).await? {
        Some(m) => Ok(m),
        None => Err(Error::from_kind_context(
            ErrorKind::PrematureEndOfFile,
            "Premature end of file".into(),
        )),
    }
}

/// Fills `buf`. Returns `false` on a clean end of file before the first byte.
async fn read_first_word<R>(reader: &mut R, buf: &mut [u8; 8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut idx = 0;
    while idx < buf.len() {
        let n = reader.read(&mut buf[idx..]).await?;
        if n == 0 {
            if idx == 0 {
                return Ok(false);
            }
            return Err(Error::from_kind(ErrorKind::PrematureEndOfFile));
        }
        idx += n;
    }
    Ok(true)
}

/// Something that can be asynchronously written to a stream.
pub trait AsOutputSegments {
    fn as_output_segments(&self) -> OutputSegments<'_>;
}

impl<M> AsOutputSegments for &M
where
    M: AsOutputSegments,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        (*self).as_output_segments()
    }
}

impl<A> AsOutputSegments for message::Builder<A>
where
    A: message::Allocator,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

impl<A> AsOutputSegments for Rc<message::Builder<A>>
where
    A: message::Allocator,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

/// Writes the provided message to `writer`. Does not call `flush()`, so that multiple
/// successive calls can amortize work when `writer` is buffered.
pub async fn write_message<W, M>(mut writer: W, message: M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let segments = message.as_output_segments();
    let mut table = Vec::new();
    sync_serialize::write_segment_table(&mut table, &segments)?;

    // Same split as the blocking writer: the first word on its own.
    let (first, rest) = table.split_at(8);
    writer.write_all(first).await?;
    if !rest.is_empty() {
        writer.write_all(rest).await?;
    }
    for segment in segments.iter() {
        writer.write_all(segment).await?;
    }
    Ok(())
}
