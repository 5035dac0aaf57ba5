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

//! Asynchronous reading and writing of messages using the packed stream encoding.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use capwire::serialize::OwnedSegments;
use capwire::serialize_packed::pack_words;
use capwire::{message, Error, ErrorKind, Result};
use futures::{AsyncBufRead, AsyncRead, AsyncWrite};

use crate::serialize::AsOutputSegments;

fn premature_end() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        Error::from_kind(ErrorKind::PrematureEndOfPackedInput),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackedReadStage {
    Tag,
    Word { tag: u8, bit: u8 },
    RunCount { tag: u8 },
    Zeroes(usize),
    Verbatim(usize),
}

/// An `AsyncBufRead` wrapper that unpacks packed data. Unlike the blocking version, reads
/// may end anywhere, including inside a run.
pub struct PackedRead<R>
where
    R: AsyncBufRead + Unpin,
{
    inner: R,
    stage: PackedReadStage,
}

impl<R> PackedRead<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            stage: PackedReadStage::Tag,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Polls for one input byte. `Ready(None)` is end of input.
fn poll_byte<R>(inner: &mut R, cx: &mut Context<'_>) -> Poll<io::Result<Option<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let byte = match Pin::new(&mut *inner).poll_fill_buf(cx) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        Poll::Ready(Ok(buf)) => buf.first().copied(),
    };
    if byte.is_some() {
        Pin::new(inner).consume(1);
    }
    Poll::Ready(Ok(byte))
}

impl<R> AsyncRead for PackedRead<R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let PackedRead { inner, stage } = &mut *self;
        let mut pos = 0;

        // Returns what was produced so far, or `Pending` if nothing was.
        macro_rules! ready_byte {
            ($clean_eof:expr) => {
                match poll_byte(inner, cx) {
                    Poll::Pending if pos > 0 => return Poll::Ready(Ok(pos)),
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(None)) if $clean_eof => return Poll::Ready(Ok(pos)),
                    Poll::Ready(Ok(None)) => return Poll::Ready(Err(premature_end())),
                    Poll::Ready(Ok(Some(b))) => b,
                }
            };
        }

        while pos < out.len() {
            match *stage {
                PackedReadStage::Tag => {
                    let tag = ready_byte!(true);
                    *stage = PackedReadStage::Word { tag, bit: 0 };
                }
                PackedReadStage::Word { tag, bit } => {
                    if bit == 8 {
                        *stage = if tag == 0 || tag == 0xff {
                            PackedReadStage::RunCount { tag }
                        } else {
                            PackedReadStage::Tag
                        };
                        continue;
                    }
                    out[pos] = if tag & (1 << bit) != 0 {
                        ready_byte!(false)
                    } else {
                        0
                    };
                    pos += 1;
                    *stage = PackedReadStage::Word { tag, bit: bit + 1 };
                }
                PackedReadStage::RunCount { tag } => {
                    let count = usize::from(ready_byte!(false)) * 8;
                    *stage = if tag == 0 {
                        PackedReadStage::Zeroes(count)
                    } else {
                        PackedReadStage::Verbatim(count)
                    };
                }
                PackedReadStage::Zeroes(0) | PackedReadStage::Verbatim(0) => {
                    *stage = PackedReadStage::Tag;
                }
                PackedReadStage::Zeroes(remaining) => {
                    let n = remaining.min(out.len() - pos);
                    out[pos..pos + n].fill(0);
                    pos += n;
                    *stage = PackedReadStage::Zeroes(remaining - n);
                }
                PackedReadStage::Verbatim(remaining) => {
                    let n = match Pin::new(&mut *inner).poll_fill_buf(cx) {
                        Poll::Pending if pos > 0 => return Poll::Ready(Ok(pos)),
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok([])) => return Poll::Ready(Err(premature_end())),
                        Poll::Ready(Ok(buf)) => {
                            let n = buf.len().min(remaining).min(out.len() - pos);
                            out[pos..pos + n].copy_from_slice(&buf[..n]);
                            n
                        }
                    };
                    Pin::new(&mut *inner).consume(n);
                    pos += n;
                    *stage = PackedReadStage::Verbatim(remaining - n);
                }
            }
        }
        Poll::Ready(Ok(pos))
    }
}

/// Asynchronously reads a packed message from `read`. Returns `None` if `read` has zero bytes
/// left.
pub async fn try_read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: AsyncBufRead + Unpin,
{
    crate::serialize::try_read_message(PackedRead::new(read), options).await
}

/// Asynchronously reads a packed message from `read`.
pub async fn read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: AsyncBufRead + Unpin,
{
    crate::serialize::read_message(PackedRead::new(read), options).await
}

/// An `AsyncWrite` wrapper that packs the words passed to each `poll_write()` call on their
/// own, so that runs never span two writes. Trailing bytes of a partial word are held until
/// the rest of the word arrives.
pub struct PackedWrite<W>
where
    W: AsyncWrite + Unpin,
{
    inner: W,
    staging: Vec<u8>,
    packed: Vec<u8>,
    packed_pos: usize,
}

impl<W> PackedWrite<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            staging: Vec::new(),
            packed: Vec::new(),
            packed_pos: 0,
        }
    }

    /// Pushes already packed bytes into `inner`.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.packed_pos < self.packed.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.packed[self.packed_pos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write packed data",
                    )))
                }
                Poll::Ready(Ok(n)) => self.packed_pos += n,
            }
        }
        self.packed.clear();
        self.packed_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W> AsyncWrite for PackedWrite<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        if !this.packed.is_empty() {
            return Poll::Pending;
        }

        this.staging.extend_from_slice(buf);
        let whole = this.staging.len() / 8 * 8;
        pack_words(&this.staging[..whole], &mut this.packed);
        this.staging.drain(..whole);

        // Start pushing right away; whatever is left goes out on the next call.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_close(cx),
            other => other,
        }
    }
}

/// Resolves once every packed byte has been handed to the inner writer.
struct FinishPendingWrites<W>
where
    W: AsyncWrite + Unpin,
{
    inner: PackedWrite<W>,
}

impl<W> Future for FinishPendingWrites<W>
where
    W: AsyncWrite + Unpin,
{
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner.poll_drain(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => Poll::Ready(result.map_err(Error::from)),
        }
    }
}

/// Writes the provided message to `writer` in packed form. Does not call `flush()`.
pub async fn write_message<W, M>(writer: W, message: M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let mut packed_write = PackedWrite::new(writer);
    crate::serialize::write_message(&mut packed_write, message).await?;
    FinishPendingWrites {
        inner: packed_write,
    }
    .await
}

#[cfg(test)]
mod test {
    use capwire::message::{self, ReaderSegments};
    use capwire::{serialize_packed as sync_packed, ErrorKind};
    use futures::io::{AsyncReadExt, BufReader, Cursor};
    use quickcheck::{quickcheck, TestResult};

    use super::{read_message, try_read_message, write_message, PackedRead};
    use crate::serialize::test::{TestSegments, Trickle};
    use crate::serialize::AsOutputSegments;

    fn unpack_in_chunks(packed: &[u8], chunk: usize) -> std::result::Result<Vec<u8>, ErrorKind> {
        let reader = BufReader::with_capacity(
            chunk.max(1),
            Trickle::new(Cursor::new(packed.to_vec()), chunk),
        );
        let mut packed_read = PackedRead::new(reader);
        let mut out = Vec::new();
        futures::executor::block_on(packed_read.read_to_end(&mut out))
            .map_err(|e| capwire::Error::from(e).kind)?;
        Ok(out)
    }

    #[test]
    fn unpack_simple() {
        assert_eq!(unpack_in_chunks(&[0, 0], 1).unwrap(), vec![0; 8]);
        assert_eq!(unpack_in_chunks(&[0, 2], 3).unwrap(), vec![0; 24]);
        assert_eq!(
            unpack_in_chunks(&[0x24, 12, 34], 2).unwrap(),
            vec![0, 0, 12, 0, 0, 34, 0, 0]
        );
        assert_eq!(
            unpack_in_chunks(&[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0], 1).unwrap(),
            vec![1, 3, 2, 4, 5, 7, 6, 8]
        );
    }

    #[test]
    fn verbatim_run_spans_reads() {
        let packed = [
            0xff, 1, 2, 3, 4, 5, 6, 7, 8, 2, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21,
            22, 23, 24,
        ];
        let expected: Vec<u8> = (1..=24).collect();
        for chunk in 1..7 {
            assert_eq!(unpack_in_chunks(&packed, chunk).unwrap(), expected);
        }
    }

    #[test]
    fn truncated_input() {
        assert_eq!(
            unpack_in_chunks(&[0x24, 12], 1),
            Err(ErrorKind::PrematureEndOfPackedInput)
        );
        assert_eq!(
            unpack_in_chunks(&[0xff, 1, 2, 3, 4, 5, 6, 7, 8, 1, 9], 4),
            Err(ErrorKind::PrematureEndOfPackedInput)
        );
        assert_eq!(
            unpack_in_chunks(&[0], 4),
            Err(ErrorKind::PrematureEndOfPackedInput)
        );
    }

    #[test]
    fn empty_stream() {
        let result = futures::executor::block_on(try_read_message(
            Cursor::new(Vec::<u8>::new()),
            message::ReaderOptions::new(),
        ))
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn check_round_trip_async() {
        fn round_trip(segments: Vec<Vec<u64>>, chunk: usize) -> TestResult {
            if segments.is_empty() || segments.len() > 512 {
                return TestResult::discard();
            }
            let segments = TestSegments::from_words(segments);

            let mut packed = Vec::new();
            futures::executor::block_on(write_message(
                Trickle::new(Cursor::new(&mut packed), chunk % 11),
                &segments,
            ))
            .unwrap();

            // The packed bytes are exactly what the blocking writer produces.
            let mut expected = Vec::new();
            sync_packed::write_message_segments(&mut expected, &segments.as_output_segments())
                .unwrap();
            if packed != expected {
                return TestResult::failed();
            }

            let reader = BufReader::with_capacity(
                (chunk % 7).max(1),
                Trickle::new(Cursor::new(packed), chunk % 5),
            );
            let mut options = message::ReaderOptions::new();
            options.traversal_limit_in_words(u64::MAX);
            let message = futures::executor::block_on(read_message(reader, options)).unwrap();
            let read_back: Vec<Vec<u8>> = (0..message.segments().len() as u32)
                .filter_map(|id| message.segments().get_segment(id))
                .map(|s| s.to_vec())
                .collect();
            TestResult::from_bool(read_back == segments.0)
        }

        quickcheck(round_trip as fn(Vec<Vec<u64>>, usize) -> TestResult);
    }
}
