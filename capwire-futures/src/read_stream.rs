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

use std::pin::Pin;
use std::task::{Context, Poll};

use capwire::serialize::OwnedSegments;
use capwire::{message, Result};
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::Stream;
use futures::AsyncRead;

type PendingRead<R> = LocalBoxFuture<'static, (R, Result<Option<message::Reader<OwnedSegments>>>)>;

fn read_next<R>(mut reader: R, options: message::ReaderOptions) -> PendingRead<R>
where
    R: AsyncRead + Unpin + 'static,
{
    async move {
        let result = crate::serialize::try_read_message(&mut reader, options).await;
        (reader, result)
    }
    .boxed_local()
}

/// A stream of the messages read one after another from an `AsyncRead`. Ends at a clean end
/// of input, or right after yielding an error.
#[must_use = "streams do nothing unless polled"]
pub struct ReadStream<R>
where
    R: AsyncRead + Unpin + 'static,
{
    options: message::ReaderOptions,
    read: Option<PendingRead<R>>,
}

impl<R> ReadStream<R>
where
    R: AsyncRead + Unpin + 'static,
{
    pub fn new(reader: R, options: message::ReaderOptions) -> Self {
        ReadStream {
            read: Some(read_next(reader, options)),
            options,
        }
    }
}

impl<R> Stream for ReadStream<R>
where
    R: AsyncRead + Unpin + 'static,
{
    type Item = Result<message::Reader<OwnedSegments>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(read) = self.read.as_mut() else {
            return Poll::Ready(None);
        };
        let (reader, result) = match read.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(x) => x,
        };
        match result {
            Ok(Some(message)) => {
                self.read = Some(read_next(reader, self.options));
                Poll::Ready(Some(Ok(message)))
            }
            Ok(None) => {
                self.read = None;
                Poll::Ready(None)
            }
            Err(e) => {
                self.read = None;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use capwire::{any_pointer, message, primitive_list, ErrorKind};
    use futures::io::Cursor;
    use futures::StreamExt;

    use super::ReadStream;

    fn numbered(n: u64) -> message::Builder<message::HeapAllocator> {
        let mut message = message::Builder::new_default();
        {
            let mut list: primitive_list::Builder<u64> = message
                .init_root::<any_pointer::Builder>()
                .unwrap()
                .initn_as(1)
                .unwrap();
            list.set(0, n);
        }
        message
    }

    #[test]
    fn yields_each_message_then_ends() {
        let mut bytes = Vec::new();
        for n in 0..4 {
            capwire::serialize::write_message(&mut bytes, &numbered(n)).unwrap();
        }

        let stream = ReadStream::new(Cursor::new(bytes), message::ReaderOptions::new());
        let values: Vec<u64> = futures::executor::block_on(stream.collect::<Vec<_>>())
            .into_iter()
            .map(|m| {
                let m = m.unwrap();
                let list: primitive_list::Reader<u64> = m.get_root().unwrap();
                list.get(0)
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn stops_after_an_error() {
        let mut bytes = Vec::new();
        capwire::serialize::write_message(&mut bytes, &numbered(7)).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0, 5, 0, 0, 0, 1, 2]);

        let mut stream = ReadStream::new(Cursor::new(bytes), message::ReaderOptions::new());
        futures::executor::block_on(async {
            assert!(stream.next().await.unwrap().is_ok());
            let err = stream.next().await.unwrap().err().unwrap();
            assert_eq!(err.kind, ErrorKind::PrematureEndOfFile);
            assert!(stream.next().await.is_none());
        });
    }
}
