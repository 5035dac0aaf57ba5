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

//! A queue that writes messages to an `AsyncWrite` one at a time, in the order they were sent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use capwire::{Error, Result};
use futures::channel::{mpsc, oneshot};
use futures::future::Future;
use futures::{AsyncWrite, AsyncWriteExt, StreamExt, TryFutureExt};

use crate::serialize::AsOutputSegments;

enum Item<M>
where
    M: AsOutputSegments,
{
    Message(M, oneshot::Sender<M>),
    Done(Result<()>, oneshot::Sender<()>),
}

/// A handle that allows messages to be sent to a write queue.
pub struct Sender<M>
where
    M: AsOutputSegments,
{
    sender: mpsc::UnboundedSender<Item<M>>,
    in_flight: Arc<AtomicUsize>,
}

impl<M> Clone for Sender<M>
where
    M: AsOutputSegments,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Creates a new write queue that wraps the given `AsyncWrite`. The returned future drives
/// the writes and must be polled; it resolves when the queue is terminated or every `Sender`
/// is dropped, or with the first write error.
pub fn write_queue<W, M>(mut writer: W) -> (Sender<M>, impl Future<Output = Result<()>>)
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let (tx, mut rx) = mpsc::unbounded();
    let in_flight = Arc::new(AtomicUsize::new(0));

    let sender = Sender {
        sender: tx,
        in_flight: in_flight.clone(),
    };

    let queue = async move {
        while let Some(item) = rx.next().await {
            match item {
                Item::Message(m, returner) => {
                    let result = crate::serialize::write_message(&mut writer, &m).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "write queue failed");
                        return Err(e);
                    }
                    writer.flush().await?;
                    let _ = returner.send(m);
                }
                Item::Done(r, finisher) => {
                    tracing::trace!(ok = r.is_ok(), "write queue terminated");
                    let _ = finisher.send(());
                    return r;
                }
            }
        }
        Ok(())
    };

    (sender, queue)
}

impl<M> Sender<M>
where
    M: AsOutputSegments,
{
    /// Enqueues a message to be written. The returned future resolves to the message once
    /// the write has completed, or to an error if the queue stopped first.
    pub fn send(&mut self, message: M) -> impl Future<Output = Result<M>> + Unpin {
        let (complete, oneshot) = oneshot::channel();

        if self
            .sender
            .unbounded_send(Item::Message(message, complete))
            .is_ok()
        {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        }

        oneshot.map_err(|oneshot::Canceled| Error::disconnected("WriteQueue has terminated".into()))
    }

    /// Returns the number of messages queued but not yet written.
    pub fn len(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands the queue to stop writing messages once it is empty. After this method has been
    /// called, any new calls to `send()` return a future that resolves to an error. If `result`
    /// is an error, the queue future resolves to that error.
    pub fn terminate(&mut self, result: Result<()>) -> impl Future<Output = Result<()>> + Unpin {
        let (complete, receiver) = oneshot::channel();

        let _ = self.sender.unbounded_send(Item::Done(result, complete));

        receiver.map_err(|oneshot::Canceled| Error::disconnected("WriteQueue has terminated".into()))
    }
}

#[cfg(test)]
mod test {
    use capwire::{any_pointer, message, primitive_list, ErrorKind};
    use futures::io::Cursor;

    use super::write_queue;

    fn numbered(n: u32) -> message::Builder<message::HeapAllocator> {
        let mut message = message::Builder::new_default();
        {
            let mut list: primitive_list::Builder<u32> = message
                .init_root::<any_pointer::Builder>()
                .unwrap()
                .initn_as(1)
                .unwrap();
            list.set(0, n);
        }
        message
    }

    #[test]
    fn writes_in_order_and_counts_in_flight() {
        let mut out = Cursor::new(Vec::new());
        let (mut sender, queue) = write_queue(&mut out);

        let first = sender.send(numbered(1));
        let second = sender.send(numbered(2));
        assert_eq!(sender.len(), 2);
        let done = sender.terminate(Ok(()));
        let after = sender.send(numbered(3));

        futures::executor::block_on(async {
            let (q, a, b, d) = futures::join!(queue, first, second, done);
            q.unwrap();
            a.unwrap();
            b.unwrap();
            d.unwrap();
        });
        // The message sent after terminate() was never written.
        assert_eq!(sender.len(), 1);

        let err = futures::executor::block_on(after).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Disconnected);

        let bytes = out.into_inner();
        let mut expected = capwire::serialize::write_message_to_words(&numbered(1));
        expected.extend(capwire::serialize::write_message_to_words(&numbered(2)));
        assert_eq!(bytes, expected);
    }

    #[test]
    fn terminate_with_error() {
        let mut out = Cursor::new(Vec::new());
        let (mut sender, queue) =
            write_queue::<_, message::Builder<message::HeapAllocator>>(&mut out);
        let done = sender.terminate(Err(capwire::Error::failed("stop".into())));
        futures::executor::block_on(async {
            let (q, d) = futures::join!(queue, done);
            assert_eq!(q.err().unwrap().kind, ErrorKind::Failed);
            d.unwrap();
        });
    }
}
