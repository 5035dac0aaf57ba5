//! In-memory byte pipes for exercising async readers and writers in tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures::{AsyncRead, AsyncWrite};

const DEFAULT_CAPACITY: usize = 8192;

#[derive(Debug)]
struct Inner {
    buffer: VecDeque<u8>,
    capacity: usize,
    write_end_closed: bool,
    read_end_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Inner {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panic in another test thread leaves the bytes intact.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// The writing end of a pipe. Dropping or closing it signals end of input to the reader.
pub struct Sender {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.write_end_closed = true;
        inner.wake_reader();
    }
}

/// The reading end of a pipe. Once it is dropped, writes fail.
pub struct Receiver {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.read_end_closed = true;
        inner.wake_writer();
    }
}

/// A one-way pipe holding at most `capacity` unread bytes.
pub fn channel_with_capacity(capacity: usize) -> (Sender, Receiver) {
    assert!(capacity > 0, "a pipe needs room for at least one byte");
    let inner = Arc::new(Mutex::new(Inner {
        buffer: VecDeque::with_capacity(capacity),
        capacity,
        write_end_closed: false,
        read_end_closed: false,
        read_waker: None,
        write_waker: None,
    }));
    let sender = Sender {
        inner: inner.clone(),
    };
    (sender, Receiver { inner })
}

pub fn channel() -> (Sender, Receiver) {
    channel_with_capacity(DEFAULT_CAPACITY)
}

/// One side of a two-way connection: what it reads and where it writes.
pub type Endpoint = (Receiver, Sender);

/// Two connected endpoints. Bytes written on one side are read on the other.
pub fn duplex() -> (Endpoint, Endpoint) {
    let (a_to_b, b_from_a) = channel();
    let (b_to_a, a_from_b) = channel();
    ((a_from_b, a_to_b), (b_from_a, b_to_a))
}

impl AsyncRead for Receiver {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = lock(&self.inner);
        if inner.buffer.is_empty() {
            if inner.write_end_closed {
                return Poll::Ready(Ok(0));
            }
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(inner.buffer.len());
        for (dst, src) in buf.iter_mut().zip(inner.buffer.drain(..n)) {
            *dst = src;
        }
        inner.wake_writer();
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for Sender {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = lock(&self.inner);
        if inner.read_end_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "read end closed",
            )));
        }
        if inner.write_end_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write end closed",
            )));
        }

        let room = inner.capacity - inner.buffer.len();
        if room == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = room.min(buf.len());
        inner.buffer.extend(&buf[..n]);
        inner.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = lock(&self.inner);
        inner.write_end_closed = true;
        inner.wake_reader();
        Poll::Ready(Ok(()))
    }
}
