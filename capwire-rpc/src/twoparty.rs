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

//! An implementation of `VatNetwork` for the common case of a client-server connection.

use capwire::capability::Promise;
use capwire::message::{self, ReaderOptions};
use capwire::private::capability::ClientHook;
use futures::channel::oneshot;
use futures::{AsyncRead, AsyncWrite, FutureExt, TryFutureExt};

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type OutgoingBuilder = message::Builder<message::HeapAllocator>;

/// Which end of a two-party connection a vat is on. This is the `VatId` of a two-party
/// network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

pub type VatId = Side;

struct IncomingMessage {
    message: message::Reader<capwire::serialize::OwnedSegments>,
}

impl IncomingMessage {
    pub fn new(message: message::Reader<capwire::serialize::OwnedSegments>) -> Self {
        Self { message }
    }
}

impl crate::IncomingMessage for IncomingMessage {
    fn get_body(&self) -> capwire::Result<capwire::any_pointer::Reader<'_>> {
        self.message.get_root()
    }

    fn set_cap_table(&mut self, cap_table: Vec<Option<Box<dyn ClientHook>>>) {
        self.message.set_cap_table(cap_table)
    }
}

struct OutgoingMessage {
    message: OutgoingBuilder,
    sender: capwire_futures::Sender<Rc<OutgoingBuilder>>,
}

impl crate::OutgoingMessage for OutgoingMessage {
    fn get_body(&mut self) -> capwire::Result<capwire::any_pointer::Builder<'_>> {
        self.message.get_root()
    }

    fn get_body_as_reader(&self) -> capwire::Result<capwire::any_pointer::Reader<'_>> {
        self.message.get_root_as_reader()
    }

    fn cap_table(&self) -> Vec<Option<Box<dyn ClientHook>>> {
        self.message.cap_table().snapshot()
    }

    fn send(
        self: Box<Self>,
    ) -> (
        Promise<Rc<OutgoingBuilder>, capwire::Error>,
        Rc<OutgoingBuilder>,
    ) {
        let Self {
            message,
            mut sender,
        } = *self;
        let m = Rc::new(message);
        (Promise::from_future(sender.send(m.clone())), m)
    }

    fn take(self: Box<Self>) -> OutgoingBuilder {
        self.message
    }

    fn size_in_words(&self) -> usize {
        self.message.size_in_words()
    }
}

struct ConnectionInner<T>
where
    T: AsyncRead + 'static,
{
    input_stream: Rc<RefCell<Option<T>>>,
    sender: capwire_futures::Sender<Rc<OutgoingBuilder>>,
    side: Side,
    receive_options: ReaderOptions,
    on_disconnect_fulfiller: Option<oneshot::Sender<()>>,
}

struct Connection<T>
where
    T: AsyncRead + 'static,
{
    inner: Rc<RefCell<ConnectionInner<T>>>,
}

impl<T> Drop for ConnectionInner<T>
where
    T: AsyncRead,
{
    fn drop(&mut self) {
        if let Some(fulfiller) = self.on_disconnect_fulfiller.take() {
            let _ = fulfiller.send(());
        }
    }
}

impl<T> Connection<T>
where
    T: AsyncRead,
{
    fn new(
        input_stream: T,
        sender: capwire_futures::Sender<Rc<OutgoingBuilder>>,
        side: Side,
        receive_options: ReaderOptions,
        on_disconnect_fulfiller: oneshot::Sender<()>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConnectionInner {
                input_stream: Rc::new(RefCell::new(Some(input_stream))),
                sender,
                side,
                receive_options,
                on_disconnect_fulfiller: Some(on_disconnect_fulfiller),
            })),
        }
    }
}

impl<T> crate::Connection<Side> for Connection<T>
where
    T: AsyncRead + Unpin,
{
    fn get_peer_vat_id(&self) -> Side {
        match self.inner.borrow().side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    fn new_outgoing_message(
        &mut self,
        _first_segment_word_size: u32,
    ) -> Box<dyn crate::OutgoingMessage> {
        Box::new(OutgoingMessage {
            message: message::Builder::new_default(),
            sender: self.inner.borrow().sender.clone(),
        })
    }

    fn receive_incoming_message(
        &mut self,
    ) -> Promise<Option<Box<dyn crate::IncomingMessage>>, capwire::Error> {
        let inner = self.inner.borrow_mut();

        // The stream is parked here between reads, so at most one read is in flight.
        let maybe_input_stream = inner.input_stream.borrow_mut().take();
        let return_it_here = inner.input_stream.clone();
        match maybe_input_stream {
            Some(mut s) => {
                let receive_options = inner.receive_options;
                Promise::from_future(async move {
                    let maybe_message =
                        capwire_futures::serialize::try_read_message(&mut s, receive_options)
                            .await?;
                    *return_it_here.borrow_mut() = Some(s);
                    Ok(maybe_message.map(|message| {
                        Box::new(IncomingMessage::new(message)) as Box<dyn crate::IncomingMessage>
                    }))
                })
            }
            None => Promise::err(capwire::Error::failed(
                "a read is already in progress on this connection".into(),
            )),
        }
    }

    fn shutdown(&mut self, result: capwire::Result<()>) -> Promise<(), capwire::Error> {
        Promise::from_future(self.inner.borrow_mut().sender.terminate(result))
    }

    fn max_message_words(&self) -> Option<usize> {
        let limit = self.inner.borrow().receive_options.traversal_limit_in_words;
        Some(usize::try_from(limit).unwrap_or(usize::MAX))
    }
}

/// A vat network with two parties, the client and the server.
pub struct VatNetwork<T>
where
    T: AsyncRead + 'static + Unpin,
{
    // handed out by accept()
    connection: Option<Connection<T>>,

    // handed out by connect()
    weak_connection_inner: Weak<RefCell<ConnectionInner<T>>>,

    execution_driver: futures::future::Shared<Promise<(), capwire::Error>>,
    side: Side,
}

impl<T> VatNetwork<T>
where
    T: AsyncRead + Unpin,
{
    /// Creates a new two-party vat network that will receive data on `input_stream` and send
    /// data on `output_stream`.
    ///
    /// `side` does not change anything on the wire. It tells `RpcSystem::bootstrap` whether
    /// the bootstrap capability it asks for is local or remote.
    ///
    /// `receive_options` governs how incoming messages are read. Its traversal limit also caps
    /// the size of calls this side will send, so that both ends of a symmetric setup agree on
    /// what fits.
    pub fn new<U>(
        input_stream: T,
        output_stream: U,
        side: Side,
        receive_options: ReaderOptions,
    ) -> Self
    where
        U: AsyncWrite + 'static + Unpin,
    {
        let (fulfiller, disconnect_promise) = oneshot::channel();
        let disconnect_promise =
            disconnect_promise.map_err(|_| capwire::Error::disconnected("disconnected".into()));

        let (execution_driver, sender) = {
            let (tx, write_queue) = capwire_futures::write_queue(output_stream);

            // Wait for `disconnect_promise` even when the write queue fails, so that the
            // connection is gone before the driver completes.
            (
                Promise::from_future(write_queue.then(move |r| {
                    disconnect_promise
                        .then(move |_| futures::future::ready(r))
                        .map_ok(|_| ())
                }))
                .shared(),
                tx,
            )
        };

        let connection = Connection::new(input_stream, sender, side, receive_options, fulfiller);
        let weak_inner = Rc::downgrade(&connection.inner);
        Self {
            connection: Some(connection),
            weak_connection_inner: weak_inner,
            execution_driver,
            side,
        }
    }
}

impl<T> crate::VatNetwork<VatId> for VatNetwork<T>
where
    T: AsyncRead + Unpin,
{
    fn connect(&mut self, host_id: VatId) -> Option<Box<dyn crate::Connection<VatId>>> {
        if host_id == self.side {
            return None;
        }
        match self.weak_connection_inner.upgrade() {
            Some(connection_inner) => Some(Box::new(Connection {
                inner: connection_inner,
            })),
            None => {
                tracing::debug!(side = ?self.side, "two-party connection is already gone");
                None
            }
        }
    }

    fn accept(&mut self) -> Promise<Box<dyn crate::Connection<VatId>>, capwire::Error> {
        match self.connection.take() {
            Some(c) => Promise::ok(Box::new(c) as Box<dyn crate::Connection<VatId>>),
            None => Promise::from_future(futures::future::pending()),
        }
    }

    fn drive_until_shutdown(&mut self) -> Promise<(), capwire::Error> {
        Promise::from_future(self.execution_driver.clone())
    }
}

#[cfg(test)]
mod test {
    use super::{Side, VatNetwork};
    use crate::VatNetwork as _;
    use capwire::message::ReaderOptions;
    use futures::executor::block_on;

    fn network(
        side: Side,
        receive_options: ReaderOptions,
    ) -> VatNetwork<async_byte_channel::Receiver> {
        let (_, (read, write)) = async_byte_channel::duplex();
        VatNetwork::new(read, write, side, receive_options)
    }

    #[test]
    fn connect_to_own_side_is_local() {
        let mut network = network(Side::Client, ReaderOptions::new());
        assert!(network.connect(Side::Client).is_none());
        assert!(network.connect(Side::Server).is_some());
    }

    #[test]
    fn accept_hands_out_the_connection_once() {
        let mut network = network(Side::Server, ReaderOptions::new());
        let connection = block_on(network.accept()).unwrap();
        assert_eq!(connection.get_peer_vat_id(), Side::Client);
    }

    #[test]
    fn send_limit_follows_the_traversal_limit() {
        let mut options = ReaderOptions::new();
        options.traversal_limit_in_words = 1234;
        let mut network = network(Side::Client, options);
        let connection = network.connect(Side::Server).unwrap();
        assert_eq!(connection.max_message_words(), Some(1234));
    }

    #[test]
    fn outgoing_message_reports_its_caps_and_size() {
        let mut network = network(Side::Client, ReaderOptions::new());
        let mut connection = network.connect(Side::Server).unwrap();
        let mut message = connection.new_outgoing_message(0);
        message
            .get_body()
            .unwrap()
            .set_as_capability(crate::broken::new_cap(capwire::Error::failed("x".into())));
        let caps = message.cap_table();
        assert_eq!(caps.len(), 1);
        assert!(caps[0].is_some());
        assert!(message.size_in_words() > 0);
    }
}
