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

//! Two-party capability RPC over capwire messages.
//!
//! Capabilities are references to objects that may live on the other side of a connection.
//! Calls on them return a promise for the results together with a pipeline, so that calls on
//! capabilities inside results can be sent before the results arrive.
//!
//! # Example
//!
//! ```ignore
//! // Serve `server` on one side of a byte stream.
//! let network = twoparty::VatNetwork::new(reader, writer, twoparty::Side::Server,
//!                                         Default::default());
//! let rpc_system = RpcSystem::new(Box::new(network), Some(new_client(server)));
//!
//! // On the other side, ask for the bootstrap capability and call it.
//! let mut rpc_system = RpcSystem::new(Box::new(network), None);
//! let client: capability::Client = rpc_system.bootstrap(twoparty::Side::Server);
//! let mut request = client.new_call(INTERFACE_ID, 0, None);
//! request.set("ping")?;
//! let response = request.send().promise.await?;
//! ```

use capwire::capability::{self, FromClientHook, Promise};
use capwire::private::capability::ClientHook;
use capwire::{any_pointer, message, Error};
use futures::channel::oneshot;
use futures::{Future, FutureExt, TryFutureExt};
use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

pub use crate::rpc::{ConnectionMonitor, ConnectionPhase, Disconnector, TableSizes};
use crate::task_set::TaskSet;

pub mod rpc_capnp;

mod broken;
mod local;
mod queued;
mod rpc;
mod sender_queue;
mod task_set;
pub mod twoparty;

pub trait OutgoingMessage {
    /// The body of the message. The connection state fills it in as an `rpc_capnp::message`.
    fn get_body(&mut self) -> capwire::Result<any_pointer::Builder<'_>>;

    /// Read-only view of the body, used for logging and size checks.
    fn get_body_as_reader(&self) -> capwire::Result<any_pointer::Reader<'_>>;

    /// The capabilities written into the body so far, indexed as the body refers to them.
    fn cap_table(&self) -> Vec<Option<Box<dyn ClientHook>>>;

    /// Queues the message for sending. The promise resolves once it has been written;
    /// dropping it leaves the message queued.
    fn send(
        self: Box<Self>,
    ) -> (
        Promise<Rc<message::Builder<message::HeapAllocator>>, Error>,
        Rc<message::Builder<message::HeapAllocator>>,
    );

    /// Gives up the message without sending it.
    fn take(self: Box<Self>) -> message::Builder<message::HeapAllocator>;

    /// Total size of the message in words, summed over its segments.
    fn size_in_words(&self) -> usize;
}

pub trait IncomingMessage {
    /// The body of a received message.
    fn get_body(&self) -> capwire::Result<any_pointer::Reader<'_>>;

    /// Installs the capabilities that capability pointers in the body refer to.
    fn set_cap_table(&mut self, cap_table: Vec<Option<Box<dyn ClientHook>>>);
}

pub trait Connection<VatId> {
    /// Who is on the other end. Authenticating the peer is up to the network.
    fn get_peer_vat_id(&self) -> VatId;

    /// A fresh message to fill in and send. `first_segment_word_size` sizes the first
    /// segment when non-zero.
    fn new_outgoing_message(&mut self, first_segment_word_size: u32) -> Box<dyn OutgoingMessage>;

    /// The next message from the peer, or `None` once the stream has ended cleanly between
    /// messages.
    fn receive_incoming_message(&mut self) -> Promise<Option<Box<dyn IncomingMessage>>, Error>;

    /// Flushes what is queued, then closes the outgoing stream.
    fn shutdown(&mut self, result: capwire::Result<()>) -> Promise<(), Error>;

    /// Largest call message, in words, that may be sent on this connection. Larger calls fail
    /// locally with `ErrorKind::MessageTooLarge`.
    fn max_message_words(&self) -> Option<usize> {
        None
    }
}

pub trait VatNetwork<VatId> {
    /// A connection to `host_id`, or `None` when `host_id` is this vat.
    fn connect(&mut self, host_id: VatId) -> Option<Box<dyn Connection<VatId>>>;

    /// The next connection opened by a peer.
    fn accept(&mut self) -> Promise<Box<dyn Connection<VatId>>, Error>;

    /// Resolves when the network has shut down.
    fn drive_until_shutdown(&mut self) -> Promise<(), Error>;
}

/// A portal to objects available on the network.
///
/// The RPC implementation sits on top of an implementation of `VatNetwork`, which handles
/// establishing connections and the byte streams under them. `RpcSystem` is a future: it must
/// be polled for any of its connections to make progress. It completes when the network shuts
/// down.
#[must_use = "futures do nothing unless polled"]
pub struct RpcSystem<VatId>
where
    VatId: 'static,
{
    network: Box<dyn crate::VatNetwork<VatId>>,

    bootstrap_cap: Box<dyn ClientHook>,

    // One connection is enough for a two-party network.
    connection_state: Rc<RefCell<Option<Rc<rpc::ConnectionState<VatId>>>>>,

    tasks: TaskSet<Error>,
    handle: crate::task_set::TaskSetHandle<Error>,
}

impl<VatId> RpcSystem<VatId> {
    /// Constructs a new `RpcSystem` with the given network and bootstrap capability.
    pub fn new(
        mut network: Box<dyn crate::VatNetwork<VatId>>,
        bootstrap: Option<capability::Client>,
    ) -> Self {
        let bootstrap_cap = match bootstrap {
            Some(cap) => cap.hook,
            None => broken::new_cap(Error::failed("no bootstrap capability".to_string())),
        };
        let (mut handle, tasks) = TaskSet::new(Box::new(SystemTaskReaper));

        let mut handle1 = handle.clone();
        handle.add(network.drive_until_shutdown().then(move |r| {
            let r = match r {
                // A disconnect is how a connection normally ends.
                Err(e) if e.kind != capwire::ErrorKind::Disconnected => Err(e),
                _ => Ok(()),
            };
            tracing::debug!(ok = r.is_ok(), "rpc network shut down");
            handle1.terminate(r);
            Promise::ok(())
        }));

        let mut result = Self {
            network,
            bootstrap_cap,
            connection_state: Rc::new(RefCell::new(None)),

            tasks,
            handle: handle.clone(),
        };

        let accept_loop = result.accept_loop();
        handle.add(accept_loop);
        result
    }

    /// Connects to the given vat and returns its bootstrap capability. Connecting to the local
    /// vat returns the local bootstrap capability.
    pub fn bootstrap<T>(&mut self, vat_id: VatId) -> T
    where
        T: FromClientHook,
    {
        let Some(connection) = self.network.connect(vat_id) else {
            return T::new(self.bootstrap_cap.clone());
        };
        let connection_state = Self::get_connection_state(
            &self.connection_state,
            self.bootstrap_cap.clone(),
            connection,
            self.handle.clone(),
        );

        let hook = rpc::ConnectionState::bootstrap(&connection_state);
        T::new(hook)
    }

    // Not really a loop; a two-party network accepts at most one connection.
    fn accept_loop(&mut self) -> Promise<(), Error> {
        let connection_state_ref = self.connection_state.clone();
        let bootstrap_cap = self.bootstrap_cap.clone();
        let handle = self.handle.clone();
        Promise::from_future(self.network.accept().map_ok(move |connection| {
            Self::get_connection_state(&connection_state_ref, bootstrap_cap, connection, handle);
        }))
    }

    /// Returns the state held in `connection_state_ref`, creating it from `connection` first if
    /// there is none. The new connection's tasks go on `handle`.
    fn get_connection_state(
        connection_state_ref: &Rc<RefCell<Option<Rc<rpc::ConnectionState<VatId>>>>>,
        bootstrap_cap: Box<dyn ClientHook>,
        connection: Box<dyn crate::Connection<VatId>>,
        mut handle: crate::task_set::TaskSetHandle<Error>,
    ) -> Rc<rpc::ConnectionState<VatId>> {
        if let Some(connection_state) = connection_state_ref.borrow().as_ref() {
            return connection_state.clone();
        }

        let (on_disconnect_fulfiller, on_disconnect_promise) =
            oneshot::channel::<Promise<(), Error>>();
        let connection_state_ref1 = connection_state_ref.clone();
        handle.add(on_disconnect_promise.then(move |shutdown_promise| {
            *connection_state_ref1.borrow_mut() = None;
            match shutdown_promise {
                Ok(s) => s,
                Err(e) => Promise::err(Error::failed(format!("{e}"))),
            }
        }));
        let (tasks, result) =
            rpc::ConnectionState::new(bootstrap_cap, connection, on_disconnect_fulfiller);
        *connection_state_ref.borrow_mut() = Some(result.clone());
        handle.add(tasks);
        result
    }

    /// Returns a `Disconnector` future that can be run to cleanly close the connection to this
    /// `RpcSystem`'s network. Get the `Disconnector` before you spawn the `RpcSystem`.
    pub fn get_disconnector(&self) -> rpc::Disconnector<VatId> {
        rpc::Disconnector::new(self.connection_state.clone())
    }

    /// Where the current connection is in its lifecycle, or `None` when there is no connection
    /// yet or the last one has shut down.
    pub fn connection_phase(&self) -> Option<ConnectionPhase> {
        self.get_monitor().phase()
    }

    /// Sizes of the question, answer, export and import tables of the current connection.
    pub fn table_sizes(&self) -> Option<rpc::TableSizes> {
        self.get_monitor().table_sizes()
    }

    /// Returns a handle that keeps reporting on this system's connection after the system has
    /// been spawned.
    pub fn get_monitor(&self) -> rpc::ConnectionMonitor<VatId> {
        rpc::ConnectionMonitor::new(self.connection_state.clone())
    }
}

impl<VatId> Future for RpcSystem<VatId>
where
    VatId: 'static,
{
    type Output = Result<(), Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.tasks).poll(cx)
    }
}

/// Creates a client for a server living in this process.
pub fn new_client<S>(server: S) -> capability::Client
where
    S: capability::Server + 'static,
{
    capability::Client::new(Box::new(local::Client::new(Box::new(server))))
}

/// Creates a client that queues calls until `client_future` resolves, then forwards them to
/// its result. If it fails, queued and later calls fail with its error.
pub fn new_future_client<T>(
    client_future: impl Future<Output = Result<T, Error>> + 'static,
) -> T
where
    T: FromClientHook,
{
    let mut queued_client = crate::queued::Client::new(None);
    let weak_client = Rc::downgrade(&queued_client.inner);

    queued_client.drive(Box::pin(client_future.then(move |r| {
        if let Some(queued_inner) = weak_client.upgrade() {
            crate::queued::ClientInner::resolve(&queued_inner, r.map(|c| c.into_client_hook()));
        }
        Promise::ok(())
    })));

    T::new(Box::new(queued_client))
}

struct SystemTaskReaper;
impl crate::task_set::TaskReaper<Error> for SystemTaskReaper {
    fn task_failed(&mut self, error: Error) {
        tracing::warn!(error = %error, "rpc system task failed");
    }
}

pub(crate) fn canceled_to_error(_e: oneshot::Canceled) -> Error {
    Error::failed("oneshot was canceled".to_string())
}
