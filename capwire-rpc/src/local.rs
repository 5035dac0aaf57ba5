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

//! Capabilities served in this process. Parameters and results live in ordinary message
//! builders; capabilities written into them are held by the builders' capability tables.

use capwire::capability::{self, Promise};
use capwire::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, RequestHook, ResponseHook, ResultsHook,
};
use capwire::{any_pointer, message, Error, MessageSize};

use futures::channel::oneshot;
use futures::{FutureExt, TryFutureExt};

use std::cell::RefCell;
use std::rc::Rc;


/// The filled-in results of a finished call.
pub trait ResultsDoneHook {
    fn add_ref(&self) -> Box<dyn ResultsDoneHook>;
    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>>;
}

impl Clone for Box<dyn ResultsDoneHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

pub struct Response {
    results: Box<dyn ResultsDoneHook>,
}

impl Response {
    pub fn new(results: Box<dyn ResultsDoneHook>) -> Self {
        Self { results }
    }
}

impl ResponseHook for Response {
    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        self.results.get()
    }
}

struct Params {
    request: message::Builder<message::HeapAllocator>,
}

impl ParamsHook for Params {
    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        self.request.get_root_as_reader()
    }
}

struct Results {
    message: Option<message::Builder<message::HeapAllocator>>,
    results_done_fulfiller: Option<oneshot::Sender<Box<dyn ResultsDoneHook>>>,
}

impl Results {
    fn new(fulfiller: oneshot::Sender<Box<dyn ResultsDoneHook>>) -> Self {
        Self {
            message: Some(message::Builder::new_default()),
            results_done_fulfiller: Some(fulfiller),
        }
    }
}

impl Drop for Results {
    fn drop(&mut self) {
        if let (Some(message), Some(fulfiller)) =
            (self.message.take(), self.results_done_fulfiller.take())
        {
            let _ = fulfiller.send(Box::new(ResultsDone::new(message)));
        }
    }
}

impl ResultsHook for Results {
    fn get(&mut self) -> capwire::Result<any_pointer::Builder<'_>> {
        match &mut self.message {
            Some(message) => message.get_root(),
            None => Err(Error::failed("results were already sent".into())),
        }
    }
}

struct ResultsDone {
    message: Rc<message::Builder<message::HeapAllocator>>,
}

impl ResultsDone {
    fn new(message: message::Builder<message::HeapAllocator>) -> Self {
        Self {
            message: Rc::new(message),
        }
    }
}

impl ResultsDoneHook for ResultsDone {
    fn add_ref(&self) -> Box<dyn ResultsDoneHook> {
        Box::new(Self {
            message: self.message.clone(),
        })
    }

    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        self.message.get_root_as_reader()
    }
}

pub struct Request {
    message: message::Builder<message::HeapAllocator>,
    interface_id: u64,
    method_id: u16,
    client: Box<dyn ClientHook>,
}

impl Request {
    pub fn new(
        interface_id: u64,
        method_id: u16,
        _size_hint: Option<MessageSize>,
        client: Box<dyn ClientHook>,
    ) -> Self {
        Self {
            message: message::Builder::new_default(),
            interface_id,
            method_id,
            client,
        }
    }
}

impl RequestHook for Request {
    fn get(&mut self) -> capwire::Result<any_pointer::Builder<'_>> {
        self.message.get_root()
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn send(self: Box<Self>) -> capability::RemotePromise {
        let Self {
            message,
            interface_id,
            method_id,
            client,
        } = *self;

        let (results_done_fulfiller, results_done_promise) = oneshot::channel();
        let call = client.call(
            interface_id,
            method_id,
            Box::new(Params { request: message }),
            Box::new(Results::new(results_done_fulfiller)),
        );
        let done = futures::future::try_join(
            call,
            results_done_promise.map_err(crate::canceled_to_error),
        )
        .map_ok(|((), results_done)| results_done);
        let done = Promise::<Box<dyn ResultsDoneHook>, Error>::from_future(done).shared();

        let (pipeline_sender, mut pipeline) = crate::queued::Pipeline::new();
        pipeline.drive(done.clone().map(move |result| {
            match result {
                Ok(results_done) => pipeline_sender.complete(Box::new(Pipeline::new(results_done))),
                Err(e) => pipeline_sender.reject(e),
            }
            Ok(())
        }));

        let promise = done.map_ok(|results_done| {
            capability::Response::new(Box::new(Response::new(results_done)))
        });
        capability::RemotePromise {
            promise: Promise::from_future(promise),
            pipeline: any_pointer::Pipeline::new(Box::new(pipeline)),
        }
    }
}

/// The pipeline of a call whose results are already here.
#[derive(Clone)]
pub struct Pipeline {
    results: Rc<dyn ResultsDoneHook>,
}

impl Pipeline {
    pub fn new(results: Box<dyn ResultsDoneHook>) -> Self {
        Self {
            results: Rc::from(results),
        }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        match self.results.get().and_then(|r| r.get_pipelined_cap(ops)) {
            Ok(cap) => cap,
            Err(e) => crate::broken::new_cap(e),
        }
    }
}

/// A capability backed by a `Server` in this process.
#[derive(Clone)]
pub struct Client {
    server: Rc<RefCell<Box<dyn capability::Server>>>,
}

impl Client {
    pub fn new(server: Box<dyn capability::Server>) -> Self {
        Self {
            server: Rc::new(RefCell::new(server)),
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> capability::Request {
        capability::Request::new(Box::new(Request::new(
            interface_id,
            method_id,
            size_hint,
            self.add_ref(),
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        // Dispatch happens on first poll, so the server sees no call before the caller holds
        // the promise.
        let server = self.server.clone();
        let dispatch = futures::future::lazy(move |_| {
            server.borrow_mut().dispatch_call(
                interface_id,
                method_id,
                capability::Params::new(params),
                capability::Results::new(results),
            )
        })
        .flatten();
        // The server stays alive until its handler finishes, even if the client is dropped.
        let this = self.add_ref();
        Promise::from_future(dispatch.map(move |result| {
            drop(this);
            result
        }))
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.server) as usize
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        Promise::ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Client;
    use capwire::capability::{Params, Promise, Results, Server};
    use capwire::private::capability::ClientHook;
    use capwire::Error;
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use futures::{FutureExt, TryFutureExt};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Doubler {
        calls: u32,
    }

    impl Server for Doubler {
        fn dispatch_call(
            &mut self,
            _interface_id: u64,
            method_id: u16,
            params: Params,
            mut results: Results,
        ) -> Promise<(), Error> {
            self.calls += 1;
            if method_id != 0 {
                return Promise::err(Error::unimplemented(format!("method {method_id}")));
            }
            let n: u64 = capwire::pry!(capwire::pry!(params.get()).get_as::<&str>())
                .parse()
                .unwrap_or(0);
            let reply = format!("{} after {} calls", n * 2, self.calls);
            capwire::pry!(results.set(&reply[..]));
            Promise::ok(())
        }
    }

    #[test]
    fn call_and_read_results() {
        let client = Client::new(Box::new(Doubler { calls: 0 }));
        let mut request = client.new_call(1, 0, None);
        request.set("21").unwrap();
        let response = block_on(request.send().promise).unwrap();
        assert_eq!(
            response.get().unwrap().get_as::<&str>().unwrap(),
            "42 after 1 calls"
        );
    }

    #[test]
    fn dispatch_waits_for_the_first_poll() {
        let client = Client::new(Box::new(Doubler { calls: 0 }));
        let mut first = client.new_call(1, 0, None);
        first.set("1").unwrap();
        let dropped = first.send();
        drop(dropped);

        let mut second = client.new_call(1, 0, None);
        second.set("2").unwrap();
        let response = block_on(second.send().promise).unwrap();
        assert_eq!(
            response.get().unwrap().get_as::<&str>().unwrap(),
            "4 after 1 calls"
        );
    }

    #[test]
    fn errors_reach_the_caller() {
        let client = Client::new(Box::new(Doubler { calls: 0 }));
        let request = client.new_call(1, 5, None);
        match block_on(request.send().promise) {
            Err(e) => assert_eq!(e.kind, capwire::ErrorKind::Unimplemented),
            Ok(_) => panic!("expected an error"),
        }
    }

    struct Gate {
        opened: Option<oneshot::Receiver<()>>,
        dropped: Rc<Cell<bool>>,
    }

    impl Drop for Gate {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    impl Server for Gate {
        fn dispatch_call(
            &mut self,
            _interface_id: u64,
            _method_id: u16,
            _params: Params,
            _results: Results,
        ) -> Promise<(), Error> {
            match self.opened.take() {
                Some(opened) => Promise::from_future(
                    opened.map_err(|_| Error::failed("gate dropped".to_string())),
                ),
                None => Promise::err(Error::failed("gate already used".to_string())),
            }
        }
    }

    #[test]
    fn server_outlives_its_client_while_a_call_runs() {
        let dropped = Rc::new(Cell::new(false));
        let (open, opened) = oneshot::channel();
        let client = Client::new(Box::new(Gate {
            opened: Some(opened),
            dropped: dropped.clone(),
        }));
        let mut promise = client.new_call(1, 0, None).send().promise;
        drop(client);

        assert!((&mut promise).now_or_never().is_none());
        assert!(!dropped.get());

        open.send(()).unwrap();
        assert!(block_on(promise).is_ok());
        assert!(dropped.get());
    }
}
