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

//! Capabilities, requests and pipelines that fail every operation with a fixed error.

use capwire::any_pointer;
use capwire::capability::{Promise, RemotePromise};
use capwire::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, RequestHook, ResultsHook,
};
use capwire::{Error, MessageSize};

use std::rc::Rc;

pub struct Pipeline {
    error: Error,
}

impl Pipeline {
    pub fn new(error: Error) -> Self {
        Self { error }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(Self::new(self.error.clone()))
    }

    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        new_cap(self.error.clone())
    }
}

/// A request whose parameters can still be filled in, but whose `send()` fails.
pub struct Request {
    error: Error,
    message: capwire::message::Builder<capwire::message::HeapAllocator>,
}

impl Request {
    pub fn new(error: Error, _size_hint: Option<MessageSize>) -> Self {
        Self {
            error,
            message: capwire::message::Builder::new_default(),
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

    fn send(self: Box<Self>) -> RemotePromise {
        let pipeline = Pipeline::new(self.error.clone());
        RemotePromise {
            promise: Promise::err(self.error),
            pipeline: any_pointer::Pipeline::new(Box::new(pipeline)),
        }
    }
}

struct ClientInner {
    error: Error,
    brand: usize,
}

pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    pub fn new(error: Error, brand: usize) -> Self {
        Self {
            inner: Rc::new(ClientInner { error, brand }),
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(Self {
            inner: self.inner.clone(),
        })
    }

    fn new_call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> capwire::capability::Request {
        capwire::capability::Request::new(Box::new(Request::new(
            self.inner.error.clone(),
            size_hint,
        )))
    }

    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Box<dyn ParamsHook>,
        _results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        Promise::err(self.inner.error.clone())
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn get_brand(&self) -> usize {
        self.inner.brand
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        Promise::err(self.inner.error.clone())
    }
}

/// A capability that fails every call with `error`.
pub fn new_cap(error: Error) -> Box<dyn ClientHook> {
    Box::new(Client::new(error, 0))
}

#[cfg(test)]
mod test {
    use capwire::ErrorKind;
    use futures::executor::block_on;

    #[test]
    fn calls_fail_with_the_stored_error() {
        let cap = super::new_cap(capwire::Error::disconnected("gone".into()));
        let mut request = cap.new_call(0x1234, 0, None);
        request.get().unwrap().set_as("ignored").unwrap();
        let remote = request.send();
        let pipelined = remote.pipeline.get_pointer_field(0).as_cap();

        match block_on(remote.promise) {
            Err(e) => assert_eq!(e.kind, ErrorKind::Disconnected),
            Ok(_) => panic!("expected an error"),
        }
        assert_eq!(
            block_on(pipelined.when_resolved()).map_err(|e| e.kind),
            Err(ErrorKind::Disconnected)
        );
    }
}
