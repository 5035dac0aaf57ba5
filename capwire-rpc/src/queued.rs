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

//! Promises for capabilities and pipelines that are not known yet. Calls made before the
//! resolution are queued, then forwarded in order once it arrives.

use capwire::capability::Promise;
use capwire::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, ResultsHook,
};
use capwire::{Error, MessageSize};

use futures::future::Shared;
use futures::{Future, FutureExt, TryFutureExt};

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::sender_queue::SenderQueue;
use crate::{broken, local};

type QueuedCall = (u64, u16, Box<dyn ParamsHook>, Box<dyn ResultsHook>);

pub struct PipelineInner {
    /// Set once the real pipeline is known.
    redirect: Option<Box<dyn PipelineHook>>,

    promise_to_drive: Shared<Promise<(), Error>>,

    clients_to_resolve: SenderQueue<(Weak<RefCell<ClientInner>>, Vec<PipelineOp>), ()>,
}

impl PipelineInner {
    fn resolve(this: &Rc<RefCell<Self>>, pipeline: Box<dyn PipelineHook>) {
        if this.borrow().redirect.is_some() {
            return;
        }
        this.borrow_mut().redirect = Some(pipeline.add_ref());

        let waiting: Vec<_> = this.borrow_mut().clients_to_resolve.drain().collect();
        for ((weak_client, ops), waiter) in waiting {
            if let Some(client) = weak_client.upgrade() {
                ClientInner::resolve(&client, Ok(pipeline.get_pipelined_cap_move(ops)));
            }
            let _ = waiter.send(());
        }

        this.borrow_mut().promise_to_drive = Promise::ok(()).shared();
    }
}

/// Completes a queued `Pipeline`. Dropping it unused breaks the pipeline.
pub struct PipelineInnerSender {
    inner: Option<Weak<RefCell<PipelineInner>>>,
}

impl PipelineInnerSender {
    pub fn complete(mut self, pipeline: Box<dyn PipelineHook>) {
        if let Some(inner) = self.inner.take().and_then(|weak| weak.upgrade()) {
            PipelineInner::resolve(&inner, pipeline);
        }
    }

    pub fn reject(mut self, error: Error) {
        if let Some(inner) = self.inner.take().and_then(|weak| weak.upgrade()) {
            PipelineInner::resolve(&inner, Box::new(broken::Pipeline::new(error)));
        }
    }
}

impl Drop for PipelineInnerSender {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take().and_then(|weak| weak.upgrade()) {
            let error = Error::failed("pipeline was never completed".into());
            PipelineInner::resolve(&inner, Box::new(broken::Pipeline::new(error)));
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Rc<RefCell<PipelineInner>>,
}

impl Pipeline {
    pub fn new() -> (PipelineInnerSender, Self) {
        let inner = Rc::new(RefCell::new(PipelineInner {
            redirect: None,
            promise_to_drive: Promise::ok(()).shared(),
            clients_to_resolve: SenderQueue::new(),
        }));
        let sender = PipelineInnerSender {
            inner: Some(Rc::downgrade(&inner)),
        };
        (sender, Self { inner })
    }

    /// Makes calls on capabilities taken from this pipeline also poll `promise`.
    pub fn drive<F>(&mut self, promise: F)
    where
        F: Future<Output = Result<(), Error>> + Unpin + 'static,
    {
        let previous = self.inner.borrow().promise_to_drive.clone();
        let joined = futures::future::try_join(previous, promise).map_ok(|_| ());
        self.inner.borrow_mut().promise_to_drive = Promise::from_future(joined).shared();
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        self.get_pipelined_cap_move(ops.into())
    }

    fn get_pipelined_cap_move(&self, ops: Vec<PipelineOp>) -> Box<dyn ClientHook> {
        if let Some(redirect) = &self.inner.borrow().redirect {
            return redirect.get_pipelined_cap_move(ops);
        }

        let mut client = Client::new(Some(self.inner.clone()));
        client.drive(self.inner.borrow().promise_to_drive.clone());
        let weak_client = Rc::downgrade(&client.inner);
        self.inner
            .borrow_mut()
            .clients_to_resolve
            .push_detach((weak_client, ops));
        Box::new(client)
    }
}

pub struct ClientInner {
    /// Set once the real capability is known.
    redirect: Option<Box<dyn ClientHook>>,

    /// Keeps the pipeline this client came from alive until the client resolves.
    pipeline_inner: Option<Rc<RefCell<PipelineInner>>>,

    promise_to_drive: Option<Shared<Promise<(), Error>>>,

    /// Drained on resolution, before `client_resolution_queue`, so that calls queued earlier
    /// reach the target before calls made by code reacting to the resolution.
    call_forwarding_queue: SenderQueue<QueuedCall, Promise<(), Error>>,

    client_resolution_queue: SenderQueue<(), Box<dyn ClientHook>>,
}

impl ClientInner {
    pub fn resolve(state: &Rc<RefCell<Self>>, result: Result<Box<dyn ClientHook>, Error>) {
        if state.borrow().redirect.is_some() {
            return;
        }
        let client = match result {
            Ok(hook) => hook,
            Err(e) => broken::new_cap(e),
        };
        state.borrow_mut().redirect = Some(client.add_ref());

        let queued_calls: Vec<_> = state.borrow_mut().call_forwarding_queue.drain().collect();
        if !queued_calls.is_empty() {
            tracing::trace!(count = queued_calls.len(), "forwarding queued calls");
        }
        for ((interface_id, method_id, params, results), waiter) in queued_calls {
            let _ = waiter.send(client.call(interface_id, method_id, params, results));
        }

        let waiters: Vec<_> = state.borrow_mut().client_resolution_queue.drain().collect();
        for ((), waiter) in waiters {
            let _ = waiter.send(client.add_ref());
        }

        let mut state = state.borrow_mut();
        state.promise_to_drive = None;
        state.pipeline_inner = None;
    }
}

pub struct Client {
    pub inner: Rc<RefCell<ClientInner>>,
}

impl Client {
    pub fn new(pipeline_inner: Option<Rc<RefCell<PipelineInner>>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ClientInner {
                redirect: None,
                pipeline_inner,
                promise_to_drive: None,
                call_forwarding_queue: SenderQueue::new(),
                client_resolution_queue: SenderQueue::new(),
            })),
        }
    }

    /// Makes calls on this client also poll `promise`, which is expected to resolve it.
    pub fn drive<F>(&mut self, promise: F)
    where
        F: Future<Output = Result<(), Error>> + Unpin + 'static,
    {
        self.inner.borrow_mut().promise_to_drive = Some(Promise::from_future(promise).shared());
    }

    fn with_drive<T: 'static>(&self, promise: Promise<T, Error>) -> Promise<T, Error> {
        match &self.inner.borrow().promise_to_drive {
            Some(drive) => Promise::from_future(
                futures::future::try_join(drive.clone(), promise).map_ok(|((), v)| v),
            ),
            None => promise,
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
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> capwire::capability::Request {
        capwire::capability::Request::new(Box::new(local::Request::new(
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
        if let Some(client) = &self.inner.borrow().redirect {
            return client.call(interface_id, method_id, params, results);
        }

        let forwarded = self
            .inner
            .borrow_mut()
            .call_forwarding_queue
            .push((interface_id, method_id, params, results));
        let inner = self.inner.clone();
        let forwarded = forwarded
            .map(move |call| {
                drop(inner);
                call
            })
            .and_then(|call| call);
        self.with_drive(Promise::from_future(forwarded))
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        self.inner.borrow().redirect.as_ref().map(|c| c.add_ref())
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        if let Some(client) = &self.inner.borrow().redirect {
            return Some(Promise::ok(client.add_ref()));
        }
        let promise = self.inner.borrow_mut().client_resolution_queue.push(());
        Some(self.with_drive(promise))
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        crate::rpc::default_when_resolved_impl(self)
    }
}

#[cfg(test)]
mod test {
    use super::{Client, ClientInner, Pipeline};
    use capwire::capability::{Params, Promise, Results, Server};
    use capwire::private::capability::{ClientHook, PipelineHook, PipelineOp};
    use capwire::Error;
    use futures::executor::block_on;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl Server for Recorder {
        fn dispatch_call(
            &mut self,
            _interface_id: u64,
            _method_id: u16,
            params: Params,
            _results: Results,
        ) -> Promise<(), Error> {
            let text = capwire::pry!(capwire::pry!(params.get()).get_as::<&str>());
            self.0.borrow_mut().push(text.to_string());
            Promise::ok(())
        }
    }

    #[test]
    fn queued_calls_are_forwarded_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let queued = Client::new(None);
        let mut promises = Vec::new();
        for word in ["a", "b", "c"] {
            let mut request = queued.new_call(0, 0, None);
            request.set(word).unwrap();
            promises.push(request.send().promise);
        }
        assert!(queued.get_resolved().is_none());

        let target = crate::local::Client::new(Box::new(Recorder(log.clone())));
        ClientInner::resolve(&queued.inner, Ok(Box::new(target)));
        for promise in promises {
            block_on(promise).unwrap();
        }
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(queued.get_resolved().is_some());
    }

    #[test]
    fn unfinished_pipeline_breaks_its_caps() {
        let (sender, pipeline) = Pipeline::new();
        let cap = pipeline.get_pipelined_cap(&[PipelineOp::GetPointerField(0)]);
        drop(sender);
        assert!(block_on(cap.when_resolved()).is_err());
    }
}
