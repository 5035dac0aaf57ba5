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

//! Capability handles and the promise type that RPC calls complete through.
//!
//! The types here are untyped: parameters and results are `any_pointer` values. Code that
//! knows the interface narrows them with `get_as`, or with `get_as_struct` and a schema table.

use core::future::Future;
use core::pin::Pin;
use core::task::Poll;

use crate::any_pointer;
use crate::private::capability::{ClientHook, ParamsHook, RequestHook, ResponseHook, ResultsHook};
use crate::private::layout::{PointerBuilder, PointerReader};
use crate::traits::{FromPointerReader, SetPointerBuilder};
use crate::{Error, MessageSize};

/// A computation that might eventually resolve to a value of type `T` or to an error
///  of type `E`. Dropping the promise cancels the computation.
#[must_use = "futures do nothing unless polled"]
pub struct Promise<T, E> {
    inner: PromiseInner<T, E>,
}

enum PromiseInner<T, E> {
    Immediate(Result<T, E>),
    Deferred(Pin<Box<dyn Future<Output = core::result::Result<T, E>> + 'static>>),
    Empty,
}

// Allow Promise<T,E> to be Unpin, regardless of whether T and E are.
impl<T, E> Unpin for PromiseInner<T, E> {}

impl<T, E> Promise<T, E> {
    pub fn ok(value: T) -> Self {
        Self {
            inner: PromiseInner::Immediate(Ok(value)),
        }
    }

    pub fn err(error: E) -> Self {
        Self {
            inner: PromiseInner::Immediate(Err(error)),
        }
    }

    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = core::result::Result<T, E>> + 'static,
    {
        Self {
            inner: PromiseInner::Deferred(Box::pin(f)),
        }
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = core::result::Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut core::task::Context) -> Poll<Self::Output> {
        match self.get_mut().inner {
            PromiseInner::Empty => panic!("Promise polled after done."),
            ref mut imm @ PromiseInner::Immediate(_) => {
                match core::mem::replace(imm, PromiseInner::Empty) {
                    PromiseInner::Immediate(r) => Poll::Ready(r),
                    _ => unreachable!(),
                }
            }
            PromiseInner::Deferred(ref mut f) => f.as_mut().poll(cx),
        }
    }
}

/// Like `try!()`, but for functions that return a `Promise<T, E>` rather than a `Result<T, E>`.
///
/// Unwraps a `Result<T, E>`. In the case of an error `Err(e)`, immediately returns from the
/// enclosing function with `Promise::err(e)`.
#[macro_export]
macro_rules! pry {
    ($expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(val) => val,
            ::core::result::Result::Err(err) => {
                return $crate::capability::Promise::err(::core::convert::From::from(err))
            }
        }
    };
}

/// A promise for a result from a method call, plus a pipeline through which capabilities in
/// that result can be called before it arrives.
#[must_use]
pub struct RemotePromise {
    pub promise: Promise<Response, Error>,
    pub pipeline: any_pointer::Pipeline,
}

/// A response from a method call, as seen by the client.
pub struct Response {
    pub hook: Box<dyn ResponseHook>,
}

impl Response {
    pub fn new(hook: Box<dyn ResponseHook>) -> Self {
        Self { hook }
    }

    pub fn get(&self) -> crate::Result<any_pointer::Reader<'_>> {
        self.hook.get()
    }
}

/// A method call that has not been sent yet.
pub struct Request {
    pub hook: Box<dyn RequestHook>,
}

impl Request {
    pub fn new(hook: Box<dyn RequestHook>) -> Self {
        Self { hook }
    }

    /// The parameter struct, to be filled in before `send()`.
    pub fn get(&mut self) -> crate::Result<any_pointer::Builder<'_>> {
        self.hook.get()
    }

    pub fn set<T: SetPointerBuilder>(&mut self, from: T) -> crate::Result<()> {
        self.hook.get()?.set_as(from)
    }

    pub fn send(self) -> RemotePromise {
        self.hook.send()
    }
}

/// The values of the parameters passed to a method call, as seen by the server.
pub struct Params {
    pub hook: Box<dyn ParamsHook>,
}

impl Params {
    pub fn new(hook: Box<dyn ParamsHook>) -> Self {
        Self { hook }
    }

    pub fn get(&self) -> crate::Result<any_pointer::Reader<'_>> {
        self.hook.get()
    }
}

/// The return values of a method, written in-place by the method body.
pub struct Results {
    pub hook: Box<dyn ResultsHook>,
}

impl Results {
    pub fn new(hook: Box<dyn ResultsHook>) -> Self {
        Self { hook }
    }

    pub fn get(&mut self) -> crate::Result<any_pointer::Builder<'_>> {
        self.hook.get()
    }

    pub fn set<T: SetPointerBuilder>(&mut self, other: T) -> crate::Result<()> {
        self.hook.get()?.set_as(other)
    }
}

pub trait FromClientHook {
    /// Wraps a client hook to create a new client.
    fn new(hook: Box<dyn ClientHook>) -> Self;

    /// Unwraps client to get the underlying client hook.
    fn into_client_hook(self) -> Box<dyn ClientHook>;

    /// Gets a reference to the underlying client hook.
    fn as_client_hook(&self) -> &dyn ClientHook;
}

/// An untyped client.
pub struct Client {
    pub hook: Box<dyn ClientHook>,
}

impl Client {
    pub fn new(hook: Box<dyn ClientHook>) -> Self {
        Self { hook }
    }

    pub fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> Request {
        self.hook.new_call(interface_id, method_id, size_hint)
    }

    /// If the capability is actually only a promise, the returned promise resolves once the
    /// capability itself has resolved to its final destination (or propagates the exception if
    /// the capability promise is rejected). There is no reason to wait for this before making
    /// calls; if the capability does not resolve, the call results will propagate the error.
    pub fn when_resolved(&self) -> Promise<(), Error> {
        self.hook.when_resolved()
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }
}

impl FromClientHook for Client {
    fn new(hook: Box<dyn ClientHook>) -> Self {
        Self { hook }
    }

    fn into_client_hook(self) -> Box<dyn ClientHook> {
        self.hook
    }

    fn as_client_hook(&self) -> &dyn ClientHook {
        &*self.hook
    }
}

impl<'a> FromPointerReader<'a> for Client {
    fn get_from_pointer(reader: &PointerReader<'a>) -> crate::Result<Self> {
        Ok(Self::new(reader.get_capability()?))
    }
}

impl SetPointerBuilder for Client {
    fn set_pointer_builder(self, mut pointer: PointerBuilder<'_>) -> crate::Result<()> {
        pointer.set_capability(self.hook);
        Ok(())
    }
}

/// An untyped server.
pub trait Server {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        params: Params,
        results: Results,
    ) -> Promise<(), Error>;
}
