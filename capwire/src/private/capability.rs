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

//! Object-safe hooks that the RPC layer implements behind the capability types.

use crate::any_pointer;
use crate::capability::{Promise, RemotePromise, Request};
use crate::MessageSize;

pub trait ResponseHook {
    fn get(&self) -> crate::Result<any_pointer::Reader<'_>>;
}

pub trait RequestHook {
    fn get(&mut self) -> crate::Result<any_pointer::Builder<'_>>;
    fn get_brand(&self) -> usize;
    fn send(self: Box<Self>) -> RemotePromise;
}

pub trait ClientHook {
    fn add_ref(&self) -> Box<dyn ClientHook>;

    fn new_call(&self, interface_id: u64, method_id: u16, size_hint: Option<MessageSize>) -> Request;

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), crate::Error>;

    /// If this capability is associated with an rpc connection, then this method
    /// returns an identifier for that connection.
    fn get_brand(&self) -> usize;

    /// Returns a (locally) unique identifier for this capability.
    fn get_ptr(&self) -> usize;

    /// If this hook is a promise that has already resolved, returns the resolved capability.
    /// Returns `None` if the hook isn't a promise or hasn't resolved yet; use
    /// `when_more_resolved()` to tell those apart.
    fn get_resolved(&self) -> Option<Box<dyn ClientHook>>;

    /// If this hook is a settled reference, returns `None`. Otherwise returns a promise for a
    /// hook that is one step closer to settled.
    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, crate::Error>>;

    /// Repeatedly calls `when_more_resolved()` until it returns `None`.
    fn when_resolved(&self) -> Promise<(), crate::Error>;
}

impl Clone for Box<dyn ClientHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

pub trait ResultsHook {
    fn get(&mut self) -> crate::Result<any_pointer::Builder<'_>>;
}

pub trait ParamsHook {
    fn get(&self) -> crate::Result<any_pointer::Reader<'_>>;
}

pub trait PipelineHook {
    fn add_ref(&self) -> Box<dyn PipelineHook>;
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook>;

    /// Version of get_pipelined_cap() passing the array by move. May avoid a copy in some cases.
    fn get_pipelined_cap_move(&self, ops: Vec<PipelineOp>) -> Box<dyn ClientHook> {
        self.get_pipelined_cap(&ops)
    }
}

impl Clone for Box<dyn PipelineHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

/// One step of a path from the root of a call's result to a capability inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}
