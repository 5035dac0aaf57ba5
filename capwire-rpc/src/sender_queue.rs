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

//! A queue of values, each paired with a oneshot sender that completes the promise its pusher
//! holds. Dropping that promise withdraws the value from the queue.

use futures::channel::oneshot;
use futures::TryFutureExt;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use capwire::capability::Promise;
use capwire::Error;

struct Inner<In, Out> {
    next_id: u64,
    entries: BTreeMap<u64, (In, oneshot::Sender<Out>)>,
}

pub struct SenderQueue<In, Out> {
    inner: Rc<RefCell<Inner<In, Out>>>,
}

struct Remover<In, Out> {
    id: u64,
    inner: Weak<RefCell<Inner<In, Out>>>,
}

impl<In, Out> Drop for Remover<In, Out> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().entries.remove(&self.id);
        }
    }
}

impl<In, Out> SenderQueue<In, Out>
where
    In: 'static,
    Out: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Enqueues `value`. The returned promise completes when the entry is drained and answered.
    pub fn push(&mut self, value: In) -> Promise<Out, Error> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(value, tx);
        let remover = Remover {
            id,
            inner: Rc::downgrade(&self.inner),
        };
        Promise::from_future(
            rx.map_err(|_| Error::disconnected("queued request was dropped".into()))
                .map_ok(move |out| {
                    drop(remover);
                    out
                }),
        )
    }

    /// Enqueues `value` without anyone waiting on the answer.
    pub fn push_detach(&mut self, value: In) {
        let (tx, _rx) = oneshot::channel();
        self.insert(value, tx);
    }

    fn insert(&mut self, value: In, tx: oneshot::Sender<Out>) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, (value, tx));
        id
    }

    /// Takes every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = (In, oneshot::Sender<Out>)> {
        std::mem::take(&mut self.inner.borrow_mut().entries).into_values()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}

impl<In: 'static, Out: 'static> Default for SenderQueue<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}
