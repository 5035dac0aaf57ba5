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

//! A set of background tasks driven by a single future.

use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, Stream};

use std::pin::Pin;
use std::task::{Context, Poll};

type Task<E> = Pin<Box<dyn Future<Output = Result<(), E>>>>;

enum Enqueued<E> {
    Task(Task<E>),
    Terminate(Result<(), E>),
}

/// Hears how each task ended.
pub trait TaskReaper<E> {
    fn task_succeeded(&mut self) {}
    fn task_failed(&mut self, error: E);
}

/// Runs every task added through its handles. Completes when a handle calls `terminate()`, or
/// once all handles are gone and no tasks remain.
#[must_use = "a TaskSet does nothing unless polled"]
pub struct TaskSet<E> {
    enqueued: Option<mpsc::UnboundedReceiver<Enqueued<E>>>,
    in_progress: FuturesUnordered<Task<E>>,
    reaper: Box<dyn TaskReaper<E>>,
}

#[derive(Clone)]
pub struct TaskSetHandle<E> {
    sender: mpsc::UnboundedSender<Enqueued<E>>,
}

impl<E: 'static> TaskSet<E> {
    pub fn new(reaper: Box<dyn TaskReaper<E>>) -> (TaskSetHandle<E>, Self) {
        let (sender, receiver) = mpsc::unbounded();
        let set = Self {
            enqueued: Some(receiver),
            in_progress: FuturesUnordered::new(),
            reaper,
        };
        (TaskSetHandle { sender }, set)
    }
}

impl<E: 'static> TaskSetHandle<E> {
    /// Adds a task. Once the set has finished, the task is dropped unpolled.
    pub fn add<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + 'static,
    {
        let _ = self.sender.unbounded_send(Enqueued::Task(task.boxed_local()));
    }

    /// Makes the set complete with `result`, dropping the tasks still in it.
    pub fn terminate(&mut self, result: Result<(), E>) {
        let _ = self.sender.unbounded_send(Enqueued::Terminate(result));
    }
}

impl<E> Future for TaskSet<E> {
    type Output = Result<(), E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(enqueued) = &mut this.enqueued {
            loop {
                match Pin::new(&mut *enqueued).poll_next(cx) {
                    Poll::Pending => break,
                    Poll::Ready(None) => {
                        this.enqueued = None;
                        break;
                    }
                    Poll::Ready(Some(Enqueued::Task(task))) => this.in_progress.push(task),
                    Poll::Ready(Some(Enqueued::Terminate(result))) => {
                        this.in_progress = FuturesUnordered::new();
                        return Poll::Ready(result);
                    }
                }
            }
        }

        loop {
            match Pin::new(&mut this.in_progress).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(()))) => this.reaper.task_succeeded(),
                Poll::Ready(Some(Err(e))) => this.reaper.task_failed(e),
                Poll::Ready(None) if this.enqueued.is_none() => return Poll::Ready(Ok(())),
                Poll::Ready(None) => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{TaskReaper, TaskSet};
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use futures::FutureExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl TaskReaper<String> for Recorder {
        fn task_succeeded(&mut self) {
            self.0.borrow_mut().push("ok".into());
        }
        fn task_failed(&mut self, error: String) {
            self.0.borrow_mut().push(error);
        }
    }

    #[test]
    fn reaps_then_terminates() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (mut handle, set) = TaskSet::new(Box::new(Recorder(log.clone())));
        handle.add(async { Ok(()) });
        handle.add(async { Err("bad".to_string()) });

        let (tx, rx) = oneshot::channel::<()>();
        let mut terminator = handle.clone();
        handle.add(rx.map(move |_| {
            terminator.terminate(Err("done".to_string()));
            Ok(())
        }));
        drop(tx);

        assert_eq!(block_on(set), Err("done".to_string()));
        let log = log.borrow();
        assert!(log.contains(&"ok".to_string()));
        assert!(log.contains(&"bad".to_string()));
    }

    #[test]
    fn finishes_when_handles_are_gone() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (mut handle, set) = TaskSet::<String>::new(Box::new(Recorder(log.clone())));
        handle.add(async { Ok(()) });
        drop(handle);
        assert_eq!(block_on(set), Ok(()));
        assert_eq!(*log.borrow(), vec!["ok".to_string()]);
    }
}
